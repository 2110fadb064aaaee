// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::classifier::Classifier;
use crate::flow_match::{mask_contains, FlowMatch};
use crate::rule::{ClsMatch, Rule};
use crate::subtable::Subtable;
use crate::version::Version;
use std::sync::Arc;

/// Version-filtered traversal over a classifier's rules.
///
/// Created by [`Classifier::iter`] / [`Classifier::iter_target`]. The
/// cursor snapshots the subtable list up front and each subtable's chain
/// as it reaches it, so concurrent inserts and removes never invalidate
/// it; modifications may or may not be visited.
///
/// With a target, subtables whose mask does not cover every bit the
/// target constrains are skipped wholesale; remaining rules are filtered
/// individually.
pub struct Cursor {
    version: Version,
    target: Option<FlowMatch>,
    subtables: Vec<Arc<Subtable>>,
    subtable_idx: usize,
    matches: Vec<Arc<ClsMatch>>,
    match_idx: usize,
}

impl Cursor {
    pub(crate) fn new(cls: &Classifier, target: Option<FlowMatch>, version: Version) -> Self {
        Self {
            version,
            target,
            subtables: cls.subtables_snapshot(),
            subtable_idx: 0,
            matches: Vec::new(),
            match_idx: 0,
        }
    }
}

impl Iterator for Cursor {
    type Item = Arc<Rule>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(m) = self.matches.get(self.match_idx) {
                self.match_idx += 1;

                if !m.visible_in(self.version) {
                    continue;
                }
                if let Some(target) = &self.target {
                    if !m.rule().is_loose_match(target) {
                        continue;
                    }
                }
                return Some(m.rule().clone());
            }

            let subtable = self.subtables.get(self.subtable_idx)?;
            self.subtable_idx += 1;

            if let Some(target) = &self.target {
                // A subtable more general than the target cannot hold
                // rules falling within it.
                if !mask_contains(subtable.mask(), target.mask()) {
                    continue;
                }
            }

            self.matches = subtable.collect_matches();
            self.match_idx = 0;
        }
    }
}
