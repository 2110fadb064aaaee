// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::flow::Flow;
use crate::flow_match::FlowMatch;
use crate::version::{Version, Visibility};
use std::sync::Arc;

/// One disjunct of a conjunctive match.
///
/// A rule carrying `(id, clause, n_clauses)` only produces a lookup
/// result when, for the same `id`, all `n_clauses` distinct clause
/// indices are matched by the flow at the same or higher priority.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Conjunction {
    /// Identifies the conjunction this rule participates in.
    pub id: u32,

    /// This rule's clause index, `0 <= clause < n_clauses`.
    pub clause: u8,

    /// Total number of clauses in the conjunction.
    pub n_clauses: u8,
}

/// A prioritized packet-matching rule.
///
/// Rules are shared with the classifier as `Arc<Rule>`; identity is
/// pointer identity. The visibility interval lives on the rule so that
/// soft-deletion ([`Rule::make_invisible_in_version`]) is reachable
/// without going through the classifier.
pub struct Rule {
    spec: FlowMatch,
    priority: i32,
    visibility: Visibility,
}

impl Rule {
    /// Creates a rule from a match specification and a priority.
    ///
    /// Larger priorities win. The rule is not part of any classifier
    /// until inserted.
    #[must_use]
    pub fn new(spec: FlowMatch, priority: i32) -> Self {
        Self {
            spec,
            priority,
            visibility: Visibility::default(),
        }
    }

    /// The match specification.
    #[must_use]
    pub fn spec(&self) -> &FlowMatch {
        &self.spec
    }

    /// The rule priority; larger numbers are higher priorities.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Returns `true` if the rule matches every packet.
    #[must_use]
    pub fn is_catchall(&self) -> bool {
        self.spec.is_catchall()
    }

    /// Returns `true` if this rule accepts `flow`.
    #[must_use]
    pub fn matches(&self, flow: &Flow) -> bool {
        self.spec.matches(flow)
    }

    /// Content equality: same match and same priority.
    ///
    /// Distinct from identity - two [`Rule`] instances can be equal.
    #[must_use]
    pub fn equal(&self, other: &Self) -> bool {
        self.priority == other.priority && self.spec == other.spec
    }

    /// Returns `true` if every flow this rule accepts is also accepted by
    /// `criteria`. Used for target-filtered iteration.
    #[must_use]
    pub fn is_loose_match(&self, criteria: &FlowMatch) -> bool {
        self.spec.falls_within(criteria)
    }

    /// Returns `true` if the rule is visible to lookups at `version`.
    #[must_use]
    pub fn visible_in_version(&self, version: Version) -> bool {
        self.visibility.visible_in(version)
    }

    /// Makes the rule invisible to lookups at `version` and beyond.
    ///
    /// The rule stays in the classifier; readers at older versions keep
    /// seeing it. Call [`crate::Classifier::remove`] once no reader uses
    /// an affected version anymore.
    pub fn make_invisible_in_version(&self, version: Version) {
        self.visibility.set_remove_version(version);
    }

    /// Reverts [`Rule::make_invisible_in_version`].
    pub fn restore_visibility(&self) {
        self.visibility.set_remove_version(crate::version::NOT_REMOVED_VERSION);
    }

    pub(crate) fn set_add_version(&self, version: Version) {
        self.visibility.set_add_version(version);
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} pri={}", self.spec, self.priority)
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The classifier's internal image of an installed rule.
///
/// Lives in its subtable's bucket chain. Priority and visibility are
/// reachable through the rule; the conjunction set and the insertion
/// sequence number (for the newest-first duplicate tie break) are
/// recorded here.
pub(crate) struct ClsMatch {
    rule: Arc<Rule>,
    conjunctions: Box<[Conjunction]>,
    seq: u64,
}

impl ClsMatch {
    pub fn new(rule: Arc<Rule>, conjunctions: &[Conjunction], seq: u64) -> Self {
        Self {
            rule,
            conjunctions: conjunctions.into(),
            seq,
        }
    }

    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    pub fn priority(&self) -> i32 {
        self.rule.priority()
    }

    pub fn visible_in(&self, version: Version) -> bool {
        self.rule.visible_in_version(version)
    }

    pub fn conjunctions(&self) -> &[Conjunction] {
        &self.conjunctions
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}
