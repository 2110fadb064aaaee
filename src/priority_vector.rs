// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::subtable::Subtable;
use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex};

/// One published subtable with the priority it was published at.
#[derive(Clone)]
pub(crate) struct RankedSubtable {
    pub priority: i64,
    pub subtable: Arc<Subtable>,
}

/// Subtables in descending max-priority order, published as an immutable
/// snapshot.
///
/// The writer edits a scratch vector and republishes with an atomic
/// pointer swap; lookups iterate whichever snapshot they loaded and can
/// short-circuit as soon as the recorded priority cannot beat the best
/// match found so far. While the classifier is deferred, edits accumulate
/// in the scratch only.
pub(crate) struct PriorityVector {
    published: ArcSwap<Vec<RankedSubtable>>,
    scratch: Mutex<Vec<RankedSubtable>>,
}

impl PriorityVector {
    pub fn new() -> Self {
        Self {
            published: ArcSwap::from_pointee(Vec::new()),
            scratch: Mutex::new(Vec::new()),
        }
    }

    /// The current reader-visible snapshot.
    pub fn snapshot(&self) -> Arc<Vec<RankedSubtable>> {
        self.published.load_full()
    }

    #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
    pub fn insert(&self, subtable: Arc<Subtable>, priority: i64) {
        let mut scratch = self.scratch.lock().expect("lock is poisoned");
        scratch.push(RankedSubtable { priority, subtable });
    }

    #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
    pub fn remove(&self, subtable: &Arc<Subtable>) {
        let mut scratch = self.scratch.lock().expect("lock is poisoned");
        scratch.retain(|e| !Arc::ptr_eq(&e.subtable, subtable));
    }

    #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
    pub fn change_priority(&self, subtable: &Arc<Subtable>, priority: i64) {
        let mut scratch = self.scratch.lock().expect("lock is poisoned");
        for e in scratch.iter_mut() {
            if Arc::ptr_eq(&e.subtable, subtable) {
                e.priority = priority;
            }
        }
    }

    /// Sorts the scratch ordering and swaps it in for readers.
    #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
    pub fn publish(&self) {
        let mut scratch = self.scratch.lock().expect("lock is poisoned");
        scratch.sort_by(|a, b| b.priority.cmp(&a.priority));
        self.published.store(Arc::new(scratch.clone()));
    }
}
