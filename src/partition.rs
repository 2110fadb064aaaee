// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::tag::Tag;
use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{
    AtomicU64, AtomicUsize,
    Ordering::{AcqRel, Acquire, Release},
};

/// Per-metadata-value partition entry.
///
/// `tags` is the union of the tags of every subtable holding at least one
/// rule that matches on this metadata value. It only ever widens while
/// the entry lives (false 1-bits are fine, false 0-bits are not); the
/// entry disappears once its rule count drops to zero.
struct Partition {
    tags: AtomicU64,
    n_refs: AtomicUsize,
}

/// Index from metadata value to the subtable tags relevant to it.
///
/// Readers consult it once per lookup; only the writer mutates it.
#[derive(Default)]
pub(crate) struct PartitionMap {
    partitions: SkipMap<u64, Partition>,
}

impl PartitionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// The tag union for `metadata`, or `None` if no rule matches on it.
    pub fn tags_for(&self, metadata: u64) -> Option<Tag> {
        self.partitions
            .get(&metadata)
            .map(|e| Tag::from_bits(e.value().tags.load(Acquire)))
    }

    /// Accounts for one more rule with this metadata value, widening the
    /// partition's tag union.
    pub fn add_rule(&self, metadata: u64, tag: Tag) {
        let entry = self.partitions.get_or_insert_with(metadata, || Partition {
            tags: AtomicU64::new(0),
            n_refs: AtomicUsize::new(0),
        });
        entry.value().tags.fetch_or(tag.as_bits(), Release);
        entry.value().n_refs.fetch_add(1, AcqRel);
    }

    /// Accounts for one removed rule; drops the partition when the last
    /// rule is gone. The tag union is not narrowed while the entry lives.
    pub fn remove_rule(&self, metadata: u64) {
        if let Some(entry) = self.partitions.get(&metadata) {
            if entry.value().n_refs.fetch_sub(1, AcqRel) == 1 {
                entry.remove();
            }
        } else {
            debug_assert!(false, "removing rule from missing partition");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn partition_lifecycle() {
        let map = PartitionMap::new();
        assert!(map.is_empty());
        assert_eq!(None, map.tags_for(1));

        let a = Tag::from_bits(0b01);
        let b = Tag::from_bits(0b10);

        map.add_rule(1, a);
        map.add_rule(1, b);
        map.add_rule(2, b);

        let tags = map.tags_for(1).unwrap();
        assert!(tags.intersects(a));
        assert!(tags.intersects(b));
        assert!(map.tags_for(2).unwrap().intersects(b));

        map.remove_rule(1);
        // Still referenced; union kept.
        assert!(map.tags_for(1).unwrap().intersects(a));

        map.remove_rule(1);
        assert_eq!(None, map.tags_for(1));
        assert!(!map.is_empty());

        map.remove_rule(2);
        assert!(map.is_empty());
    }
}
