// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::flow::{Flow, Wildcards, FLOW_WORDS};
use crate::hash::hash_masked_range;
use crate::rule::{ClsMatch, Rule};
use crate::tag::Tag;
use crate::version::Version;
use crate::MAX_INDICES;
use crossbeam_skiplist::SkipMap;
use std::cmp::Reverse;
use std::sync::atomic::{
    AtomicI64, AtomicU8, AtomicUsize,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};
use std::sync::Arc;

/// Orders bucket entries so that all rules with the same masked flow form
/// a contiguous chain, highest priority first, newest insertion first on
/// a priority tie.
///
/// Head promotion on removal is just the skiplist's atomic entry unlink:
/// readers walking the chain observe either the old entry set or the new
/// one, never a torn chain.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord)]
struct BucketKey {
    hash: u64,
    key: [u64; FLOW_WORDS],
    rank: Reverse<i32>,
    seq: Reverse<u64>,
}

impl BucketKey {
    fn chain_start(hash: u64, key: [u64; FLOW_WORDS]) -> Self {
        Self {
            hash,
            key,
            rank: Reverse(i32::MAX),
            seq: Reverse(u64::MAX),
        }
    }

    fn chain_end(hash: u64, key: [u64; FLOW_WORDS]) -> Self {
        Self {
            hash,
            key,
            rank: Reverse(i32::MIN),
            seq: Reverse(0),
        }
    }

    fn priority_start(hash: u64, key: [u64; FLOW_WORDS], priority: i32) -> Self {
        Self {
            hash,
            key,
            rank: Reverse(priority),
            seq: Reverse(u64::MAX),
        }
    }

    fn priority_end(hash: u64, key: [u64; FLOW_WORDS], priority: i32) -> Self {
        Self {
            hash,
            key,
            rank: Reverse(priority),
            seq: Reverse(0),
        }
    }
}

/// A staged-lookup index: counts rules per rolling hash of the first
/// stages of the mask.
///
/// A reader may see a stale entry whose count already dropped to zero
/// (a harmless false positive); it can never miss a live rule's hash,
/// because fresh entries are inserted with their count already at one.
struct StageIndex {
    end_word: usize,
    filter: SkipMap<u64, AtomicUsize>,
}

impl StageIndex {
    fn new(end_word: usize) -> Self {
        Self {
            end_word,
            filter: SkipMap::new(),
        }
    }

    fn add(&self, hash: u64) {
        if let Some(entry) = self.filter.get(&hash) {
            entry.value().fetch_add(1, AcqRel);
        } else {
            self.filter.get_or_insert_with(hash, || AtomicUsize::new(1));
        }
    }

    fn sub(&self, hash: u64) {
        if let Some(entry) = self.filter.get(&hash) {
            if entry.value().fetch_sub(1, AcqRel) == 1 {
                entry.remove();
            }
        } else {
            debug_assert!(false, "stage index underflow");
        }
    }

    fn may_contain(&self, hash: u64) -> bool {
        self.filter
            .get(&hash)
            .is_some_and(|e| e.value().load(Acquire) > 0)
    }
}

/// All rules that share one match mask.
///
/// Rules live in a skiplist keyed by [`BucketKey`]; the staged indices
/// allow a lookup to prove a miss after hashing only a prefix of the
/// header vector, which keeps the wildcard mask narrow.
pub(crate) struct Subtable {
    mask: Flow,
    tag: Tag,
    indices: Vec<StageIndex>,
    rules: SkipMap<BucketKey, Arc<ClsMatch>>,
    max_priority: AtomicI64,
    n_rules: AtomicUsize,
    trie_plen: [AtomicU8; crate::MAX_TRIES],
}

impl Subtable {
    /// Creates an empty subtable for `mask`.
    ///
    /// A staged index is placed at each segment boundary that ends a
    /// range actually constrained by the mask; a boundary at or past the
    /// last constrained word would duplicate the full-mask hash and is
    /// dropped.
    pub fn new(mask: Flow, flow_segments: &[u8]) -> Self {
        let mask_end = (0..FLOW_WORDS)
            .rev()
            .find(|w| mask.words()[*w] != 0)
            .map_or(0, |w| w + 1);

        let mut indices = Vec::new();
        let mut prev = 0usize;
        for &boundary in flow_segments {
            let boundary = usize::from(boundary);
            if boundary >= mask_end {
                break;
            }
            if mask.words()[prev..boundary].iter().any(|w| *w != 0) {
                indices.push(StageIndex::new(boundary));
                prev = boundary;
            }
        }
        debug_assert!(indices.len() <= MAX_INDICES);

        let tag = if mask.words()[0] == u64::MAX {
            Tag::of_mask(&mask)
        } else {
            Tag::ALL
        };

        Self {
            mask,
            tag,
            indices,
            rules: SkipMap::new(),
            max_priority: AtomicI64::new(i64::MIN),
            n_rules: AtomicUsize::new(0),
            trie_plen: [const { AtomicU8::new(0) }; crate::MAX_TRIES],
        }
    }

    pub fn mask(&self) -> &Flow {
        &self.mask
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Whether rules in here match on the full metadata register, making
    /// the subtable eligible for partition pruning.
    pub fn constrains_metadata(&self) -> bool {
        self.mask.words()[0] == u64::MAX
    }

    pub fn max_priority(&self) -> i64 {
        self.max_priority.load(Acquire)
    }

    pub fn len(&self) -> usize {
        self.n_rules.load(Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mask prefix length on the trie in `slot` (0 = unconstrained).
    pub fn trie_plen(&self, slot: usize) -> u8 {
        self.trie_plen[slot].load(Relaxed)
    }

    pub fn set_trie_plen(&self, slot: usize, plen: u8) {
        self.trie_plen[slot].store(plen, Relaxed);
    }

    /// Rolling stage hashes of `flow & mask`, plus the full-mask hash.
    fn hashes(&self, flow: &Flow) -> ([u64; MAX_INDICES], u64) {
        let mut stage = [0u64; MAX_INDICES];
        let mut seed = 0;
        let mut prev = 0;
        for (h, index) in stage.iter_mut().zip(self.indices.iter()) {
            seed = hash_masked_range(flow, &self.mask, prev, index.end_word, seed);
            *h = seed;
            prev = index.end_word;
        }
        (
            stage,
            hash_masked_range(flow, &self.mask, prev, FLOW_WORDS, seed),
        )
    }

    /// Installs `m`, displacing an equal-`(match, priority)` entry that is
    /// visible at `version` if one exists (returned). For a displacement
    /// every count stays as it is; the entry swap is the whole change.
    pub fn insert(&self, m: Arc<ClsMatch>, version: Version) -> Option<Arc<ClsMatch>> {
        let value = m.rule().spec().value();
        let (stage_hashes, hash) = self.hashes(value);
        let key = value.masked(&self.mask);
        let priority = m.priority();

        let displaced = self
            .rules
            .range(
                BucketKey::priority_start(hash, key, priority)
                    ..=BucketKey::priority_end(hash, key, priority),
            )
            .find(|entry| entry.value().visible_in(version));

        if displaced.is_none() {
            // Index filters first: a reader must never find the rule while
            // its stage hashes are still missing.
            for (h, index) in stage_hashes.iter().zip(self.indices.iter()) {
                index.add(*h);
            }
        }

        // For a displacement, link the new entry before unlinking the old
        // one: the chain is never transiently empty.
        self.rules.insert(
            BucketKey {
                hash,
                key,
                rank: Reverse(priority),
                seq: Reverse(m.seq()),
            },
            m,
        );

        match displaced {
            Some(entry) => {
                let old = entry.value().clone();
                entry.remove();
                Some(old)
            }
            None => {
                self.n_rules.fetch_add(1, AcqRel);
                self.max_priority.fetch_max(i64::from(priority), AcqRel);
                None
            }
        }
    }

    /// Unlinks `rule` (located by identity) and returns its image.
    pub fn remove_rule(&self, rule: &Rule) -> Option<Arc<ClsMatch>> {
        let value = rule.spec().value();
        let (stage_hashes, hash) = self.hashes(value);
        let key = value.masked(&self.mask);
        let priority = rule.priority();

        let mut removed = None;
        for entry in self.rules.range(
            BucketKey::priority_start(hash, key, priority)
                ..=BucketKey::priority_end(hash, key, priority),
        ) {
            if std::ptr::eq(Arc::as_ptr(entry.value().rule()), rule) {
                removed = Some(entry.value().clone());
                entry.remove();
                break;
            }
        }
        let removed = removed?;

        for (h, index) in stage_hashes.iter().zip(self.indices.iter()) {
            index.sub(*h);
        }
        self.n_rules.fetch_sub(1, AcqRel);
        if i64::from(priority) == self.max_priority.load(Acquire) {
            self.recompute_max_priority();
        }

        Some(removed)
    }

    fn recompute_max_priority(&self) {
        let mut max = i64::MIN;
        for entry in self.rules.iter() {
            max = max.max(i64::from(entry.value().priority()));
        }
        self.max_priority.store(max, Release);
    }

    /// Staged lookup.
    ///
    /// Returns the highest-priority visible plain match of the bucket, if
    /// any; visible conjunctive matches encountered on the way are pushed
    /// onto `conj_out` for top-level resolution. Every header bit that
    /// was hashed gets un-wildcarded - including on a miss, where only the
    /// stages probed so far count.
    pub fn find(
        &self,
        flow: &Flow,
        version: Version,
        conj_out: &mut Vec<Arc<ClsMatch>>,
        mut wildcards: Option<&mut Wildcards>,
    ) -> Option<Arc<ClsMatch>> {
        let mut seed = 0;
        let mut prev = 0;
        for index in &self.indices {
            seed = hash_masked_range(flow, &self.mask, prev, index.end_word, seed);
            if !index.may_contain(seed) {
                if let Some(wc) = wildcards.as_deref_mut() {
                    wc.fold_masked_range(&self.mask, 0, index.end_word);
                }
                return None;
            }
            prev = index.end_word;
        }
        let hash = hash_masked_range(flow, &self.mask, prev, FLOW_WORDS, seed);

        // The final stage examines the whole mask, hit or miss.
        if let Some(wc) = wildcards.as_deref_mut() {
            wc.fold_mask(&self.mask);
        }

        let key = flow.masked(&self.mask);
        for entry in self
            .rules
            .range(BucketKey::chain_start(hash, key)..=BucketKey::chain_end(hash, key))
        {
            let m = entry.value();
            if !m.visible_in(version) {
                continue;
            }
            if m.conjunctions().is_empty() {
                return Some(m.clone());
            }
            conj_out.push(m.clone());
        }

        None
    }

    /// O(log n) exact probe by (match value, priority), version filtered.
    pub fn find_exact(
        &self,
        value: &Flow,
        priority: i32,
        version: Version,
    ) -> Option<Arc<ClsMatch>> {
        let (_, hash) = self.hashes(value);
        let key = value.masked(&self.mask);

        self.rules
            .range(
                BucketKey::priority_start(hash, key, priority)
                    ..=BucketKey::priority_end(hash, key, priority),
            )
            .find(|e| e.value().visible_in(version))
            .map(|e| e.value().clone())
    }

    /// Snapshot of every installed image, for iteration and rebuilds.
    pub fn collect_matches(&self) -> Vec<Arc<ClsMatch>> {
        self.rules.iter().map(|e| e.value().clone()).collect()
    }
}
