// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::cursor::Cursor;
use crate::flow::{FieldId, Flow, Wildcards, FLOW_WORDS};
use crate::flow_match::FlowMatch;
use crate::partition::PartitionMap;
use crate::priority_vector::PriorityVector;
use crate::rule::{ClsMatch, Conjunction, Rule};
use crate::subtable::Subtable;
use crate::tag::Tag;
use crate::trie::{PrefixTrie, TrieLookup};
use crate::version::Version;
use crate::{Error, MAX_INDICES, MAX_TRIES};
use arc_swap::ArcSwapOption;
use crossbeam_skiplist::SkipMap;
use log::{debug, trace, warn};
use rustc_hash::FxHashMap;
use std::sync::atomic::{
    AtomicBool, AtomicU64, AtomicUsize,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};
use std::sync::Arc;

/// Per-lookup, lazily evaluated trie state: each trie is walked at most
/// once per lookup, the first time a subtable constrains its field.
struct TrieCtx {
    trie: Arc<PrefixTrie>,
    result: Option<TrieLookup>,
}

impl TrieCtx {
    fn lookup(&mut self, flow: &Flow) -> TrieLookup {
        match self.result {
            Some(r) => r,
            None => {
                let r = self.trie.lookup(self.trie.field().get(flow));
                self.result = Some(r);
                r
            }
        }
    }
}

/// A flow classifier: a set of prioritized [`Rule`]s with versioned
/// visibility, answering "highest-priority match for this header vector"
/// while accounting for every header bit it consulted.
///
/// # Concurrency
///
/// Any number of reader threads may call [`Classifier::lookup`], the
/// exact finds and iteration concurrently with each other and with one
/// writer. Writers (insert/replace/remove, [`Classifier::defer`] /
/// [`Classifier::publish`], [`Classifier::set_prefix_fields`]) require
/// external mutual exclusion among themselves; all methods take `&self`.
///
/// # Versioning
///
/// Rules become visible at their insertion version and stay visible until
/// soft-deleted via [`Rule::make_invisible_in_version`]. Readers at older
/// versions keep their view; the physical [`Classifier::remove`] is the
/// writer's job once no reader uses an affected version anymore. Memory
/// is reclaimed by reference counting - a reader holding a rule keeps it
/// alive past removal.
pub struct Classifier {
    flow_segments: Vec<u8>,
    subtables: SkipMap<[u64; FLOW_WORDS], Arc<Subtable>>,
    ranked: PriorityVector,
    partitions: PartitionMap,
    tries: [ArcSwapOption<PrefixTrie>; MAX_TRIES],
    n_rules: AtomicUsize,
    publish: AtomicBool,
    seq: AtomicU64,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(&crate::flow::DEFAULT_FLOW_SEGMENTS)
    }
}

impl Classifier {
    /// Creates an empty classifier.
    ///
    /// `flow_segments` lists the word offsets at which staged lookup may
    /// stop early; see [`crate::DEFAULT_FLOW_SEGMENTS`].
    ///
    /// # Panics
    ///
    /// Panics if more than [`MAX_INDICES`] boundaries are given, or if
    /// they are not strictly increasing within `1..FLOW_WORDS`.
    #[must_use]
    pub fn new(flow_segments: &[u8]) -> Self {
        assert!(
            flow_segments.len() <= MAX_INDICES,
            "too many flow segments",
        );
        let mut prev = 0u8;
        for &b in flow_segments {
            assert!(
                b > prev && usize::from(b) < FLOW_WORDS,
                "flow segments must be strictly increasing word offsets",
            );
            prev = b;
        }

        Self {
            flow_segments: flow_segments.to_vec(),
            subtables: SkipMap::new(),
            ranked: PriorityVector::new(),
            partitions: PartitionMap::new(),
            tries: [const { ArcSwapOption::const_empty() }; MAX_TRIES],
            n_rules: AtomicUsize::new(0),
            publish: AtomicBool::new(true),
            seq: AtomicU64::new(0),
        }
    }

    /// Number of installed rules (including versioned soft-deleted ones
    /// that were not physically removed yet).
    #[must_use]
    pub fn count(&self) -> usize {
        self.n_rules.load(Acquire)
    }

    /// Returns `true` if no rule is installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Enters deferred mode: the published subtable ordering - and with
    /// it the visibility of new or emptied subtables to lookups - is not
    /// refreshed until [`Classifier::publish`].
    pub fn defer(&self) {
        self.publish.store(false, Release);
    }

    /// Leaves deferred mode and makes all deferred changes observable
    /// together.
    pub fn publish(&self) {
        self.publish.store(true, Release);
        self.ranked.publish();
    }

    fn maybe_publish(&self) {
        if self.publish.load(Acquire) {
            self.ranked.publish();
        }
    }

    /// Replaces the set of prefix-tracked fields (at most [`MAX_TRIES`]).
    ///
    /// Tries for fields that keep their slot are reused; others are
    /// rebuilt by walking every installed rule. Concurrent lookups use
    /// the old trie of each slot until its new one is swapped in.
    ///
    /// # Errors
    ///
    /// Rejects over-long or duplicate field lists; the existing
    /// configuration is retained unchanged.
    pub fn set_prefix_fields(&self, fields: &[FieldId]) -> crate::Result<()> {
        if fields.len() > MAX_TRIES {
            warn!(
                "rejecting prefix-field config with {} fields",
                fields.len(),
            );
            return Err(Error::PrefixFieldLimit(fields.len(), MAX_TRIES));
        }
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].contains(field) {
                warn!("rejecting duplicate prefix field {field:?}");
                return Err(Error::DuplicatePrefixField(*field));
            }
        }

        for slot in 0..MAX_TRIES {
            let field = fields.get(slot).copied();
            let current = self.tries[slot].load_full();

            match (current, field) {
                (None, None) => {}
                (Some(t), Some(f)) if t.field() == f => {}
                (_, None) => {
                    self.tries[slot].store(None);
                    for entry in self.subtables.iter() {
                        entry.value().set_trie_plen(slot, 0);
                    }
                }
                (_, Some(f)) => {
                    debug!("rebuilding prefix trie slot {slot} for {f:?}");
                    let trie = Arc::new(PrefixTrie::new(f));
                    for entry in self.subtables.iter() {
                        let subtable = entry.value();
                        let plen = mask_prefix_len(subtable.mask(), f);
                        subtable.set_trie_plen(slot, plen);
                        if plen > 0 {
                            for m in subtable.collect_matches() {
                                trie.insert(f.get(m.rule().spec().value()), plen);
                            }
                        }
                    }
                    self.tries[slot].store(Some(trie));
                }
            }
        }

        Ok(())
    }

    /// Adds `rule` with visibility `[version, not-removed)`.
    ///
    /// # Panics
    ///
    /// Panics if a rule with identical match and priority is already
    /// visible at `version`; use [`Classifier::replace`] for that.
    pub fn insert(&self, rule: Arc<Rule>, version: Version, conjunctions: &[Conjunction]) {
        let displaced = self.do_replace(rule, version, conjunctions);
        assert!(
            displaced.is_none(),
            "inserting a duplicate rule; use replace() instead",
        );
    }

    /// Adds `rule`; if a rule with identical match and priority is
    /// visible at `version`, it is atomically swapped out and returned.
    ///
    /// Mixing `replace` with versioned soft-deletes is not recommended;
    /// this implementation swaps exactly the entry it finds and keeps all
    /// structural invariants intact.
    pub fn replace(
        &self,
        rule: Arc<Rule>,
        version: Version,
        conjunctions: &[Conjunction],
    ) -> Option<Arc<Rule>> {
        self.do_replace(rule, version, conjunctions)
    }

    fn do_replace(
        &self,
        rule: Arc<Rule>,
        version: Version,
        conjunctions: &[Conjunction],
    ) -> Option<Arc<Rule>> {
        rule.set_add_version(version);
        let mask_words = *rule.spec().mask().words();

        let (subtable, created) = match self.subtables.get(&mask_words) {
            Some(entry) => (entry.value().clone(), false),
            None => {
                let subtable = Arc::new(Subtable::new(*rule.spec().mask(), &self.flow_segments));
                for slot in 0..MAX_TRIES {
                    if let Some(trie) = self.tries[slot].load_full() {
                        subtable
                            .set_trie_plen(slot, mask_prefix_len(subtable.mask(), trie.field()));
                    }
                }
                debug!("creating subtable for mask {:?}", subtable.mask());
                self.subtables.insert(mask_words, subtable.clone());
                (subtable, true)
            }
        };

        let seq = self.seq.fetch_add(1, Relaxed);
        let m = Arc::new(ClsMatch::new(rule.clone(), conjunctions, seq));
        let displaced = subtable.insert(m, version);

        if created {
            self.ranked.insert(subtable.clone(), subtable.max_priority());
        }

        if displaced.is_none() {
            self.n_rules.fetch_add(1, AcqRel);

            for slot in 0..MAX_TRIES {
                if let Some(trie) = self.tries[slot].load_full() {
                    let plen = subtable.trie_plen(slot);
                    if plen > 0 {
                        trie.insert(trie.field().get(rule.spec().value()), plen);
                    }
                }
            }

            if subtable.constrains_metadata() {
                self.partitions
                    .add_rule(rule.spec().value().metadata(), subtable.tag());
            }

            if !created {
                self.ranked.change_priority(&subtable, subtable.max_priority());
            }
        }

        self.maybe_publish();
        displaced.map(|m| m.rule().clone())
    }

    /// Unlinks `rule` (located by identity) and returns the installed
    /// handle, or `None` if it is not in the classifier.
    ///
    /// The caller is responsible for making sure no reader still needs
    /// the rule's versions; the memory itself stays alive as long as any
    /// reader holds the `Arc`.
    pub fn remove(&self, rule: &Rule) -> Option<Arc<Rule>> {
        let mask_words = *rule.spec().mask().words();
        let entry = self.subtables.get(&mask_words)?;
        let subtable = entry.value().clone();

        let removed = subtable.remove_rule(rule)?;
        self.n_rules.fetch_sub(1, AcqRel);

        for slot in 0..MAX_TRIES {
            if let Some(trie) = self.tries[slot].load_full() {
                let plen = subtable.trie_plen(slot);
                if plen > 0 {
                    trie.remove(trie.field().get(rule.spec().value()), plen);
                }
            }
        }

        if subtable.constrains_metadata() {
            self.partitions.remove_rule(rule.spec().value().metadata());
        }

        if subtable.is_empty() {
            debug!("dropping empty subtable for mask {:?}", subtable.mask());
            entry.remove();
            self.ranked.remove(&subtable);
        } else {
            self.ranked.change_priority(&subtable, subtable.max_priority());
        }

        self.maybe_publish();
        Some(removed.rule().clone())
    }

    /// Finds the highest-priority rule visible at `version` that matches
    /// `flow`.
    ///
    /// If `wildcards` is given, every header bit the lookup consulted is
    /// un-wildcarded into it - on misses as well as hits - so the caller
    /// can install a cache entry covering all flows equivalent under the
    /// resulting mask.
    pub fn lookup(
        &self,
        flow: &Flow,
        version: Version,
        mut wildcards: Option<&mut Wildcards>,
    ) -> Option<Arc<Rule>> {
        // Partition pruning by metadata.
        let relevant_tags = if self.partitions.is_empty() {
            Tag::ALL
        } else {
            // The partition decision depends on the metadata value, so it
            // must be exact in the output mask.
            if let Some(wc) = wildcards.as_deref_mut() {
                wc.unwildcard_field(FieldId::Metadata);
            }
            self.partitions
                .tags_for(flow.metadata())
                .unwrap_or(Tag::EMPTY)
        };

        let mut trie_ctx: [Option<TrieCtx>; MAX_TRIES] = [None, None, None];
        for (slot, ctx) in trie_ctx.iter_mut().enumerate() {
            *ctx = self.tries[slot].load_full().map(|trie| TrieCtx {
                trie,
                result: None,
            });
        }

        let snapshot = self.ranked.snapshot();
        let mut best: Option<Arc<ClsMatch>> = None;
        let mut hard_pri = i64::MIN;
        let mut conj_hits: Vec<Arc<ClsMatch>> = Vec::new();

        'subtables: for ranked in snapshot.iter() {
            if ranked.priority <= hard_pri {
                break;
            }
            let subtable = &ranked.subtable;

            if subtable.constrains_metadata() && !subtable.tag().intersects(relevant_tags) {
                continue;
            }

            // Prefix-trie pruning: a subtable needing a longer prefix than
            // any live rule has along this value cannot match. The bits
            // the trie examined to prove that must go into the mask.
            for (slot, ctx) in trie_ctx.iter_mut().enumerate() {
                let Some(ctx) = ctx.as_mut() else { continue };
                let plen = subtable.trie_plen(slot);
                if plen == 0 {
                    continue;
                }
                let evidence = ctx.lookup(flow);
                if plen > evidence.match_plen {
                    trace!(
                        "trie prune: subtable /{plen} > live /{}",
                        evidence.match_plen,
                    );
                    if let Some(wc) = wildcards.as_deref_mut() {
                        wc.unwildcard_field_prefix(ctx.trie.field(), evidence.checked_bits);
                    }
                    continue 'subtables;
                }
            }

            if let Some(m) = subtable.find(flow, version, &mut conj_hits, wildcards.as_deref_mut())
            {
                let priority = i64::from(m.priority());
                if priority > hard_pri {
                    hard_pri = priority;
                    best = Some(m);
                }
            }
        }

        if !conj_hits.is_empty() {
            if let Some(winner) = resolve_conjunctions(&conj_hits, hard_pri) {
                return Some(winner);
            }
        }

        best.map(|m| m.rule().clone())
    }

    /// Returns `true` if any other rule visible at `version` has the same
    /// priority as `rule` and accepts at least one common packet.
    #[must_use]
    pub fn rule_overlaps(&self, rule: &Rule, version: Version) -> bool {
        for entry in self.subtables.iter() {
            for m in entry.value().collect_matches() {
                let other = m.rule();
                if std::ptr::eq(Arc::as_ptr(other), rule) {
                    continue;
                }
                if other.priority() == rule.priority()
                    && m.visible_in(version)
                    && other.spec().overlaps(rule.spec())
                {
                    return true;
                }
            }
        }
        false
    }

    /// Finds the installed rule equal to `rule` (same mask, match and
    /// priority) visible at `version`.
    #[must_use]
    pub fn find_rule_exactly(&self, rule: &Rule, version: Version) -> Option<Arc<Rule>> {
        self.find_match_exactly(rule.spec(), rule.priority(), version)
    }

    /// Finds the installed rule with exactly this match and priority,
    /// visible at `version`.
    #[must_use]
    pub fn find_match_exactly(
        &self,
        spec: &FlowMatch,
        priority: i32,
        version: Version,
    ) -> Option<Arc<Rule>> {
        let entry = self.subtables.get(spec.mask().words())?;
        entry
            .value()
            .find_exact(spec.value(), priority, version)
            .map(|m| m.rule().clone())
    }

    /// Iterates every rule visible at `version`.
    ///
    /// Iteration goes over the subtable map directly, so rules staged
    /// while deferred are visited too. Concurrent modification is safe;
    /// rules not removed during the iteration are all visited.
    #[must_use]
    pub fn iter(&self, version: Version) -> Cursor {
        Cursor::new(self, None, version)
    }

    /// Iterates every rule visible at `version` that falls within
    /// `target`, skipping whole subtables whose mask cannot satisfy it.
    #[must_use]
    pub fn iter_target(&self, target: &FlowMatch, version: Version) -> Cursor {
        Cursor::new(self, Some(*target), version)
    }

    pub(crate) fn subtables_snapshot(&self) -> Vec<Arc<Subtable>> {
        self.subtables.iter().map(|e| e.value().clone()).collect()
    }
}

/// Prefix length of `mask` on `field`: leading 1-bits, MSB first.
fn mask_prefix_len(mask: &Flow, field: FieldId) -> u8 {
    #[allow(clippy::cast_possible_truncation)]
    let ones = field.get_aligned(mask).leading_ones().min(field.width()) as u8;
    ones
}

/// Picks the highest-priority conjunctive hit whose conjunction is
/// complete: all `n_clauses` distinct clauses of its id matched at the
/// same or higher priority. Returns `None` (leaving the plain best match
/// to stand) when no conjunction both completes and beats `hard_pri`.
fn resolve_conjunctions(conj_hits: &[Arc<ClsMatch>], hard_pri: i64) -> Option<Arc<Rule>> {
    // Highest priority at which each (id, clause) pair matched.
    let mut clause_pri: FxHashMap<(u32, u8), i32> = FxHashMap::default();
    for hit in conj_hits {
        for c in hit.conjunctions() {
            clause_pri
                .entry((c.id, c.clause))
                .and_modify(|p| *p = (*p).max(hit.priority()))
                .or_insert_with(|| hit.priority());
        }
    }

    let mut hits: Vec<&Arc<ClsMatch>> = conj_hits.iter().collect();
    hits.sort_by_key(|m| std::cmp::Reverse(m.priority()));

    for candidate in &hits {
        if i64::from(candidate.priority()) <= hard_pri {
            break;
        }

        for conj in candidate.conjunctions() {
            let complete = (0..conj.n_clauses).all(|clause| {
                clause_pri
                    .get(&(conj.id, clause))
                    .is_some_and(|p| *p >= candidate.priority())
            });
            if complete {
                return Some(candidate.rule().clone());
            }
        }
    }

    None
}
