// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::flow::{FieldId, Flow, FLOW_WORDS};

/// A match specification: a `(value, mask)` pair over the flow field space.
///
/// The invariant `value & mask == value` is maintained by construction;
/// setters silently mask the supplied value.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct FlowMatch {
    value: Flow,
    mask: Flow,
}

impl FlowMatch {
    /// Creates a catch-all match (empty mask, matches every flow).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The match value (already masked).
    #[must_use]
    pub fn value(&self) -> &Flow {
        &self.value
    }

    /// The match mask.
    #[must_use]
    pub fn mask(&self) -> &Flow {
        &self.mask
    }

    /// Requires `field` to equal `value` exactly.
    pub fn set_exact(&mut self, field: FieldId, value: u64) {
        self.set_masked(field, value, field.value_mask());
    }

    /// Requires `field & mask == value & mask`, both in field space.
    ///
    /// # Panics
    ///
    /// Panics if `mask` does not fit the field width.
    pub fn set_masked(&mut self, field: FieldId, value: u64, mask: u64) {
        assert!(
            mask & !field.value_mask() == 0,
            "mask does not fit field {field:?}",
        );
        let value = value & mask;
        let mw = &mut self.mask.0[field.word()];
        *mw = (*mw & !field.word_mask()) | (mask << field.shift());
        let vw = &mut self.value.0[field.word()];
        *vw = (*vw & !field.word_mask()) | (value << field.shift());
    }

    /// Requires the `plen` most significant bits of `field` to equal those
    /// of `value`.
    pub fn set_prefix(&mut self, field: FieldId, value: u64, plen: u8) {
        let mask = field.prefix_word_mask(plen) >> field.shift();
        self.set_masked(field, value, mask);
    }

    /// Returns `true` if no field is constrained.
    #[must_use]
    pub fn is_catchall(&self) -> bool {
        self.mask.0 == [0u64; FLOW_WORDS]
    }

    /// Returns `true` if `flow` is accepted by this match.
    #[must_use]
    pub fn matches(&self, flow: &Flow) -> bool {
        self.value
            .0
            .iter()
            .zip(flow.0.iter().zip(self.mask.0.iter()))
            .all(|(v, (f, m))| f & m == *v)
    }

    /// Returns `true` if this match falls within `criteria`: every flow it
    /// accepts is also accepted by `criteria`.
    #[must_use]
    pub fn falls_within(&self, criteria: &Self) -> bool {
        mask_contains(&self.mask, &criteria.mask)
            && self
                .value
                .0
                .iter()
                .zip(criteria.value.0.iter().zip(criteria.mask.0.iter()))
                .all(|(v, (cv, cm))| v & cm == *cv)
    }

    /// Returns `true` if some flow is accepted by both matches.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.value
            .0
            .iter()
            .zip(other.value.0.iter())
            .zip(self.mask.0.iter().zip(other.mask.0.iter()))
            .all(|((v1, v2), (m1, m2))| (v1 ^ v2) & (m1 & m2) == 0)
    }

    /// The prefix length of the mask on `field`: the number of leading
    /// (most significant) 1-bits.
    ///
    /// Mask bits below the first 0-bit do not count; a rule still has to
    /// match its leading prefix, which is what trie pruning relies on.
    #[must_use]
    pub fn prefix_len(&self, field: FieldId) -> u8 {
        let aligned = field.get_aligned(&self.mask);
        #[allow(clippy::cast_possible_truncation)]
        let ones = aligned.leading_ones().min(field.width()) as u8;
        ones
    }
}

/// True if every 1-bit of `inner` is also set in `outer`.
pub(crate) fn mask_contains(outer: &Flow, inner: &Flow) -> bool {
    inner
        .0
        .iter()
        .zip(outer.0.iter())
        .all(|(i, o)| i & !o == 0)
}

impl std::fmt::Debug for FlowMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_catchall() {
            return write!(f, "*");
        }

        let mut first = true;
        for field in FieldId::ALL {
            let mask = field.get(&self.mask);
            if mask == 0 {
                continue;
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if mask == field.value_mask() {
                write!(f, "{field:?}={:#x}", field.get(&self.value))?;
            } else {
                write!(f, "{field:?}={:#x}/{mask:#x}", field.get(&self.value))?;
            }
        }
        Ok(())
    }
}
