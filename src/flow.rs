// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Packet header vectors, field layout and wildcard masks.
//!
//! A [`Flow`] is a flat vector of [`FLOW_WORDS`] 64-bit words with a fixed
//! field layout described by [`FieldId`]. Matching never interprets field
//! contents; everything operates on word-positioned bit masks.

/// Number of 64-bit words in a [`Flow`].
pub const FLOW_WORDS: usize = 6;

/// Default staged-lookup segment boundaries, as word offsets.
///
/// The default stages the header vector into metadata, L2, L3 and L4
/// ranges: `[0,1)`, `[1,4)`, `[4,5)`, `[5,6)`.
pub const DEFAULT_FLOW_SEGMENTS: [u8; 3] = [1, 4, 5];

/// Identifies a packet header field within a [`Flow`].
///
/// Each field occupies a fixed bit range of a fixed word. Prefix semantics
/// (for tries and prefix matches) are MSB-first within the field.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FieldId {
    /// OpenFlow metadata register (word 0, 64 bits)
    Metadata,

    /// Ingress port (word 1, bits 0..32)
    InPort,

    /// Ethernet type (word 1, bits 32..48)
    EthType,

    /// IP protocol (word 1, bits 48..56)
    IpProto,

    /// Ethernet source address (word 2, bits 0..48)
    EthSrc,

    /// Ethernet destination address (word 3, bits 0..48)
    EthDst,

    /// IPv4 source address (word 4, bits 0..32)
    Ipv4Src,

    /// IPv4 destination address (word 4, bits 32..64)
    Ipv4Dst,

    /// TCP/UDP source port (word 5, bits 0..16)
    TcpSrc,

    /// TCP/UDP destination port (word 5, bits 16..32)
    TcpDst,
}

impl FieldId {
    /// All fields in layout order.
    pub const ALL: [Self; 10] = [
        Self::Metadata,
        Self::InPort,
        Self::EthType,
        Self::IpProto,
        Self::EthSrc,
        Self::EthDst,
        Self::Ipv4Src,
        Self::Ipv4Dst,
        Self::TcpSrc,
        Self::TcpDst,
    ];

    /// The word this field lives in.
    #[must_use]
    pub const fn word(self) -> usize {
        match self {
            Self::Metadata => 0,
            Self::InPort | Self::EthType | Self::IpProto => 1,
            Self::EthSrc => 2,
            Self::EthDst => 3,
            Self::Ipv4Src | Self::Ipv4Dst => 4,
            Self::TcpSrc | Self::TcpDst => 5,
        }
    }

    /// Bit offset of the field within its word.
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Metadata
            | Self::InPort
            | Self::EthSrc
            | Self::EthDst
            | Self::Ipv4Src
            | Self::TcpSrc => 0,
            Self::EthType | Self::Ipv4Dst => 32,
            Self::IpProto => 48,
            Self::TcpDst => 16,
        }
    }

    /// Width of the field in bits.
    #[must_use]
    pub const fn width(self) -> u32 {
        match self {
            Self::Metadata => 64,
            Self::EthSrc | Self::EthDst => 48,
            Self::InPort | Self::Ipv4Src | Self::Ipv4Dst => 32,
            Self::EthType | Self::TcpSrc | Self::TcpDst => 16,
            Self::IpProto => 8,
        }
    }

    /// Field-space mask: `width` low bits set.
    pub(crate) const fn value_mask(self) -> u64 {
        match self.width() {
            64 => u64::MAX,
            w => (1u64 << w) - 1,
        }
    }

    /// Word-positioned mask covering the entire field.
    pub(crate) const fn word_mask(self) -> u64 {
        self.value_mask() << self.shift()
    }

    /// Word-positioned mask covering the `plen` most significant bits of
    /// the field. `plen` is clamped to the field width.
    pub(crate) fn prefix_word_mask(self, plen: u8) -> u64 {
        if plen == 0 {
            return 0;
        }
        let width = self.width();
        let plen = u32::from(plen).min(width);
        let field = (u64::MAX << (width - plen)) & self.value_mask();
        field << self.shift()
    }

    /// Reads the field value out of a flow.
    #[must_use]
    pub fn get(self, flow: &Flow) -> u64 {
        (flow.0[self.word()] >> self.shift()) & self.value_mask()
    }

    /// Field value shifted so its MSB lands in bit 63, for MSB-first
    /// prefix walks.
    pub(crate) fn get_aligned(self, flow: &Flow) -> u64 {
        self.get(flow) << (64 - self.width())
    }
}

/// A flat packet header vector.
///
/// Produced by the packet parser (outside this crate); the classifier only
/// reads it. The inner words are public so collaborators can construct
/// flows without going through per-field setters.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct Flow(#[doc(hidden)] pub [u64; FLOW_WORDS]);

impl Flow {
    /// Creates an all-zero flow.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field value.
    ///
    /// # Panics
    ///
    /// Panics if `value` does not fit the field width.
    pub fn set(&mut self, field: FieldId, value: u64) {
        assert!(
            value & !field.value_mask() == 0,
            "value does not fit field {field:?}",
        );
        let word = &mut self.0[field.word()];
        *word = (*word & !field.word_mask()) | (value << field.shift());
    }

    /// Reads a field value.
    #[must_use]
    pub fn get(&self, field: FieldId) -> u64 {
        field.get(self)
    }

    /// The metadata register (word 0).
    #[must_use]
    pub fn metadata(&self) -> u64 {
        self.0[0]
    }

    /// Raw words.
    #[must_use]
    pub fn words(&self) -> &[u64; FLOW_WORDS] {
        &self.0
    }

    /// `self & mask`, word-wise.
    pub(crate) fn masked(&self, mask: &Self) -> [u64; FLOW_WORDS] {
        let mut out = [0u64; FLOW_WORDS];
        for (o, (f, m)) in out.iter_mut().zip(self.0.iter().zip(mask.0.iter())) {
            *o = f & m;
        }
        out
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:016x}/{:016x}/{:016x}/{:016x}/{:016x}/{:016x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5],
        )
    }
}

/// Accumulating wildcard mask produced by lookups.
///
/// Starts all-zero (fully wildcarded); every lookup step ORs in the bits
/// it examined ("un-wildcarding"). False 1-bits are harmless, false
/// 0-bits are forbidden.
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct Wildcards(#[doc(hidden)] pub [u64; FLOW_WORDS]);

impl Wildcards {
    /// Creates a fully wildcarded mask.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw mask words; 1-bits were consulted during lookup.
    #[must_use]
    pub fn words(&self) -> &[u64; FLOW_WORDS] {
        &self.0
    }

    /// Returns `true` if `a` and `b` agree on every un-wildcarded bit,
    /// i.e. the two flows are equivalent under this mask.
    #[must_use]
    pub fn equivalent(&self, a: &Flow, b: &Flow) -> bool {
        self.0
            .iter()
            .zip(a.0.iter().zip(b.0.iter()))
            .all(|(w, (x, y))| (x ^ y) & w == 0)
    }

    /// The un-wildcarded bits of `field`, in field space.
    #[must_use]
    pub fn field_bits(&self, field: FieldId) -> u64 {
        (self.0[field.word()] >> field.shift()) & field.value_mask()
    }

    pub(crate) fn fold_masked_range(&mut self, mask: &Flow, start: usize, end: usize) {
        for w in start..end {
            self.0[w] |= mask.0[w];
        }
    }

    pub(crate) fn fold_mask(&mut self, mask: &Flow) {
        self.fold_masked_range(mask, 0, FLOW_WORDS);
    }

    pub(crate) fn unwildcard_field(&mut self, field: FieldId) {
        self.0[field.word()] |= field.word_mask();
    }

    pub(crate) fn unwildcard_field_prefix(&mut self, field: FieldId, nbits: u8) {
        self.0[field.word()] |= field.prefix_word_mask(nbits);
    }
}

impl std::fmt::Debug for Wildcards {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "wc[{:016x}/{:016x}/{:016x}/{:016x}/{:016x}/{:016x}]",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5],
        )
    }
}
