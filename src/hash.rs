// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::flow::{Flow, FLOW_WORDS};

pub fn hash64(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}

/// Rolling hash over the masked words `[start, end)` of `flow`, seeded
/// with the previous stage's hash so staged probes compose.
pub fn hash_masked_range(flow: &Flow, mask: &Flow, start: usize, end: usize, seed: u64) -> u64 {
    debug_assert!(start <= end && end <= FLOW_WORDS);

    let mut buf = [0u8; FLOW_WORDS * 8];
    let mut len = 0;

    for w in start..end {
        let masked = flow.words()[w] & mask.words()[w];
        buf[len..len + 8].copy_from_slice(&masked.to_le_bytes());
        len += 8;
    }

    xxhash_rust::xxh3::xxh3_64_with_seed(&buf[..len], seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn rolling_hash_composes() {
        let mut flow = Flow::new();
        flow.set(crate::FieldId::TcpDst, 80);

        let mask = Flow([u64::MAX; FLOW_WORDS]);

        let staged = {
            let h = hash_masked_range(&flow, &mask, 0, 3, 0);
            hash_masked_range(&flow, &mask, 3, FLOW_WORDS, h)
        };
        let direct = {
            let h = hash_masked_range(&flow, &mask, 0, 3, 0);
            hash_masked_range(&flow, &mask, 3, FLOW_WORDS, h)
        };
        assert_eq!(staged, direct);
    }

    #[test]
    fn masked_bits_only() {
        let mask = {
            let mut m = Flow::new();
            m.set(crate::FieldId::TcpDst, 0xffff);
            m
        };

        let mut a = Flow::new();
        a.set(crate::FieldId::TcpDst, 80);
        let mut b = a;
        b.set(crate::FieldId::TcpSrc, 5555);

        assert_eq!(
            hash_masked_range(&a, &mask, 0, FLOW_WORDS, 0),
            hash_masked_range(&b, &mask, 0, FLOW_WORDS, 0),
        );
    }
}
