// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A versioned flow classifier, the data structure backing each table of a
//! software OpenFlow-style switch.
//!
//! ##### About
//!
//! The classifier stores prioritized packet-matching rules ([`Rule`]) and,
//! given a header vector ([`Flow`]), returns the highest-priority rule
//! that accepts it. As a side effect, lookups accumulate a wildcard mask
//! ([`Wildcards`]) recording exactly which header bits were consulted, so
//! a downstream fast-path cache can install one entry covering every
//! packet that is equivalent under that mask.
//!
//! Rules sharing one mask live in a hash-style subtable probed in stages,
//! so a miss examines (and un-wildcards) as few bits as possible. Prefix
//! tries over configured fields and a metadata partition index prune
//! subtables before they are probed at all.
//!
//! Readers never block: any number of threads may perform lookups and
//! iteration concurrently with a single writer. Every rule carries a
//! `[add, remove)` visibility interval over [`Version`]s, which makes
//! multi-rule updates atomic: stage everything at a future version, then
//! move lookups to that version.
//!
//! # Example usage
//!
//! ```
//! use flow_classifier::{Classifier, FieldId, Flow, FlowMatch, Rule, Wildcards};
//! use std::sync::Arc;
//!
//! let classifier = Classifier::default();
//!
//! // "TCP port 80 -> priority 5"
//! let mut spec = FlowMatch::new();
//! spec.set_exact(FieldId::TcpDst, 80);
//! let rule = Arc::new(Rule::new(spec, 5));
//!
//! classifier.insert(rule.clone(), 0, &[]);
//!
//! let mut flow = Flow::new();
//! flow.set(FieldId::TcpDst, 80);
//! flow.set(FieldId::TcpSrc, 49152);
//!
//! let mut wc = Wildcards::new();
//! let hit = classifier.lookup(&flow, 0, Some(&mut wc)).unwrap();
//! assert!(Arc::ptr_eq(&hit, &rule));
//!
//! // The source port played no role in the decision.
//! assert_eq!(0, wc.field_bits(FieldId::TcpSrc));
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]

mod classifier;
mod cursor;
mod error;
mod flow;
mod flow_match;
mod hash;
mod partition;
mod priority_vector;
mod rule;
mod subtable;
mod tag;
mod trie;
mod version;

/// Maximum number of staged-lookup indices per subtable.
pub const MAX_INDICES: usize = 3;

/// Maximum number of prefix tries per classifier.
pub const MAX_TRIES: usize = 3;

pub use {
    classifier::Classifier,
    cursor::Cursor,
    error::{Error, Result},
    flow::{FieldId, Flow, Wildcards, DEFAULT_FLOW_SEGMENTS, FLOW_WORDS},
    flow_match::FlowMatch,
    rule::{Conjunction, Rule},
    version::{Version, VersionCounter, MAX_VERSION, MIN_VERSION, NOT_REMOVED_VERSION},
};
