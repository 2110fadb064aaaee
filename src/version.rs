// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{
    atomic::{
        AtomicU64,
        Ordering::{Acquire, Release},
    },
    Arc,
};

/// Lookup version - a monotonically increasing natural number
///
/// Every lookup happens at a specific version, and every rule carries a
/// `[add, remove)` visibility interval over versions. This enables
/// atomic multi-rule transactions: stage changes at a future version,
/// then start using that version for lookups.
pub type Version = u64;

/// Default version number to use on insertions.
pub const MIN_VERSION: Version = 0;

/// Highest version number that can be used for lookups.
pub const MAX_VERSION: Version = u64::MAX - 1;

/// Sentinel "removed version" of a rule that has not been removed.
pub const NOT_REMOVED_VERSION: Version = u64::MAX;

/// Thread-safe version number generator
///
/// # Examples
///
/// ```
/// use flow_classifier::VersionCounter;
///
/// let versions = VersionCounter::default();
///
/// let v1 = versions.next();
/// let v2 = versions.next();
/// assert!(v2 > v1);
/// ```
#[derive(Clone, Default, Debug)]
pub struct VersionCounter(Arc<AtomicU64>);

impl VersionCounter {
    /// Creates a new counter, setting it to some previous value
    #[must_use]
    pub fn new(prev: Version) -> Self {
        Self(Arc::new(AtomicU64::new(prev)))
    }

    /// Gets the current version, without incrementing the counter.
    #[must_use]
    pub fn get(&self) -> Version {
        self.0.load(Acquire)
    }

    /// Gets the next version number.
    #[must_use]
    #[allow(clippy::missing_panics_doc, reason = "we should never run out of u64s")]
    pub fn next(&self) -> Version {
        let version = self.0.fetch_add(1, Release);

        assert!(version < MAX_VERSION, "Ran out of version numbers");

        version
    }
}

/// The `[add, remove)` visibility interval of an installed rule.
///
/// `add` is fixed at insertion time; `remove` starts out as
/// [`NOT_REMOVED_VERSION`] and is lowered (atomically, so concurrent
/// lookups see either value) to soft-delete the rule.
#[derive(Debug)]
pub struct Visibility {
    add: AtomicU64,
    remove: AtomicU64,
}

impl Default for Visibility {
    fn default() -> Self {
        Self {
            add: AtomicU64::new(MIN_VERSION),
            remove: AtomicU64::new(NOT_REMOVED_VERSION),
        }
    }
}

impl Visibility {
    /// Returns `true` if visible at `version`.
    #[must_use]
    pub fn visible_in(&self, version: Version) -> bool {
        self.add.load(Acquire) <= version && version < self.remove.load(Acquire)
    }

    /// The version this interval starts at.
    #[must_use]
    pub fn add_version(&self) -> Version {
        self.add.load(Acquire)
    }

    /// The version this interval ends at ([`NOT_REMOVED_VERSION`] if open).
    #[must_use]
    pub fn remove_version(&self) -> Version {
        self.remove.load(Acquire)
    }

    pub(crate) fn set_add_version(&self, version: Version) {
        self.add.store(version, Release);
    }

    pub(crate) fn set_remove_version(&self, version: Version) {
        self.remove.store(version, Release);
    }
}
