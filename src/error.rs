// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::flow::FieldId;

/// Represents errors that can occur in the classifier
#[derive(Debug, Eq, PartialEq)]
pub enum Error {
    /// More prefix-tracking fields were requested than the classifier
    /// supports (got, max)
    PrefixFieldLimit(usize, usize),

    /// The same field was requested twice for prefix tracking
    DuplicatePrefixField(FieldId),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClassifierError: {self:?}")
    }
}

impl std::error::Error for Error {}

/// Classifier result
pub type Result<T> = std::result::Result<T, Error>;
