// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine error taxonomy.
//!
//! Every failure is tagged with an [`ErrorClass`] so callers cannot swallow
//! a fatal condition by accident:
//!
//! | Class | Handling |
//! |---|---|
//! | `Skip` | Source excluded for the object and its subtree |
//! | `Retryable` | Object left not-done; retried by the dispatcher or the next run |
//! | `Fatal` | Propagates and aborts the enclosing level; needs an operator |

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::revision::Level;
use crate::storage::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Skip,
    Retryable,
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skip => write!(f, "skip"),
            Self::Retryable => write!(f, "retryable"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("source '{source_name}' unavailable for {object}: {message}")]
    SourceUnavailable {
        source_name: String,
        object: String,
        message: String,
    },

    #[error("source '{source_name}' failed for {object}: {message}")]
    Source {
        source_name: String,
        object: String,
        message: String,
    },

    #[error("duplicate natural id '{natural_id}' in {level} listing of source '{source_name}' under '{parent}'")]
    DuplicateNaturalId {
        level: Level,
        natural_id: String,
        source_name: String,
        parent: String,
    },

    #[error("hash mismatch for {level} '{natural_id}' from '{source_name}': expected {expected}, computed {actual}")]
    HashMismatch {
        level: Level,
        natural_id: String,
        source_name: String,
        expected: String,
        actual: String,
    },

    #[error("transfer integrity failure for instance '{natural_id}': {message}")]
    TransferIntegrity { natural_id: String, message: String },

    #[error("archive integrity failure for series '{natural_id}': expected {expected} payloads, found {found}")]
    ArchiveIntegrity {
        natural_id: String,
        expected: usize,
        found: usize,
    },

    #[error("unit '{unit}' failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        unit: String,
        attempts: usize,
        last_error: String,
    },

    #[error("worker {worker} failed: {message}")]
    Worker { worker: usize, message: String },

    #[error("{level} '{natural_id}' left not done")]
    Incomplete { level: Level, natural_id: String },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("access token refresh failed: {0}")]
    Token(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("run timed out after {0:?}")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::SourceUnavailable { .. } => ErrorClass::Skip,
            Self::Source { .. }
            | Self::TransferIntegrity { .. }
            | Self::ArchiveIntegrity { .. }
            | Self::RetriesExhausted { .. }
            | Self::Worker { .. }
            | Self::Incomplete { .. }
            | Self::Token(_)
            | Self::Storage(_)
            | Self::Io(_)
            | Self::Timeout(_) => ErrorClass::Retryable,
            Self::DuplicateNaturalId { .. }
            | Self::HashMismatch { .. }
            | Self::Invariant(_)
            | Self::Config(_) => ErrorClass::Fatal,
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::Source { .. } => "source",
            Self::DuplicateNaturalId { .. } => "duplicate_natural_id",
            Self::HashMismatch { .. } => "hash_mismatch",
            Self::TransferIntegrity { .. } => "transfer_integrity",
            Self::ArchiveIntegrity { .. } => "archive_integrity",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Worker { .. } => "worker",
            Self::Incomplete { .. } => "incomplete",
            Self::Invariant(_) => "invariant",
            Self::Token(_) => "token",
            Self::Storage(_) => "storage",
            Self::Io(_) => "io",
            Self::Timeout(_) => "timeout",
            Self::Config(_) => "config",
        }
    }
}
