// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::merkle::Hash;
use crate::revision::ObjectRef;

#[derive(Error, Debug, Clone)]
pub enum SourceError {
    /// The source cannot answer right now. Callers skip the source for the
    /// object; they never read this as "empty".
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("source backend error: {0}")]
    Backend(String),
}

/// One external catalog source.
///
/// Natural ids are unique per level across the hierarchy, so every call is
/// addressed by `(level, natural_id)`. Implementations must be safe to call
/// from many workers at once and must not retry internally: one
/// `Unavailable` is enough for the caller to skip the source.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Natural ids of the children of `parent`, in source order. Duplicates
    /// are returned as-is so the caller can reject them.
    async fn list_children(&self, parent: &ObjectRef) -> Result<Vec<String>, SourceError>;

    /// The object's hash as this source reports it now;
    /// [`EMPTY_HASH`](crate::merkle::EMPTY_HASH) if the source does not know it.
    async fn object_hash(&self, object: &ObjectRef) -> Result<Hash, SourceError>;

    /// Descriptive, never-hashed fields (DOI, license, ...).
    async fn metadata(&self, _object: &ObjectRef) -> Result<Option<Value>, SourceError> {
        Ok(None)
    }

    /// Raw payload bytes of an instance.
    async fn fetch_payload(&self, instance: &ObjectRef) -> Result<Vec<u8>, SourceError>;
}
