// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::merkle::Hash;
use crate::revision::{Level, Revision, SurrogateId};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{id}': expected hash {expected}, got {actual}")]
    Corruption {
        id: String,
        expected: String,
        actual: String,
    },
}

/// One atomic unit of catalog writes.
///
/// Applied in order: upserts, edge copies, unlinks, links, discards. Either
/// all of it lands or none of it does.
#[derive(Debug, Default, Clone)]
pub struct RevisionBatch {
    upserts: BTreeMap<SurrogateId, Revision>,
    copy_links: Vec<(SurrogateId, SurrogateId)>,
    unlinks: Vec<(SurrogateId, SurrogateId)>,
    links: Vec<(SurrogateId, SurrogateId)>,
    discards: Vec<SurrogateId>,
}

impl RevisionBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a revision. A later put of the same id wins.
    pub fn put(&mut self, revision: Revision) {
        self.upserts.insert(revision.surrogate_id, revision);
    }

    /// Give `to` every child edge `from` has.
    pub fn copy_links(&mut self, from: SurrogateId, to: SurrogateId) {
        self.copy_links.push((from, to));
    }

    pub fn link(&mut self, parent: SurrogateId, child: SurrogateId) {
        self.links.push((parent, child));
    }

    pub fn unlink(&mut self, parent: SurrogateId, child: SurrogateId) {
        self.unlinks.push((parent, child));
    }

    /// Delete a draft revision (one minted in a version that never
    /// completed) together with every edge touching it.
    pub fn discard(&mut self, id: SurrogateId) {
        self.upserts.remove(&id);
        self.discards.push(id);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty()
            && self.copy_links.is_empty()
            && self.unlinks.is_empty()
            && self.links.is_empty()
            && self.discards.is_empty()
    }

    pub fn upserts(&self) -> impl Iterator<Item = &Revision> {
        self.upserts.values()
    }

    #[must_use]
    pub fn copied_links(&self) -> &[(SurrogateId, SurrogateId)] {
        &self.copy_links
    }

    #[must_use]
    pub fn unlinks(&self) -> &[(SurrogateId, SurrogateId)] {
        &self.unlinks
    }

    #[must_use]
    pub fn links(&self) -> &[(SurrogateId, SurrogateId)] {
        &self.links
    }

    #[must_use]
    pub fn discards(&self) -> &[SurrogateId] {
        &self.discards
    }
}

/// Per-level object counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelCounts {
    pub live: u64,
    pub done: u64,
    pub not_done: u64,
    pub retired: u64,
}

/// What rolling a version back touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EgestReport {
    pub deleted: u64,
    pub restored: u64,
}

/// The catalog repository: an id-indexed arena of revisions plus the
/// parent→child edge relation.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get(&self, id: &SurrogateId) -> Result<Option<Revision>, StorageError>;

    /// The live revision of a logical object, if any.
    async fn live(&self, level: Level, natural_id: &str) -> Result<Option<Revision>, StorageError>;

    /// Every revision of a logical object, oldest first.
    async fn history(&self, level: Level, natural_id: &str) -> Result<Vec<Revision>, StorageError>;

    /// Children linked under `parent`, ordered by natural id.
    async fn children(&self, parent: &SurrogateId) -> Result<Vec<Revision>, StorageError>;

    /// Live revisions at `level` that have not reached done.
    async fn not_done(&self, level: Level) -> Result<Vec<Revision>, StorageError>;

    async fn counts(&self, level: Level) -> Result<LevelCounts, StorageError>;

    /// Apply a batch atomically.
    async fn commit(&self, batch: RevisionBatch) -> Result<(), StorageError>;

    /// Roll version `version` back: delete every revision minted in it
    /// (with its edges) and make live again every revision it retired.
    async fn egest_version(&self, version: u32) -> Result<EgestReport, StorageError>;

    /// Release backend connections. The handle is not used afterwards.
    async fn close(&self) {}
}

/// Opens independent repository handles, one per worker.
#[async_trait]
pub trait CatalogConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn CatalogStore>, StorageError>;
}

/// Size and content hash of a stored payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub hash: Hash,
}

/// Owned payload storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    /// Size and hash of the stored copy, read back from the store.
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Upload a staged local file.
    async fn put_file(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| StorageError::Backend(format!("read {}: {}", path.display(), e)))?;
        self.put(key, bytes).await
    }
}
