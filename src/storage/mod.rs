// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Catalog repository and owned payload storage.
//!
//! The repository is an arena of [`Revision`](crate::revision::Revision)
//! records keyed by surrogate id, plus a separate parent→child edge relation.
//! Revisions never hold each other; children are found by querying edges.
//! All writes go through [`RevisionBatch`], which commits atomically.

pub mod memory;
pub mod objects;
pub mod sql;
pub mod traits;

pub use memory::MemoryCatalog;
pub use objects::{FsObjectStore, MemoryObjectStore};
pub use sql::{SqlCatalog, SqlConnector};
pub use traits::{
    CatalogConnector, CatalogStore, EgestReport, LevelCounts, ObjectMeta, ObjectStore,
    RevisionBatch, StorageError,
};
