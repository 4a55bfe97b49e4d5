// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Version lifecycle: open, resume, accept or roll back.
//!
//! Each catalog version is one revision of the root object. A run resumes
//! a root that is not done; otherwise it clones the done root as the next
//! version. A version whose root content equals its predecessor's is
//! egested and the previous version becomes live again.

use tracing::{info, warn};

use super::context::EngineContext;
use super::types::VersionOutcome;
use crate::error::EngineError;
use crate::revision::{Level, Revision, SourceHashes, ROOT_NATURAL_ID};
use crate::storage::{CatalogStore, LevelCounts, RevisionBatch};

/// The root to build and whether it is being resumed.
pub async fn open_version(store: &dyn CatalogStore, sources: usize) -> Result<(Revision, bool), EngineError> {
    match store.live(Level::Version, ROOT_NATURAL_ID).await? {
        None => {
            let root = Revision::root(1, sources);
            let mut batch = RevisionBatch::new();
            batch.put(root.clone());
            store.commit(batch).await?;
            info!(version = 1, surrogate_id = %root.surrogate_id, "Opened first version");
            Ok((root, false))
        }
        Some(root) if !root.done => {
            info!(version = root.rev_version, surrogate_id = %root.surrogate_id, "Resuming version");
            Ok((root, true))
        }
        Some(previous) => {
            let version = previous.rev_version + 1;
            let mut next = previous.revise(None, version);
            next.source_hashes = SourceHashes::empty(sources);
            let mut retired = previous.clone();
            retired.retire(previous.rev_version);

            let mut batch = RevisionBatch::new();
            batch.put(retired);
            batch.put(next.clone());
            batch.copy_links(previous.surrogate_id, next.surrogate_id);
            store.commit(batch).await?;
            info!(version, previous = previous.rev_version, surrogate_id = %next.surrogate_id, "Opened version");
            Ok((next, false))
        }
    }
}

/// Decide the fate of the version once the build returned.
/// Returns the outcome and the version live afterwards.
pub async fn finalize(ctx: &EngineContext, root: &Revision) -> Result<(VersionOutcome, u32), EngineError> {
    let version = ctx.version;
    let root = ctx
        .store
        .get(&root.surrogate_id)
        .await?
        .ok_or_else(|| EngineError::Invariant(format!("version root {} vanished", root.surrogate_id)))?;

    let outcome = if !root.done {
        VersionOutcome::Incomplete
    } else {
        let previous = match root.predecessor {
            Some(id) => ctx.store.get(&id).await?,
            None => None,
        };
        match previous {
            Some(previous) if previous.aggregate_hash == root.aggregate_hash => {
                let report = ctx.store.egest_version(version).await?;
                warn!(
                    version,
                    deleted = report.deleted,
                    restored = report.restored,
                    "Version identical to previous, rolled back"
                );
                VersionOutcome::RolledBack
            }
            _ => {
                info!(version, aggregate_hash = %root.aggregate_hash, "Version accepted");
                VersionOutcome::Accepted
            }
        }
    };

    let live_version = if outcome == VersionOutcome::RolledBack {
        version - 1
    } else {
        version
    };
    crate::metrics::record_version_outcome(&outcome.to_string());
    crate::metrics::set_current_version(live_version);
    Ok((outcome, live_version))
}

/// Counts for every level, root first, also published as gauges.
pub async fn level_counts(store: &dyn CatalogStore) -> Result<Vec<(Level, LevelCounts)>, EngineError> {
    let mut counts = Vec::with_capacity(Level::ALL.len());
    for level in Level::ALL {
        let c = store.counts(level).await?;
        crate::metrics::set_level_counts(level.as_str(), c.done, c.not_done);
        counts.push((level, c));
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCatalog;

    #[tokio::test]
    async fn test_first_open_creates_version_one() {
        let store = MemoryCatalog::new();
        let (root, resumed) = open_version(&store, 2).await.unwrap();
        assert!(!resumed);
        assert_eq!(root.rev_version, 1);
        assert!(root.is_new);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_not_done_root_is_resumed() {
        let store = MemoryCatalog::new();
        let (first, _) = open_version(&store, 1).await.unwrap();
        let (again, resumed) = open_version(&store, 1).await.unwrap();
        assert!(resumed);
        assert_eq!(again.surrogate_id, first.surrogate_id);
    }

    #[tokio::test]
    async fn test_done_root_is_cloned_as_next_version() {
        let store = MemoryCatalog::new();
        let (mut first, _) = open_version(&store, 1).await.unwrap();
        let child = Revision::new_child(
            Level::Collection,
            "C1".into(),
            first.surrogate_id,
            1,
            SourceHashes::empty(1),
            crate::sources::SourceMask::NONE,
        );
        first.done = true;
        let mut batch = RevisionBatch::new();
        batch.put(first.clone());
        batch.put(child.clone());
        batch.link(first.surrogate_id, child.surrogate_id);
        store.commit(batch).await.unwrap();

        let (next, resumed) = open_version(&store, 1).await.unwrap();
        assert!(!resumed);
        assert_eq!(next.rev_version, 2);
        assert_eq!(next.predecessor, Some(first.surrogate_id));
        assert!(!next.is_new && !next.done && !next.expanded);

        let old = store.get(&first.surrogate_id).await.unwrap().unwrap();
        assert_eq!(old.final_version, 1);
        let children = store.children(&next.surrogate_id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].surrogate_id, child.surrogate_id);
    }

    #[tokio::test]
    async fn test_level_counts_cover_every_level() {
        let store = MemoryCatalog::new();
        open_version(&store, 1).await.unwrap();
        let counts = level_counts(&store).await.unwrap();
        assert_eq!(counts.len(), 6);
        assert_eq!(counts[0].0, Level::Version);
        assert_eq!(counts[0].1.not_done, 1);
    }
}
