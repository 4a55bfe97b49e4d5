// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::traits::{
    CatalogConnector, CatalogStore, EgestReport, LevelCounts, RevisionBatch, StorageError,
};
use crate::revision::{Level, Revision, SurrogateId};

#[derive(Default)]
struct CatalogState {
    revisions: HashMap<SurrogateId, Revision>,
    by_natural: HashMap<(Level, String), Vec<SurrogateId>>,
    edges: HashMap<SurrogateId, BTreeSet<SurrogateId>>,
}

impl CatalogState {
    fn upsert(&mut self, revision: Revision) {
        let id = revision.surrogate_id;
        if !self.revisions.contains_key(&id) {
            self.by_natural
                .entry((revision.level, revision.natural_id.clone()))
                .or_default()
                .push(id);
        }
        self.revisions.insert(id, revision);
    }

    fn remove(&mut self, id: &SurrogateId) {
        if let Some(rev) = self.revisions.remove(id) {
            let key = (rev.level, rev.natural_id);
            if let Some(ids) = self.by_natural.get_mut(&key) {
                ids.retain(|other| other != id);
                if ids.is_empty() {
                    self.by_natural.remove(&key);
                }
            }
        }
        self.edges.remove(id);
        for children in self.edges.values_mut() {
            children.remove(id);
        }
    }

    fn revisions_of(&self, level: Level, natural_id: &str) -> impl Iterator<Item = &Revision> {
        self.by_natural
            .get(&(level, natural_id.to_string()))
            .into_iter()
            .flatten()
            .filter_map(|id| self.revisions.get(id))
    }
}

/// In-process catalog. Clones share the same state, so every worker
/// "connection" sees the same arena.
#[derive(Clone, Default)]
pub struct MemoryCatalog {
    state: Arc<RwLock<CatalogState>>,
    connects: Arc<AtomicUsize>,
}

impl MemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total revisions stored, live or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().revisions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().revisions.is_empty()
    }

    /// Snapshot of every revision, for invariant checks.
    #[must_use]
    pub fn all(&self) -> Vec<Revision> {
        self.state.read().revisions.values().cloned().collect()
    }

    /// Number of handles opened through [`CatalogConnector::connect`].
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn get(&self, id: &SurrogateId) -> Result<Option<Revision>, StorageError> {
        Ok(self.state.read().revisions.get(id).cloned())
    }

    async fn live(&self, level: Level, natural_id: &str) -> Result<Option<Revision>, StorageError> {
        Ok(self
            .state
            .read()
            .revisions_of(level, natural_id)
            .find(|rev| rev.is_live())
            .cloned())
    }

    async fn history(&self, level: Level, natural_id: &str) -> Result<Vec<Revision>, StorageError> {
        let state = self.state.read();
        let mut revisions: Vec<Revision> = state.revisions_of(level, natural_id).cloned().collect();
        revisions.sort_by_key(|rev| (rev.rev_version, rev.final_version == 0));
        Ok(revisions)
    }

    async fn children(&self, parent: &SurrogateId) -> Result<Vec<Revision>, StorageError> {
        let state = self.state.read();
        let mut children: Vec<Revision> = state
            .edges
            .get(parent)
            .into_iter()
            .flatten()
            .filter_map(|id| state.revisions.get(id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.natural_id.cmp(&b.natural_id));
        Ok(children)
    }

    async fn not_done(&self, level: Level) -> Result<Vec<Revision>, StorageError> {
        let state = self.state.read();
        let mut pending: Vec<Revision> = state
            .revisions
            .values()
            .filter(|rev| rev.level == level && rev.is_live() && !rev.done)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.natural_id.cmp(&b.natural_id));
        Ok(pending)
    }

    async fn counts(&self, level: Level) -> Result<LevelCounts, StorageError> {
        let state = self.state.read();
        let mut counts = LevelCounts::default();
        for rev in state.revisions.values().filter(|rev| rev.level == level) {
            if rev.is_live() {
                counts.live += 1;
                if rev.done {
                    counts.done += 1;
                } else {
                    counts.not_done += 1;
                }
            } else {
                counts.retired += 1;
            }
        }
        Ok(counts)
    }

    async fn commit(&self, batch: RevisionBatch) -> Result<(), StorageError> {
        let mut state = self.state.write();
        for revision in batch.upserts() {
            state.upsert(revision.clone());
        }
        for (from, to) in batch.copied_links() {
            let children = state.edges.get(from).cloned().unwrap_or_default();
            state.edges.entry(*to).or_default().extend(children);
        }
        for (parent, child) in batch.unlinks() {
            if let Some(children) = state.edges.get_mut(parent) {
                children.remove(child);
            }
        }
        for (parent, child) in batch.links() {
            state.edges.entry(*parent).or_default().insert(*child);
        }
        for id in batch.discards() {
            state.remove(id);
        }
        Ok(())
    }

    async fn egest_version(&self, version: u32) -> Result<EgestReport, StorageError> {
        let mut state = self.state.write();
        let minted: Vec<SurrogateId> = state
            .revisions
            .values()
            .filter(|rev| rev.rev_version == version)
            .map(|rev| rev.surrogate_id)
            .collect();
        for id in &minted {
            state.remove(id);
        }

        let mut restored = 0u64;
        if version > 1 {
            for rev in state.revisions.values_mut() {
                if rev.final_version == version - 1 {
                    rev.final_version = 0;
                    restored += 1;
                }
            }
        }

        Ok(EgestReport {
            deleted: minted.len() as u64,
            restored,
        })
    }
}

#[async_trait]
impl CatalogConnector for MemoryCatalog {
    async fn connect(&self) -> Result<Arc<dyn CatalogStore>, StorageError> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(self.clone()))
    }
}
