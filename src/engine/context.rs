// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::types::FailedObject;
use crate::checkpoint::CheckpointLog;
use crate::config::{CatalogConfig, SkipPolicy};
use crate::error::EngineError;
use crate::revision::{Level, Revision};
use crate::sources::{MultiSourceView, SourceMask};
use crate::storage::{CatalogConnector, CatalogStore};
use crate::transfer::ContentTransfer;

/// Everything a build step needs, passed explicitly.
///
/// Cheap to clone. Workers get a copy with their own repository handle
/// via [`with_store`](Self::with_store); the rest is shared.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn CatalogStore>,
    pub connector: Arc<dyn CatalogConnector>,
    pub view: Arc<MultiSourceView>,
    pub transfer: Arc<ContentTransfer>,
    pub checkpoint: Option<Arc<CheckpointLog>>,
    pub config: Arc<CatalogConfig>,
    pub skip_policy: Arc<SkipPolicy>,
    /// Version being built
    pub version: u32,
    failures: Arc<Mutex<BTreeMap<(Level, String), FailedObject>>>,
}

impl EngineContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn CatalogStore>,
        connector: Arc<dyn CatalogConnector>,
        view: Arc<MultiSourceView>,
        transfer: Arc<ContentTransfer>,
        checkpoint: Option<Arc<CheckpointLog>>,
        config: Arc<CatalogConfig>,
        skip_policy: Arc<SkipPolicy>,
        version: u32,
    ) -> Self {
        Self {
            store,
            connector,
            view,
            transfer,
            checkpoint,
            config,
            skip_policy,
            version,
            failures: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    #[must_use]
    pub fn with_store(&self, store: Arc<dyn CatalogStore>) -> Self {
        Self {
            store,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn sources(&self) -> usize {
        self.view.len()
    }

    /// Sources skipped for `revision` given what its parent skipped.
    #[must_use]
    pub fn effective_skip(&self, revision: &Revision, inherited: SourceMask) -> SourceMask {
        inherited | revision.skip_mask | self.rule_skip(revision)
    }

    /// Sources excluded for `revision` by configured skip rules.
    #[must_use]
    pub fn rule_skip(&self, revision: &Revision) -> SourceMask {
        if revision.level == Level::Collection {
            self.skip_policy.for_collection(&revision.natural_id)
        } else {
            SourceMask::NONE
        }
    }

    /// Stamp for revisions retired while building this version.
    #[must_use]
    pub fn retire_stamp(&self) -> u32 {
        self.version.saturating_sub(1)
    }

    /// A revision minted while building this version (never part of a
    /// completed version, so it may be edited or dropped).
    #[must_use]
    pub fn is_draft(&self, revision: &Revision) -> bool {
        revision.rev_version == self.version
    }

    /// Remember the last error that left an object not done.
    pub fn record_failure(&self, level: Level, natural_id: &str, error: &EngineError) {
        self.failures.lock().insert(
            (level, natural_id.to_string()),
            FailedObject {
                level,
                natural_id: natural_id.to_string(),
                kind: error.kind(),
                class: error.class(),
                message: error.to_string(),
            },
        );
    }

    pub(crate) fn take_failures(&self) -> Vec<FailedObject> {
        std::mem::take(&mut *self.failures.lock()).into_values().collect()
    }
}
