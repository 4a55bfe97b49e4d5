// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciliation engine.
//!
//! One engine shape serves all six levels. Every revision moves through:
//!
//! ```text
//!            expand                 all children done,
//!   new ───────────────► expanded ─────────────────────► done
//!    │                      │        hashes verified
//!    │                      │
//!    └──── retire ──────────┴──────► retired (final_version = N-1)
//! ```
//!
//! Instances skip `expanded`: they are done once their payload is stored
//! and verified. A run opens (or resumes) a version, builds its root and
//! then accepts it, rolls it back when nothing changed, or leaves it
//! incomplete for the next run to resume.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use catalog_engine::{CatalogConfig, CatalogEngine, MemoryCatalog, MemoryObjectStore, MemorySource, SourceAdapter};
//!
//! # async fn demo() -> Result<(), catalog_engine::EngineError> {
//! let source: Arc<dyn SourceAdapter> = Arc::new(MemorySource::new("idc"));
//! let engine = CatalogEngine::new(
//!     CatalogConfig::default(),
//!     vec![source],
//!     Arc::new(MemoryCatalog::new()),
//!     Arc::new(MemoryObjectStore::new()),
//! )
//! .await?;
//!
//! let report = engine.run().await?;
//! println!("version {} {}", report.version, report.outcome);
//! # Ok(())
//! # }
//! ```

mod build;
mod context;
mod expand;
mod lifecycle;
mod types;
mod units;

use std::sync::Arc;

use tracing::{error, info, warn, Instrument};

pub use build::build;
pub use context::EngineContext;
pub use expand::{expand, ExpandSummary};
pub use types::{BuildStatus, FailedObject, RunReport, VersionOutcome};
pub use units::PatientUnits;

use crate::checkpoint::CheckpointLog;
use crate::config::{CatalogConfig, SkipPolicy};
use crate::error::EngineError;
use crate::revision::{Level, Revision, ROOT_NATURAL_ID};
use crate::sources::{MultiSourceView, SourceAdapter, SourceMask};
use crate::storage::{CatalogConnector, CatalogStore, ObjectStore, SqlConnector};
use crate::transfer::ContentTransfer;

/// Drives reconciliation runs against one repository.
pub struct CatalogEngine {
    config: Arc<CatalogConfig>,
    skip_policy: Arc<SkipPolicy>,
    view: Arc<MultiSourceView>,
    transfer: Arc<ContentTransfer>,
    checkpoint: Option<Arc<CheckpointLog>>,
    connector: Arc<dyn CatalogConnector>,
    store: Arc<dyn CatalogStore>,
}

impl CatalogEngine {
    /// Validate the config against `sources` (order fixes source indexes)
    /// and connect the dispatcher's own repository handle.
    pub async fn new(
        config: CatalogConfig,
        sources: Vec<Arc<dyn SourceAdapter>>,
        connector: Arc<dyn CatalogConnector>,
        objects: Arc<dyn ObjectStore>,
    ) -> Result<Self, EngineError> {
        let view = Arc::new(MultiSourceView::new(sources));
        let names = view.source_names();
        config.validate(&names)?;
        let skip_policy = Arc::new(config.skip_policy(&names)?);

        let store = connector.connect().await?;
        let checkpoint = match &config.checkpoint_path {
            Some(path) => Some(Arc::new(CheckpointLog::open(path).await?)),
            None => None,
        };
        let transfer = Arc::new(ContentTransfer::new(view.clone(), objects, config.staging_dir()));

        info!(
            sources = ?names,
            workers = config.worker_count,
            checkpoint = checkpoint.is_some(),
            "Catalog engine ready"
        );
        Ok(Self {
            config: Arc::new(config),
            skip_policy,
            view,
            transfer,
            checkpoint,
            connector,
            store,
        })
    }

    /// Like [`new`](Self::new) with an SQL repository at `config.sql_url`.
    pub async fn connect_sql(
        config: CatalogConfig,
        sources: Vec<Arc<dyn SourceAdapter>>,
        objects: Arc<dyn ObjectStore>,
    ) -> Result<Self, EngineError> {
        let url = config
            .sql_url
            .clone()
            .ok_or_else(|| EngineError::Config("sql_url is required for an SQL repository".into()))?;
        Self::new(config, sources, Arc::new(SqlConnector::new(url)), objects).await
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    #[must_use]
    pub fn view(&self) -> &Arc<MultiSourceView> {
        &self.view
    }

    #[must_use]
    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// Every revision of `natural_id` at `level`, oldest first.
    pub async fn history(&self, level: Level, natural_id: &str) -> Result<Vec<Revision>, EngineError> {
        Ok(self.store.history(level, natural_id).await?)
    }

    /// Open or resume a version and build it as far as possible.
    ///
    /// Errors are contained at the object that failed and listed in the
    /// report. Fatal ones are contained at their collection, so the other
    /// collections still build; see [`RunReport::has_fatal`]. A fatal error
    /// at the version root returns `Err` with the catalog left resumable.
    pub async fn run(&self) -> Result<RunReport, EngineError> {
        let (root, resumed) = lifecycle::open_version(self.store.as_ref(), self.view.len()).await?;
        let version = root.rev_version;
        let ctx = self.context(version);

        let span = tracing::info_span!("catalog_run", version, resumed);
        let built = build::build(&ctx, root.surrogate_id, SourceMask::NONE)
            .instrument(span)
            .await;
        match built {
            Ok(status) => {
                info!(version, done = status.is_done(), "Build pass finished");
            }
            Err(e) if e.is_fatal() => {
                error!(version, kind = e.kind(), error = %e, "Run aborted");
                return Err(e);
            }
            Err(e) => {
                warn!(version, class = %e.class(), error = %e, "Version left not done");
                ctx.record_failure(Level::Version, ROOT_NATURAL_ID, &e);
            }
        }

        let (outcome, live_version) = lifecycle::finalize(&ctx, &root).await?;
        let counts = lifecycle::level_counts(self.store.as_ref()).await?;

        // A later sibling pass may have finished what an earlier one failed.
        let mut failed = Vec::new();
        for failure in ctx.take_failures() {
            let finished = self
                .store
                .live(failure.level, &failure.natural_id)
                .await?
                .is_some_and(|r| r.done);
            if !finished {
                failed.push(failure);
            }
        }

        let report = RunReport {
            version,
            live_version,
            outcome,
            counts,
            failed,
        };
        if report.has_fatal() {
            error!(
                version,
                outcome = %outcome,
                failed = report.failed.len(),
                "Run finished with failures that need an operator"
            );
        } else {
            info!(
                version,
                live_version,
                outcome = %outcome,
                failed = report.failed.len(),
                "Run finished"
            );
        }
        Ok(report)
    }

    fn context(&self, version: u32) -> EngineContext {
        EngineContext::new(
            self.store.clone(),
            self.connector.clone(),
            self.view.clone(),
            self.transfer.clone(),
            self.checkpoint.clone(),
            self.config.clone(),
            self.skip_policy.clone(),
            version,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::MemorySource;
    use crate::storage::{MemoryCatalog, MemoryObjectStore};

    fn source_with_one_instance(name: &str) -> Arc<dyn SourceAdapter> {
        let source = MemorySource::new(name);
        source.add_instance("C1", "P1", "ST1", "SE1", "I1", b"pixels".to_vec());
        Arc::new(source)
    }

    fn fast_config() -> CatalogConfig {
        CatalogConfig {
            worker_count: 2,
            unit_initial_backoff_ms: 1,
            unit_max_backoff_ms: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_first_run_accepts_version_one() {
        let source = source_with_one_instance("idc");
        let objects = Arc::new(MemoryObjectStore::new());
        let engine = CatalogEngine::new(
            fast_config(),
            vec![source],
            Arc::new(MemoryCatalog::new()),
            objects.clone(),
        )
        .await
        .unwrap();

        let report = engine.run().await.unwrap();
        assert_eq!(report.version, 1);
        assert_eq!(report.outcome, VersionOutcome::Accepted);
        assert!(report.is_complete());
        assert!(report.failed.is_empty());
        assert_eq!(report.not_done(), 0);
        assert_eq!(objects.len(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_second_run_rolls_back() {
        let source = source_with_one_instance("idc");
        let engine = CatalogEngine::new(
            fast_config(),
            vec![source],
            Arc::new(MemoryCatalog::new()),
            Arc::new(MemoryObjectStore::new()),
        )
        .await
        .unwrap();

        engine.run().await.unwrap();
        let report = engine.run().await.unwrap();
        assert_eq!(report.version, 2);
        assert_eq!(report.outcome, VersionOutcome::RolledBack);
        assert_eq!(report.live_version, 1);

        let roots = engine.history(Level::Version, ROOT_NATURAL_ID).await.unwrap();
        assert_eq!(roots.len(), 1);
        assert!(roots[0].is_live());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = CatalogConfig {
            worker_count: 0,
            ..Default::default()
        };
        let result = CatalogEngine::new(
            config,
            vec![source_with_one_instance("idc")],
            Arc::new(MemoryCatalog::new()),
            Arc::new(MemoryObjectStore::new()),
        )
        .await;
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_sql_requires_url() {
        let result = CatalogEngine::connect_sql(
            CatalogConfig::default(),
            vec![source_with_one_instance("idc")],
            Arc::new(MemoryObjectStore::new()),
        )
        .await;
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
