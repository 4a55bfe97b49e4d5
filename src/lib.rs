// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Catalog Engine
//!
//! A versioned, hash-verified catalog of a six-level hierarchy reconciled
//! against several independent sources.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      CatalogEngine::run                     │
//! │  • Opens, resumes, accepts or rolls back a version          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │             Reconciliation (version → series)               │
//! │  • Expand: diff children against every source               │
//! │  • Build: children first, then merkle hash and verify       │
//! │  • Patients fan out over the ParallelDispatcher pool        │
//! └─────────────────────────────────────────────────────────────┘
//!            │                                    │
//!            ▼                                    ▼
//! ┌───────────────────────────┐    ┌────────────────────────────┐
//! │      MultiSourceView      │    │      ContentTransfer       │
//! │  • N SourceAdapters       │    │  • Fetch, verify, stage    │
//! │  • Skip masks per object  │    │  • Upload and re-check     │
//! └───────────────────────────┘    └────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Repository (CatalogStore)                     │
//! │  • Revision arena + parent→child edges                      │
//! │  • Atomic RevisionBatch commits (memory, SQLite/MySQL)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use catalog_engine::{
//!     CatalogConfig, CatalogEngine, MemorySource, MemoryObjectStore, SourceAdapter,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let idc = MemorySource::new("idc");
//!     idc.add_instance("TCGA-LUAD", "P-0001", "1.2.1", "1.2.1.1", "1.2.1.1.1", b"DICM".to_vec());
//!     let sources: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(idc)];
//!
//!     let config = CatalogConfig {
//!         sql_url: Some("sqlite:catalog.db?mode=rwc".into()),
//!         ..Default::default()
//!     };
//!     let engine = CatalogEngine::connect_sql(config, sources, Arc::new(MemoryObjectStore::new()))
//!         .await
//!         .expect("Failed to start");
//!
//!     let report = engine.run().await.expect("Run aborted");
//!     println!("version {} {} ({} not done)", report.version, report.outcome, report.not_done());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: [`CatalogEngine`] and the per-level expand/build steps
//! - [`sources`]: source adapters and the multi-source view
//! - [`storage`]: repository and payload storage backends
//! - [`dispatch`]: patient-level worker pool
//! - [`transfer`]: instance payload transfer
//! - [`merkle`]: content and merkle hashing
//! - [`checkpoint`]: completed-transfer log
//! - [`auth`]: shared access token
//! - [`resilience`]: retry and circuit breaking

pub mod auth;
pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod merkle;
pub mod metrics;
pub mod resilience;
pub mod revision;
pub mod sources;
pub mod storage;
pub mod transfer;

pub use auth::{AccessToken, SharedToken, TokenSource};
pub use checkpoint::{CheckpointEntry, CheckpointLog};
pub use config::{CatalogConfig, SkipPolicy, SkipRule};
pub use dispatch::{DispatchReport, ParallelDispatcher, UnitFailure, UnitHandler, WorkUnit};
pub use engine::{BuildStatus, CatalogEngine, ExpandSummary, FailedObject, RunReport, VersionOutcome};
pub use error::{EngineError, ErrorClass};
pub use merkle::{Hash, HashTree, EMPTY_HASH};
pub use metrics::LatencyTimer;
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use resilience::retry::RetryConfig;
pub use revision::{BuildState, Level, ObjectRef, Revision, SourceHashes, SurrogateId, ROOT_NATURAL_ID};
pub use sources::{GuardedSource, MemorySource, MultiSourceView, SourceAdapter, SourceError, SourceMask};
pub use storage::{
    CatalogConnector, CatalogStore, FsObjectStore, LevelCounts, MemoryCatalog, MemoryObjectStore,
    ObjectStore, RevisionBatch, SqlCatalog, SqlConnector, StorageError,
};
pub use transfer::{ContentTransfer, TransferOutcome};
