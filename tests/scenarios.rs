//! End-to-end reconciliation scenarios.
//!
//! Every test drives `CatalogEngine::run` against in-memory sources and
//! checks the catalog the runs leave behind: revisions, retirement stamps,
//! skip handling, version rollback and resumption. One test repeats the
//! lifecycle on a temporary SQLite file.
//!
//! Run with: `cargo test --test scenarios`

use std::collections::HashMap;
use std::sync::Arc;

use catalog_engine::{
    CatalogConfig, CatalogEngine, CatalogStore, ErrorClass, HashTree, Level, MemoryCatalog, MemoryObjectStore,
    MemorySource, Revision, SkipRule, SourceAdapter, VersionOutcome, ROOT_NATURAL_ID,
};

// =============================================================================
// Helpers
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn fast_config() -> CatalogConfig {
    CatalogConfig {
        worker_count: 2,
        unit_max_attempts: 2,
        unit_initial_backoff_ms: 1,
        unit_max_backoff_ms: 5,
        ..Default::default()
    }
}

/// C1/P1/ST1/SE1 holding I1 and I2.
fn seeded(name: &str) -> Arc<MemorySource> {
    let source = Arc::new(MemorySource::new(name));
    source.add_instance("C1", "P1", "ST1", "SE1", "I1", b"one".to_vec());
    source.add_instance("C1", "P1", "ST1", "SE1", "I2", b"two".to_vec());
    source
}

struct Harness {
    engine: CatalogEngine,
    catalog: MemoryCatalog,
    objects: Arc<MemoryObjectStore>,
}

impl Harness {
    async fn new(sources: &[&Arc<MemorySource>], config: CatalogConfig) -> Self {
        init_tracing();
        let catalog = MemoryCatalog::new();
        let objects = Arc::new(MemoryObjectStore::new());
        let adapters: Vec<Arc<dyn SourceAdapter>> = sources
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn SourceAdapter>)
            .collect();
        let engine = CatalogEngine::new(config, adapters, Arc::new(catalog.clone()), objects.clone())
            .await
            .unwrap();
        Self {
            engine,
            catalog,
            objects,
        }
    }

    async fn live(&self, level: Level, natural_id: &str) -> Revision {
        self.engine
            .store()
            .live(level, natural_id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no live {} '{}'", level, natural_id))
    }

    async fn child_ids(&self, parent: &Revision) -> Vec<String> {
        let mut ids: Vec<String> = self
            .engine
            .store()
            .children(&parent.surrogate_id)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.natural_id)
            .collect();
        ids.sort();
        ids
    }

    /// Live (level, natural id) → aggregate hash.
    fn live_aggregates(&self) -> HashMap<(Level, String), String> {
        self.catalog
            .all()
            .into_iter()
            .filter(Revision::is_live)
            .map(|r| ((r.level, r.natural_id), r.aggregate_hash))
            .collect()
    }
}

/// At most one live revision per natural id, and every done interior
/// object hashes exactly its live children.
async fn assert_invariants(store: &dyn CatalogStore, all: &[Revision]) {
    let mut live: HashMap<(Level, &str), usize> = HashMap::new();
    for rev in all.iter().filter(|r| r.is_live()) {
        *live.entry((rev.level, rev.natural_id.as_str())).or_default() += 1;
    }
    for ((level, id), count) in &live {
        assert_eq!(*count, 1, "{} '{}' has {} live revisions", level, id, count);
    }

    for rev in all.iter().filter(|r| r.is_live() && r.done && !r.level.is_leaf()) {
        let children = store.children(&rev.surrogate_id).await.unwrap();
        assert!(children.iter().all(|c| c.done && c.is_live()));
        let expected = HashTree::merkle(children.iter().flat_map(|c| c.source_hashes.present()));
        assert_eq!(rev.aggregate_hash, expected, "{} '{}'", rev.level, rev.natural_id);
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_unchanged_rerun_creates_no_revision() {
    let a = seeded("a");
    let h = Harness::new(&[&a], fast_config()).await;

    let first = h.engine.run().await.unwrap();
    assert_eq!(first.outcome, VersionOutcome::Accepted);
    assert_eq!(h.objects.len(), 2);
    let revisions = h.catalog.len();
    let aggregates = h.live_aggregates();
    let c1 = h.live(Level::Collection, "C1").await;

    let second = h.engine.run().await.unwrap();
    assert_eq!(second.version, 2);
    assert_eq!(second.outcome, VersionOutcome::RolledBack);
    assert_eq!(second.live_version, 1);

    assert_eq!(h.catalog.len(), revisions);
    assert_eq!(h.live_aggregates(), aggregates);
    let after = h.live(Level::Collection, "C1").await;
    assert_eq!(after.surrogate_id, c1.surrogate_id);
    assert!(after.done);
    assert_eq!(
        after.aggregate_hash,
        HashTree::merkle([a.hash_of(Level::Patient, "P1")])
    );
    assert_eq!(h.objects.len(), 2);
}

#[tokio::test]
async fn test_changed_patient_is_cloned_and_original_retired() {
    let a = seeded("a");
    let h = Harness::new(&[&a], fast_config()).await;
    h.engine.run().await.unwrap();
    let original = h.live(Level::Patient, "P1").await;
    let unchanged_instance = h.live(Level::Instance, "I2").await;

    assert!(a.set_payload("I1", b"one, corrected".to_vec()));
    let report = h.engine.run().await.unwrap();
    assert_eq!(report.version, 2);
    assert_eq!(report.outcome, VersionOutcome::Accepted);

    let clone = h.live(Level::Patient, "P1").await;
    assert_ne!(clone.surrogate_id, original.surrogate_id);
    assert!(!clone.is_new);
    assert!(clone.revised);
    assert!(clone.done);
    assert_eq!(clone.predecessor, Some(original.surrogate_id));
    assert_eq!(clone.rev_version, 2);

    let retired = h.engine.store().get(&original.surrogate_id).await.unwrap().unwrap();
    assert_eq!(retired.final_version, 1);
    assert!(retired.done);

    let c1 = h.live(Level::Collection, "C1").await;
    assert_eq!(c1.aggregate_hash, HashTree::merkle([a.hash_of(Level::Patient, "P1")]));

    // Only the changed instance was copied again.
    assert_eq!(h.live(Level::Instance, "I2").await.surrogate_id, unchanged_instance.surrogate_id);
    assert_eq!(h.objects.len(), 3);
    assert_eq!(h.engine.history(Level::Patient, "P1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_unavailable_source_leaves_patient_untouched() {
    let a = seeded("a");
    let b = seeded("b");
    let h = Harness::new(&[&a, &b], fast_config()).await;
    h.engine.run().await.unwrap();
    let p1 = h.live(Level::Patient, "P1").await;

    // A cannot answer for P1; B is unchanged for P1 but gains P2, which
    // forces C1 to be expanded again.
    a.set_unavailable(Level::Patient, "P1", true);
    b.add_instance("C1", "P2", "ST2", "SE2", "I3", b"three".to_vec());

    let report = h.engine.run().await.unwrap();
    assert_eq!(report.outcome, VersionOutcome::Accepted);
    assert!(report.failed.is_empty());

    let after = h.live(Level::Patient, "P1").await;
    assert_eq!(after.surrogate_id, p1.surrogate_id);
    assert!(after.done);
    assert_eq!(h.engine.history(Level::Patient, "P1").await.unwrap().len(), 1);

    let c1 = h.live(Level::Collection, "C1").await;
    assert_eq!(h.child_ids(&c1).await, vec!["P1", "P2"]);
}

#[tokio::test]
async fn test_new_patient_is_created_and_hashed_into_collection() {
    let a = seeded("a");
    let h = Harness::new(&[&a], fast_config()).await;
    h.engine.run().await.unwrap();

    a.add_instance("C1", "P2", "ST2", "SE2", "I3", b"three".to_vec());
    let report = h.engine.run().await.unwrap();
    assert_eq!(report.outcome, VersionOutcome::Accepted);

    let p2 = h.live(Level::Patient, "P2").await;
    assert!(p2.is_new);
    assert!(p2.done);
    assert_eq!(p2.init_version, 2);
    assert_eq!(p2.aggregate_hash, HashTree::merkle([a.hash_of(Level::Study, "ST2")]));

    let c1 = h.live(Level::Collection, "C1").await;
    assert_eq!(
        c1.aggregate_hash,
        HashTree::merkle([a.hash_of(Level::Patient, "P1"), a.hash_of(Level::Patient, "P2")])
    );
}

#[tokio::test]
async fn test_vanished_patient_retires_whole_subtree() {
    let a = seeded("a");
    a.add_instance("C1", "P2", "ST2", "SE2", "I3", b"three".to_vec());
    let h = Harness::new(&[&a], fast_config()).await;
    h.engine.run().await.unwrap();

    let mut subtree = Vec::new();
    for (level, id) in [
        (Level::Patient, "P1"),
        (Level::Study, "ST1"),
        (Level::Series, "SE1"),
        (Level::Instance, "I1"),
        (Level::Instance, "I2"),
    ] {
        subtree.push(h.live(level, id).await.surrogate_id);
    }

    a.remove(Level::Patient, "P1");
    let report = h.engine.run().await.unwrap();
    assert_eq!(report.outcome, VersionOutcome::Accepted);

    for id in &subtree {
        let rev = h.engine.store().get(id).await.unwrap().expect("retired, not deleted");
        assert_eq!(rev.final_version, 1, "{} '{}'", rev.level, rev.natural_id);
    }
    assert!(h.engine.store().live(Level::Patient, "P1").await.unwrap().is_none());
    assert_eq!(report.counts_for(Level::Instance).retired, 2);

    let c1 = h.live(Level::Collection, "C1").await;
    assert_eq!(h.child_ids(&c1).await, vec!["P2"]);
}

#[tokio::test]
async fn test_skip_rule_uses_only_the_other_sources_listing() {
    let conflicting = || {
        let a = Arc::new(MemorySource::new("a"));
        a.add_instance("C1", "P1", "ST1", "SE1", "I1", b"one".to_vec());
        a.add_instance("C1", "P2", "ST2", "SE2", "I2", b"two".to_vec());
        let b = Arc::new(MemorySource::new("b"));
        b.add_instance("C1", "P1", "ST1", "SE1", "I1", b"one".to_vec());
        b.add_instance("C1", "P3", "ST3", "SE3", "I3", b"three".to_vec());
        (a, b)
    };
    let config = || CatalogConfig {
        skip_rules: vec![SkipRule {
            source: "b".into(),
            collection: "C1".into(),
        }],
        ..fast_config()
    };

    let (a, b) = conflicting();
    let forward = Harness::new(&[&a, &b], config()).await;
    assert_eq!(forward.engine.run().await.unwrap().outcome, VersionOutcome::Accepted);
    let c1 = forward.live(Level::Collection, "C1").await;
    assert_eq!(forward.child_ids(&c1).await, vec!["P1", "P2"]);

    let (a, b) = conflicting();
    let reversed = Harness::new(&[&b, &a], config()).await;
    assert_eq!(reversed.engine.run().await.unwrap().outcome, VersionOutcome::Accepted);
    let c1_reversed = reversed.live(Level::Collection, "C1").await;
    assert_eq!(reversed.child_ids(&c1_reversed).await, vec!["P1", "P2"]);
    assert_eq!(c1.aggregate_hash, c1_reversed.aggregate_hash);
}

// =============================================================================
// Properties
// =============================================================================

#[tokio::test]
async fn test_skipped_source_change_ignored_but_real_change_revises() {
    let a = seeded("a");
    let b = seeded("b");
    let config = CatalogConfig {
        skip_rules: vec![SkipRule {
            source: "b".into(),
            collection: "C1".into(),
        }],
        ..fast_config()
    };
    let h = Harness::new(&[&a, &b], config).await;
    h.engine.run().await.unwrap();
    let c1 = h.live(Level::Collection, "C1").await;

    b.override_hash(Level::Collection, "C1", Some("b-thinks-otherwise"));
    let report = h.engine.run().await.unwrap();
    assert_eq!(report.outcome, VersionOutcome::RolledBack);
    assert_eq!(h.live(Level::Collection, "C1").await.surrogate_id, c1.surrogate_id);

    a.set_payload("I2", b"two, rescanned".to_vec());
    let report = h.engine.run().await.unwrap();
    assert_eq!(report.outcome, VersionOutcome::Accepted);
    assert_eq!(report.version, 2);
    let revised = h.live(Level::Collection, "C1").await;
    assert_ne!(revised.surrogate_id, c1.surrogate_id);
    assert!(revised.revised);
}

#[tokio::test]
async fn test_invariants_hold_across_versions() {
    let a = seeded("a");
    let b = seeded("b");
    let h = Harness::new(&[&a, &b], fast_config()).await;

    let change = |step: usize| match step {
        0 => a.add_instance("C1", "P2", "ST2", "SE2", "I3", b"three".to_vec()),
        1 => {
            a.set_payload("I1", b"one v2".to_vec());
            b.set_payload("I1", b"one v2".to_vec());
        }
        2 => b.add_instance("C2", "P9", "ST9", "SE9", "I9", b"nine".to_vec()),
        _ => {
            a.remove(Level::Instance, "I2");
            b.remove(Level::Instance, "I2");
        }
    };

    h.engine.run().await.unwrap();
    assert_invariants(h.engine.store().as_ref(), &h.catalog.all()).await;
    for step in 0..4 {
        change(step);
        let report = h.engine.run().await.unwrap();
        assert!(report.is_complete(), "{:?}", report.failed);
        assert_eq!(report.outcome, VersionOutcome::Accepted);
        assert_invariants(h.engine.store().as_ref(), &h.catalog.all()).await;
    }

    let roots = h.engine.history(Level::Version, ROOT_NATURAL_ID).await.unwrap();
    assert_eq!(roots.len(), 5);
    assert_eq!(roots.iter().filter(|r| r.is_live()).count(), 1);
}

#[tokio::test]
async fn test_incomplete_version_is_resumed() {
    let a = seeded("a");
    let h = Harness::new(&[&a], fast_config()).await;

    a.set_unavailable(Level::Instance, "I1", true);
    let first = h.engine.run().await.unwrap();
    assert_eq!(first.version, 1);
    assert_eq!(first.outcome, VersionOutcome::Incomplete);
    assert!(!first.is_complete());
    assert!(first
        .failed
        .iter()
        .any(|f| f.level == Level::Instance && f.natural_id == "I1"));
    assert_eq!(first.counts_for(Level::Instance).not_done, 1);
    assert_eq!(first.counts_for(Level::Instance).done, 1);
    assert!(!h.live(Level::Series, "SE1").await.done);

    a.set_unavailable(Level::Instance, "I1", false);
    let second = h.engine.run().await.unwrap();
    assert_eq!(second.version, 1);
    assert_eq!(second.outcome, VersionOutcome::Accepted);
    assert!(second.failed.is_empty());
    assert_eq!(second.not_done(), 0);
    assert_eq!(h.objects.len(), 2);
}

#[tokio::test]
async fn test_duplicate_listing_aborts_only_its_collection() {
    let a = seeded("a");
    a.add_instance("C2", "P2", "ST2", "SE2", "I3", b"three".to_vec());
    let h = Harness::new(&[&a], fast_config()).await;
    a.duplicate_first_child(Level::Collection, "C1", true);

    for _ in 0..2 {
        let report = h.engine.run().await.unwrap();
        assert_eq!(report.version, 1);
        assert_eq!(report.outcome, VersionOutcome::Incomplete);
        assert!(report.has_fatal());
        let failure = report
            .failed
            .iter()
            .find(|f| f.level == Level::Collection && f.natural_id == "C1")
            .expect("C1 reported");
        assert_eq!(failure.kind, "duplicate_natural_id");
        assert_eq!(failure.class, ErrorClass::Fatal);

        // Nothing under C1 was committed, C2 still finished.
        assert!(!h.live(Level::Collection, "C1").await.expanded);
        assert!(h.live(Level::Collection, "C2").await.done);
        assert!(h.live(Level::Instance, "I3").await.done);
    }

    a.duplicate_first_child(Level::Collection, "C1", false);
    let report = h.engine.run().await.unwrap();
    assert_eq!(report.version, 1);
    assert_eq!(report.outcome, VersionOutcome::Accepted);
    assert!(!report.has_fatal());
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn test_duplicate_collection_listing_aborts_run() {
    let a = seeded("a");
    let h = Harness::new(&[&a], fast_config()).await;
    a.duplicate_first_child(Level::Version, ROOT_NATURAL_ID, true);

    let err = h.engine.run().await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(err.kind(), "duplicate_natural_id");
    let root = h.live(Level::Version, ROOT_NATURAL_ID).await;
    assert!(!root.expanded);

    a.duplicate_first_child(Level::Version, ROOT_NATURAL_ID, false);
    assert_eq!(h.engine.run().await.unwrap().outcome, VersionOutcome::Accepted);
}

#[tokio::test]
async fn test_hash_mismatch_leaves_object_not_done() {
    let a = seeded("a");
    a.add_instance("C2", "P2", "ST2", "SE2", "I3", b"three".to_vec());
    let h = Harness::new(&[&a], fast_config()).await;
    a.override_hash(Level::Study, "ST1", Some("not-the-merkle-of-its-series"));

    let report = h.engine.run().await.unwrap();
    assert_eq!(report.outcome, VersionOutcome::Incomplete);
    assert!(report.has_fatal());
    assert!(report
        .failed
        .iter()
        .any(|f| f.natural_id == "C1" && f.kind == "hash_mismatch"));
    assert!(!h.live(Level::Study, "ST1").await.done);
    assert!(h.live(Level::Series, "SE1").await.done);
    assert!(h.live(Level::Collection, "C2").await.done);
}

#[tokio::test]
async fn test_source_back_after_listing_skip_rejoins_version() {
    let a = seeded("a");
    let b = seeded("b");
    let h = Harness::new(&[&a, &b], fast_config()).await;
    assert_eq!(h.engine.run().await.unwrap().outcome, VersionOutcome::Accepted);

    // A drops P1 and gains P2; B, the only holder of P1, is down for C1.
    a.remove(Level::Patient, "P1");
    a.add_instance("C1", "P2", "ST2", "SE2", "I3", b"three".to_vec());
    b.set_unavailable(Level::Collection, "C1", true);

    let stuck = h.engine.run().await.unwrap();
    assert_eq!(stuck.version, 2);
    assert_eq!(stuck.outcome, VersionOutcome::Incomplete);
    assert!(h.live(Level::Collection, "C1").await.skip_mask.contains(1));

    b.set_unavailable(Level::Collection, "C1", false);
    let resumed = h.engine.run().await.unwrap();
    assert_eq!(resumed.version, 2);
    assert_eq!(resumed.outcome, VersionOutcome::Accepted, "{:?}", resumed.failed);
    assert!(resumed.failed.is_empty());

    let c1 = h.live(Level::Collection, "C1").await;
    assert!(c1.done);
    assert!(c1.skip_mask.is_empty());
    assert_eq!(h.child_ids(&c1).await, vec!["P1", "P2"]);
    assert_eq!(c1.source_hashes.get(1), b.hash_of(Level::Collection, "C1"));
    assert!(h.live(Level::Instance, "I1").await.done);
    assert_invariants(h.engine.store().as_ref(), &h.catalog.all()).await;
}

#[tokio::test]
async fn test_sqlite_repository_end_to_end() {
    init_tracing();
    let dir = tempfile::TempDir::new().unwrap();
    let a = seeded("a");
    let config = CatalogConfig {
        sql_url: Some(format!("sqlite://{}?mode=rwc", dir.path().join("catalog.db").display())),
        staging_dir: Some(dir.path().join("staging")),
        ..fast_config()
    };
    let engine = CatalogEngine::connect_sql(
        config,
        vec![a.clone() as Arc<dyn SourceAdapter>],
        Arc::new(MemoryObjectStore::new()),
    )
    .await
    .unwrap();

    assert_eq!(engine.run().await.unwrap().outcome, VersionOutcome::Accepted);
    a.set_payload("I2", b"two v2".to_vec());
    assert_eq!(engine.run().await.unwrap().outcome, VersionOutcome::Accepted);
    let report = engine.run().await.unwrap();
    assert_eq!(report.outcome, VersionOutcome::RolledBack);
    assert_eq!(report.live_version, 2);

    assert_eq!(engine.history(Level::Patient, "P1").await.unwrap().len(), 2);
    let c1 = engine.store().live(Level::Collection, "C1").await.unwrap().unwrap();
    assert_eq!(c1.aggregate_hash, HashTree::merkle([a.hash_of(Level::Patient, "P1")]));
    assert_eq!(report.counts_for(Level::Instance).live, 2);
    assert_eq!(report.counts_for(Level::Instance).retired, 1);
}
