//! Property-based tests for hashing and reconciliation.
//!
//! Uses proptest to generate random catalogs and random edits between runs,
//! and checks that the catalog invariants survive every version.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;

use catalog_engine::{
    CatalogConfig, CatalogEngine, CatalogStore, HashTree, Level, MemoryCatalog, MemoryObjectStore,
    MemorySource, Revision, SourceAdapter, VersionOutcome,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// One instance placed by its path: (collection, patient, study, series, instance).
#[derive(Debug, Clone)]
struct Placement {
    path: (u8, u8, u8, u8, u8),
    payload: Vec<u8>,
}

impl Placement {
    /// Natural ids derived from the path, unique per level.
    fn ids(&self) -> [String; 5] {
        let (c, p, st, se, i) = self.path;
        [
            format!("C{}", c),
            format!("P{}.{}", c, p),
            format!("ST{}.{}.{}", c, p, st),
            format!("SE{}.{}.{}.{}", c, p, st, se),
            format!("I{}.{}.{}.{}.{}", c, p, st, se, i),
        ]
    }

    fn add_to(&self, source: &MemorySource) {
        let [c, p, st, se, i] = self.ids();
        source.add_instance(&c, &p, &st, &se, &i, self.payload.clone());
    }
}

fn placement_strategy() -> impl Strategy<Value = Placement> {
    (
        (0u8..2, 0u8..3, 0u8..2, 0u8..2, 0u8..3),
        prop::collection::vec(any::<u8>(), 1..32),
    )
        .prop_map(|(path, payload)| Placement { path, payload })
}

#[derive(Debug, Clone)]
enum Edit {
    Add(Placement),
    Rewrite(usize, Vec<u8>),
    Remove(usize),
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        placement_strategy().prop_map(Edit::Add),
        (any::<usize>(), prop::collection::vec(any::<u8>(), 1..32)).prop_map(|(i, p)| Edit::Rewrite(i, p)),
        any::<usize>().prop_map(Edit::Remove),
    ]
}

fn apply(edit: &Edit, source: &MemorySource, seeded: &[Placement]) {
    match edit {
        Edit::Add(placement) => placement.add_to(source),
        Edit::Rewrite(i, payload) => {
            let target = &seeded[i % seeded.len()];
            source.set_payload(&target.ids()[4], payload.clone());
        }
        Edit::Remove(i) => {
            let target = &seeded[i % seeded.len()];
            source.remove(Level::Instance, &target.ids()[4]);
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn config() -> CatalogConfig {
    CatalogConfig {
        worker_count: 3,
        unit_initial_backoff_ms: 1,
        unit_max_backoff_ms: 5,
        ..Default::default()
    }
}

async fn engine_over(source: &Arc<MemorySource>, catalog: &MemoryCatalog) -> CatalogEngine {
    CatalogEngine::new(
        config(),
        vec![Arc::clone(source) as Arc<dyn SourceAdapter>],
        Arc::new(catalog.clone()),
        Arc::new(MemoryObjectStore::new()),
    )
    .await
    .unwrap()
}

/// Returns a description of the first broken invariant, if any.
async fn check_invariants(store: &dyn CatalogStore, all: &[Revision]) -> Option<String> {
    let mut live: HashMap<(Level, &str), usize> = HashMap::new();
    for rev in all.iter().filter(|r| r.is_live()) {
        *live.entry((rev.level, rev.natural_id.as_str())).or_default() += 1;
    }
    if let Some(((level, id), n)) = live.iter().find(|(_, n)| **n > 1) {
        return Some(format!("{} '{}' has {} live revisions", level, id, n));
    }

    for rev in all.iter().filter(|r| r.is_live() && r.done && !r.level.is_leaf()) {
        let children = store.children(&rev.surrogate_id).await.unwrap();
        if children.iter().any(|c| !c.is_live() || !c.done) {
            return Some(format!("{} '{}' done over a pending child", rev.level, rev.natural_id));
        }
        let expected = HashTree::merkle(children.iter().flat_map(|c| c.source_hashes.present()));
        if rev.aggregate_hash != expected {
            return Some(format!("{} '{}' aggregate drifted", rev.level, rev.natural_id));
        }
    }
    None
}

// =============================================================================
// Hashing properties
// =============================================================================

proptest! {
    #[test]
    fn prop_merkle_order_independent(
        shuffled in prop::collection::vec("[0-9a-f]{8}", 0..20)
            .prop_flat_map(|hashes| (Just(hashes.clone()), Just(hashes).prop_shuffle()))
    ) {
        let (original, permuted) = shuffled;
        prop_assert_eq!(HashTree::merkle(&original), HashTree::merkle(&permuted));
    }

    #[test]
    fn prop_merkle_ignores_duplicates_and_empties(hashes in prop::collection::vec("[0-9a-f]{8}", 1..10)) {
        let mut padded = hashes.clone();
        padded.extend(hashes.iter().cloned());
        padded.push(String::new());
        prop_assert_eq!(HashTree::merkle(&hashes), HashTree::merkle(&padded));
    }

    #[test]
    fn prop_content_hash_is_hex_sha256(payload in prop::collection::vec(any::<u8>(), 0..4096)) {
        let hash = HashTree::content_hash(&payload);
        prop_assert_eq!(hash.len(), 64);
        prop_assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        prop_assert_eq!(hash, HashTree::content_hash(&payload));
    }
}

// =============================================================================
// Reconciliation properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_rerun_without_changes_is_idempotent(
        placements in prop::collection::vec(placement_strategy(), 1..12)
    ) {
        runtime().block_on(async {
            let source = Arc::new(MemorySource::new("a"));
            for placement in &placements {
                placement.add_to(&source);
            }
            let catalog = MemoryCatalog::new();
            let engine = engine_over(&source, &catalog).await;

            let first = engine.run().await.unwrap();
            prop_assert_eq!(first.outcome, VersionOutcome::Accepted);
            let revisions = catalog.len();
            let live: Vec<(Level, String, String)> = {
                let mut v: Vec<_> = catalog
                    .all()
                    .into_iter()
                    .filter(Revision::is_live)
                    .map(|r| (r.level, r.natural_id, r.aggregate_hash))
                    .collect();
                v.sort();
                v
            };

            let second = engine.run().await.unwrap();
            prop_assert_eq!(second.outcome, VersionOutcome::RolledBack);
            prop_assert_eq!(catalog.len(), revisions);
            let mut after: Vec<_> = catalog
                .all()
                .into_iter()
                .filter(Revision::is_live)
                .map(|r| (r.level, r.natural_id, r.aggregate_hash))
                .collect();
            after.sort();
            prop_assert_eq!(after, live);
            Ok(())
        })?;
    }

    #[test]
    fn prop_invariants_hold_under_random_edits(
        placements in prop::collection::vec(placement_strategy(), 1..10),
        rounds in prop::collection::vec(prop::collection::vec(edit_strategy(), 1..4), 1..4)
    ) {
        runtime().block_on(async {
            let source = Arc::new(MemorySource::new("a"));
            for placement in &placements {
                placement.add_to(&source);
            }
            let catalog = MemoryCatalog::new();
            let engine = engine_over(&source, &catalog).await;

            let report = engine.run().await.unwrap();
            prop_assert!(report.is_complete(), "{:?}", report.failed);
            if let Some(broken) = check_invariants(engine.store().as_ref(), &catalog.all()).await {
                return Err(TestCaseError::fail(broken));
            }

            for edits in &rounds {
                for edit in edits {
                    apply(edit, &source, &placements);
                }
                let report = engine.run().await.unwrap();
                prop_assert!(report.is_complete(), "{:?}", report.failed);
                prop_assert!(matches!(
                    report.outcome,
                    VersionOutcome::Accepted | VersionOutcome::RolledBack
                ));
                if let Some(broken) = check_invariants(engine.store().as_ref(), &catalog.all()).await {
                    return Err(TestCaseError::fail(broken));
                }
            }
            Ok(())
        })?;
    }
}
