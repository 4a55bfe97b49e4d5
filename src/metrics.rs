// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for catalog-engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `catalog_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size counters
//!
//! # Labels
//! - `level`: version, collection, patient, study, series, instance
//! - `outcome`: created, revised, retired, unchanged / done, failed, ...
//! - `source`: adapter name

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record what expand did with one child revision
/// (`created`, `revised`, `retired`, `unchanged`).
pub fn record_revision(level: &str, outcome: &str) {
    counter!(
        "catalog_engine_revisions_total",
        "level" => level.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an object reaching done
pub fn record_done(level: &str) {
    counter!(
        "catalog_engine_objects_done_total",
        "level" => level.to_string()
    )
    .increment(1);
}

/// Record a hash verification failure
pub fn record_hash_mismatch(level: &str) {
    counter!(
        "catalog_engine_hash_mismatch_total",
        "level" => level.to_string()
    )
    .increment(1);
}

/// Record a source being skipped for an object
pub fn record_source_skip(source: &str, level: &str) {
    counter!(
        "catalog_engine_source_skips_total",
        "source" => source.to_string(),
        "level" => level.to_string()
    )
    .increment(1);
}

/// Record a dispatcher unit outcome (`done`, `incomplete`, `retry`, `exhausted`, `fatal`)
pub fn record_unit(outcome: &str) {
    counter!(
        "catalog_engine_dispatch_units_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set the number of busy dispatcher workers
pub fn set_active_workers(count: usize) {
    gauge!("catalog_engine_dispatch_workers").set(count as f64);
}

/// Record a content transfer outcome (`stored`, `checkpoint`, `integrity`, `error`)
pub fn record_transfer(outcome: &str) {
    counter!(
        "catalog_engine_transfers_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record payload bytes moved into the object store
pub fn record_transfer_bytes(bytes: u64) {
    counter!("catalog_engine_transfer_bytes_total").increment(bytes);
}

/// Set live done/not-done counts for a level
pub fn set_level_counts(level: &str, done: u64, not_done: u64) {
    gauge!(
        "catalog_engine_objects_done",
        "level" => level.to_string()
    )
    .set(done as f64);
    gauge!(
        "catalog_engine_objects_not_done",
        "level" => level.to_string()
    )
    .set(not_done as f64);
}

/// Record build latency for one object
pub fn record_build_latency(level: &str, duration: Duration) {
    histogram!(
        "catalog_engine_build_seconds",
        "level" => level.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a version outcome (`accepted`, `rolled_back`, `incomplete`)
pub fn record_version_outcome(outcome: &str) {
    counter!(
        "catalog_engine_versions_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set the live catalog version
pub fn set_current_version(version: u32) {
    gauge!("catalog_engine_current_version").set(f64::from(version));
}

/// Record a repository operation
pub fn record_store_operation(backend: &str, operation: &str, status: &str) {
    counter!(
        "catalog_engine_store_operations_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record circuit breaker call
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "catalog_engine_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a checkpoint log lookup
pub fn record_checkpoint(hit: bool) {
    counter!(
        "catalog_engine_checkpoint_lookups_total",
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Record an access token refresh
pub fn record_token_refresh(success: bool) {
    counter!(
        "catalog_engine_token_refresh_total",
        "status" => if success { "success" } else { "error" }
    )
    .increment(1);
}

/// A timing guard that records build latency on drop
pub struct LatencyTimer {
    level: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(level: &'static str) -> Self {
        Self {
            level,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_build_latency(self.level, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // No recorder is installed, so these only check the calls are well formed.

    #[test]
    fn test_revision_metrics() {
        record_revision("patient", "created");
        record_revision("patient", "revised");
        record_revision("study", "retired");
        record_revision("series", "unchanged");
        record_done("instance");
        record_hash_mismatch("collection");
    }

    #[test]
    fn test_dispatch_and_transfer_metrics() {
        record_unit("done");
        record_unit("exhausted");
        set_active_workers(4);
        record_transfer("stored");
        record_transfer_bytes(1024);
        record_checkpoint(true);
        record_checkpoint(false);
    }

    #[test]
    fn test_gauges() {
        set_level_counts("patient", 10, 2);
        set_current_version(3);
        record_version_outcome("accepted");
        record_token_refresh(true);
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("series");
            std::thread::sleep(Duration::from_micros(10));
        }
    }
}
