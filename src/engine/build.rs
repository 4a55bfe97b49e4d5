// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Build: bring an object to done, bottom-up.
//!
//! Expand if needed, build every child that is not done (patients through
//! the worker pool, everything else inline), then hash. A parent is hashed
//! only once every live child is done; its per-source hashes must match
//! what each non-skipped source reported, otherwise the build fails with
//! [`EngineError::HashMismatch`] and nothing is committed.
//!
//! Non-fatal failures are contained at the child that failed: it is
//! recorded, left not done, and its siblings still build. Fatal ones
//! propagate up to the enclosing collection, which is left not done while
//! the other collections carry on.
//!
//! Sources skipped for an object's own sake (its hash or its listing was
//! unavailable) are asked again on every build until they answer. An
//! interior object that gets a source back is expanded again with it.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, error, info, warn};

use super::context::EngineContext;
use super::expand::expand;
use super::types::BuildStatus;
use super::units::PatientUnits;
use crate::checkpoint::CheckpointEntry;
use crate::dispatch::{ParallelDispatcher, WorkUnit};
use crate::error::EngineError;
use crate::merkle::{Hash, HashTree};
use crate::metrics::LatencyTimer;
use crate::revision::{now_millis, Level, Revision, SourceHashes, SurrogateId};
use crate::sources::SourceMask;
use crate::storage::RevisionBatch;

/// Build the revision `id` given the sources its parent skipped.
pub fn build(ctx: &EngineContext, id: SurrogateId, inherited: SourceMask) -> BoxFuture<'_, Result<BuildStatus, EngineError>> {
    async move {
        let Some(mut revision) = ctx.store.get(&id).await? else {
            return Err(EngineError::Invariant(format!("revision {} not found", id)));
        };
        if revision.done {
            return Ok(BuildStatus::Done);
        }
        if !revision.is_live() {
            return Err(EngineError::Invariant(format!(
                "{} '{}' ({}) is retired and cannot be built",
                revision.level, revision.natural_id, id
            )));
        }
        let _timer = LatencyTimer::new(revision.level.as_str());

        let recovered = recover_sources(ctx, &mut revision, inherited).await?;
        if revision.level.is_leaf() {
            let skip = ctx.effective_skip(&revision, inherited);
            return build_instance(ctx, revision, skip).await;
        }
        if recovered && revision.expanded {
            // Listed without those sources; list again with them.
            revision.expanded = false;
        }

        if !revision.expanded {
            let skip = ctx.effective_skip(&revision, inherited);
            expand(ctx, &mut revision, skip).await?;
        }
        let skip = ctx.effective_skip(&revision, inherited);

        let pending: Vec<Revision> = ctx
            .store
            .children(&revision.surrogate_id)
            .await?
            .into_iter()
            .filter(|child| !child.done)
            .collect();

        let complete = if pending.is_empty() {
            true
        } else if revision.level == Level::Collection {
            build_patients(ctx, &revision, pending, skip).await?
        } else {
            build_inline(ctx, pending, skip).await?
        };

        if !complete {
            debug!(level = %revision.level, natural_id = %revision.natural_id, "Children pending, not hashing yet");
            return Ok(BuildStatus::Pending);
        }
        finish(ctx, revision, skip).await
    }
    .boxed()
}

/// Build children one after another. Returns whether all reached done.
async fn build_inline(ctx: &EngineContext, pending: Vec<Revision>, skip: SourceMask) -> Result<bool, EngineError> {
    let mut complete = true;
    for child in pending {
        match build(ctx, child.surrogate_id, skip).await {
            Ok(BuildStatus::Done) => {}
            Ok(BuildStatus::Pending) => complete = false,
            Err(e) if e.is_fatal() && child.level == Level::Collection => {
                error!(
                    natural_id = %child.natural_id,
                    kind = e.kind(),
                    error = %e,
                    "Collection aborted, continuing with the others"
                );
                ctx.record_failure(child.level, &child.natural_id, &e);
                complete = false;
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(
                    level = %child.level,
                    natural_id = %child.natural_id,
                    class = %e.class(),
                    error = %e,
                    "Object left not done"
                );
                ctx.record_failure(child.level, &child.natural_id, &e);
                complete = false;
            }
        }
    }
    Ok(complete)
}

/// One work unit per pending patient, spread over the worker pool.
async fn build_patients(
    ctx: &EngineContext,
    collection: &Revision,
    pending: Vec<Revision>,
    skip: SourceMask,
) -> Result<bool, EngineError> {
    let units = pending
        .iter()
        .enumerate()
        .map(|(index, patient)| WorkUnit {
            index,
            parent_natural_id: collection.natural_id.clone(),
            child_natural_id: patient.natural_id.clone(),
            child: patient.surrogate_id,
            skip,
        })
        .collect();

    let dispatcher = ParallelDispatcher::new(
        ctx.config.worker_count,
        ctx.config.unit_retry(),
        ctx.config.run_timeout(),
    );
    let mut report = dispatcher
        .run(Arc::new(PatientUnits::new(ctx.clone())), units)
        .await?;

    if let Some(fatal) = report.take_fatal() {
        return Err(fatal);
    }
    for failure in &report.failed {
        ctx.record_failure(Level::Patient, &failure.unit.child_natural_id, &failure.error);
    }
    Ok(report.is_complete())
}

/// Hash a parent whose children are all done, verify and mark it done.
async fn finish(ctx: &EngineContext, mut revision: Revision, skip: SourceMask) -> Result<BuildStatus, EngineError> {
    let children = ctx.store.children(&revision.surrogate_id).await?;
    if let Some(child) = children.iter().find(|c| !c.done) {
        return Err(EngineError::Invariant(format!(
            "{} '{}' hashed while child '{}' is not done",
            revision.level, revision.natural_id, child.natural_id
        )));
    }

    if revision.level == Level::Series && ctx.config.verify_series_archive {
        check_archive(ctx, &revision, &children).await?;
    }

    let sources = ctx.sources();
    let mut computed = SourceHashes::empty(sources);
    for i in 0..sources {
        computed.set(i, HashTree::merkle(children.iter().map(|c| c.source_hashes.get(i))));
    }
    let aggregate = HashTree::merkle(children.iter().flat_map(|c| c.source_hashes.present()));

    // A source skipped for any child has no trustworthy hash for it, so
    // the parent cannot be checked against that source either.
    let mut unverifiable = children
        .iter()
        .fold(skip, |mask, c| mask | ctx.effective_skip(c, SourceMask::NONE));

    let expected = if revision.level == Level::Version {
        let (live, unavailable) = ctx
            .view
            .object_hashes(&revision.object_ref(), skip, ctx.view.all())
            .await?;
        unverifiable = unverifiable | unavailable;
        live
    } else {
        revision.source_hashes.clone()
    };
    verify(ctx, &revision, &computed, &expected, unverifiable)?;

    if revision.level == Level::Version {
        revision.source_hashes = expected;
    }
    revision.revised = predecessor_differs(ctx, &revision, &aggregate).await?;
    revision.aggregate_hash = aggregate;
    revision.size_bytes = children.iter().map(|c| c.size_bytes).sum();
    if let Some(latest) = children.iter().map(|c| c.max_timestamp).max() {
        revision.max_timestamp = latest;
    }
    mark_done(ctx, revision).await
}

fn verify(
    ctx: &EngineContext,
    revision: &Revision,
    computed: &SourceHashes,
    expected: &SourceHashes,
    unverifiable: SourceMask,
) -> Result<(), EngineError> {
    for i in (0..ctx.sources()).filter(|i| !unverifiable.contains(*i)) {
        if computed.get(i) != expected.get(i) {
            crate::metrics::record_hash_mismatch(revision.level.as_str());
            error!(
                level = %revision.level,
                natural_id = %revision.natural_id,
                surrogate_id = %revision.surrogate_id,
                source = ctx.view.source_name(i),
                expected = expected.get(i),
                computed = computed.get(i),
                "Hash mismatch, object left not done"
            );
            return Err(EngineError::HashMismatch {
                level: revision.level,
                natural_id: revision.natural_id.clone(),
                source_name: ctx.view.source_name(i).to_string(),
                expected: expected.get(i).to_string(),
                actual: computed.get(i).to_string(),
            });
        }
    }
    Ok(())
}

/// One stored payload per live instance.
async fn check_archive(ctx: &EngineContext, series: &Revision, instances: &[Revision]) -> Result<(), EngineError> {
    let objects = ctx.transfer.objects();
    let mut found = 0;
    for instance in instances {
        if let Some(meta) = objects.head(&instance.payload_key()).await? {
            if meta.hash == instance.aggregate_hash {
                found += 1;
            }
        }
    }
    if found != instances.len() {
        warn!(
            natural_id = %series.natural_id,
            expected = instances.len(),
            found,
            "Series payloads incomplete"
        );
        return Err(EngineError::ArchiveIntegrity {
            natural_id: series.natural_id.clone(),
            expected: instances.len(),
            found,
        });
    }
    Ok(())
}

/// Re-ask sources in the revision's own skip mask (not inherited, not
/// excluded by a rule). Those that answer get their current hash recorded
/// and leave the mask. Returns whether any source came back.
async fn recover_sources(ctx: &EngineContext, revision: &mut Revision, inherited: SourceMask) -> Result<bool, EngineError> {
    let excluded = inherited | ctx.rule_skip(revision);
    let own = revision.skip_mask.difference(excluded);
    if own.is_empty() {
        return Ok(false);
    }
    let (hashes, unavailable) = ctx
        .view
        .object_hashes(&revision.object_ref(), excluded, own)
        .await?;
    let recovered = own.difference(unavailable);
    if recovered.is_empty() {
        return Ok(false);
    }
    for i in recovered.indexes() {
        revision.source_hashes.set(i, hashes.get(i));
    }
    revision.skip_mask = revision.skip_mask.difference(recovered);
    debug!(
        level = %revision.level,
        natural_id = %revision.natural_id,
        recovered = %recovered,
        "Sources available again"
    );
    Ok(true)
}

async fn build_instance(ctx: &EngineContext, mut revision: Revision, skip: SourceMask) -> Result<BuildStatus, EngineError> {
    let reported: Option<Hash> = (0..ctx.sources())
        .filter(|i| !skip.contains(*i))
        .map(|i| revision.source_hashes.get(i))
        .find(|h| !h.is_empty())
        .map(str::to_string);

    let checkpointed = match (&ctx.checkpoint, &reported) {
        (Some(log), Some(hash)) => log.completed(&revision.natural_id, revision.surrogate_id, hash),
        _ => None,
    };

    let (hash, size) = match checkpointed {
        Some(entry) => {
            debug!(natural_id = %revision.natural_id, "Payload already stored per checkpoint log");
            (entry.hash, entry.size)
        }
        None => {
            let outcome = ctx.transfer.transfer(&revision, skip).await?;
            if let Some(log) = &ctx.checkpoint {
                log.record(CheckpointEntry {
                    natural_id: revision.natural_id.clone(),
                    surrogate_id: revision.surrogate_id,
                    hash: outcome.hash.clone(),
                    size: outcome.size,
                })
                .await?;
            }
            (outcome.hash, outcome.size)
        }
    };

    revision.revised = predecessor_differs(ctx, &revision, &hash).await?;
    revision.aggregate_hash = hash;
    revision.size_bytes = size;
    revision.max_timestamp = now_millis();
    mark_done(ctx, revision).await
}

async fn predecessor_differs(ctx: &EngineContext, revision: &Revision, aggregate: &str) -> Result<bool, EngineError> {
    if revision.is_new {
        return Ok(false);
    }
    let Some(predecessor) = revision.predecessor else {
        return Ok(false);
    };
    Ok(ctx
        .store
        .get(&predecessor)
        .await?
        .is_some_and(|p| p.aggregate_hash != aggregate))
}

async fn mark_done(ctx: &EngineContext, mut revision: Revision) -> Result<BuildStatus, EngineError> {
    revision.done = true;
    revision.expanded = true;
    revision.rev_version = ctx.version;

    let mut batch = RevisionBatch::new();
    batch.put(revision.clone());
    ctx.store.commit(batch).await?;

    crate::metrics::record_done(revision.level.as_str());
    if matches!(revision.level, Level::Version | Level::Collection) {
        info!(
            level = %revision.level,
            natural_id = %revision.natural_id,
            version = ctx.version,
            aggregate_hash = %revision.aggregate_hash,
            revised = revision.revised,
            "Done"
        );
    } else {
        debug!(
            level = %revision.level,
            natural_id = %revision.natural_id,
            aggregate_hash = %revision.aggregate_hash,
            "Done"
        );
    }
    Ok(BuildStatus::Done)
}
