// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Expand: discover an object's children and bring the catalog in line.
//!
//! New children are created. Revised children are cloned (the clone starts
//! with the predecessor's children) and the predecessor retired. Unchanged
//! children keep their revision and get `max_timestamp` stamped. Children no
//! source reports are retired with their live subtree. The parent is marked
//! expanded in the same batch, so a failure before commit leaves the catalog
//! exactly as it was.
//!
//! Expanding a parent again (a skipped source came back) also sends its
//! unfinished, already expanded drafts back to be listed again, since they
//! were listed under the parent's old skip.

use tracing::{debug, info};

use super::context::EngineContext;
use crate::error::EngineError;
use crate::revision::{now_millis, Level, Revision, SourceHashes};
use crate::sources::{ObservedChild, SourceMask};
use crate::storage::RevisionBatch;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExpandSummary {
    pub new: usize,
    pub revised: usize,
    pub unchanged: usize,
    pub retired: usize,
}

/// Expand `parent` (live, not yet expanded) with `skip` already resolved.
/// On success `parent` reflects what was committed.
pub async fn expand(ctx: &EngineContext, parent: &mut Revision, skip: SourceMask) -> Result<ExpandSummary, EngineError> {
    let child_level = parent.level.child().ok_or_else(|| {
        EngineError::Invariant(format!("cannot expand {} '{}'", parent.level, parent.natural_id))
    })?;
    let current = ctx.store.children(&parent.surrogate_id).await?;

    let policy = ctx.skip_policy.clone();
    let per_child = move |id: &str| policy.for_collection(id);
    let no_rules = |_: &str| SourceMask::NONE;
    let rules: &(dyn Fn(&str) -> SourceMask + Sync) = if parent.level == Level::Version {
        &per_child
    } else {
        &no_rules
    };
    let diff = ctx
        .view
        .reconcile_children_with(parent, &current, skip, rules)
        .await?;

    let now = now_millis();
    let mut batch = RevisionBatch::new();
    let mut summary = ExpandSummary::default();
    let parent_id = parent.surrogate_id;
    let child_skip = skip | diff.listing_skip;

    for observed in &diff.new {
        let child = new_child(ctx, child_level, parent, observed, child_skip).await;
        debug!(level = %child.level, natural_id = %child.natural_id, surrogate_id = %child.surrogate_id, "New object");
        crate::metrics::record_revision(child.level.as_str(), "new");
        batch.link(parent_id, child.surrogate_id);
        batch.put(child);
        summary.new += 1;
    }

    for existing in &diff.existing {
        let current = &existing.current;
        if !existing.revised {
            if current.done {
                let mut stamped = current.clone();
                stamped.max_timestamp = now;
                batch.put(stamped);
            } else if current.expanded && ctx.is_draft(current) {
                // Listed under the skip this parent had before; list again.
                let mut relist = current.clone();
                relist.expanded = false;
                batch.put(relist);
            }
            crate::metrics::record_revision(current.level.as_str(), "unchanged");
            summary.unchanged += 1;
            continue;
        }

        let excluded = child_skip | existing.observed.skip;
        let hashes = merge_hashes(&current.source_hashes, &existing.observed.hashes, excluded, ctx.sources());
        summary.revised += 1;
        crate::metrics::record_revision(current.level.as_str(), "revised");

        if ctx.is_draft(current) {
            // Not part of any completed version yet: rework in place.
            let mut draft = current.clone();
            draft.source_hashes = hashes;
            draft.skip_mask = existing.observed.skip;
            draft.expanded = false;
            draft.done = false;
            draft.max_timestamp = now;
            debug!(level = %draft.level, natural_id = %draft.natural_id, "Draft object changed, rebuilding");
            batch.put(draft);
            continue;
        }

        let mut clone = current.revise(Some(parent_id), ctx.version);
        clone.source_hashes = hashes;
        clone.skip_mask = existing.observed.skip;
        clone.max_timestamp = now;
        let mut retired = current.clone();
        retired.retire(ctx.retire_stamp());
        debug!(
            level = %clone.level,
            natural_id = %clone.natural_id,
            predecessor = %current.surrogate_id,
            surrogate_id = %clone.surrogate_id,
            "Object revised"
        );

        batch.copy_links(current.surrogate_id, clone.surrogate_id);
        batch.unlink(parent_id, current.surrogate_id);
        batch.link(parent_id, clone.surrogate_id);
        batch.put(retired);
        batch.put(clone);
    }

    for gone in &diff.retired {
        batch.unlink(parent_id, gone.surrogate_id);
        retire_subtree(ctx, gone, &mut batch).await?;
        summary.retired += 1;
    }

    let mut expanded = parent.clone();
    expanded.expanded = true;
    expanded.skip_mask = parent.skip_mask | diff.listing_skip;
    batch.put(expanded.clone());

    ctx.store.commit(batch).await?;
    *parent = expanded;

    info!(
        level = %parent.level,
        natural_id = %parent.natural_id,
        version = ctx.version,
        new = summary.new,
        revised = summary.revised,
        unchanged = summary.unchanged,
        retired = summary.retired,
        "Expanded"
    );
    Ok(summary)
}

async fn new_child(
    ctx: &EngineContext,
    level: Level,
    parent: &Revision,
    observed: &ObservedChild,
    skip: SourceMask,
) -> Revision {
    let mut child = Revision::new_child(
        level,
        observed.natural_id.clone(),
        parent.surrogate_id,
        ctx.version,
        observed.hashes.clone().resized(ctx.sources()),
        observed.skip,
    );
    if let Some(metadata) = ctx.view.metadata(&child.object_ref(), skip | observed.skip).await {
        child.metadata = metadata;
    }
    child
}

/// Observed hashes for sources that took part, recorded ones for the rest.
fn merge_hashes(recorded: &SourceHashes, observed: &SourceHashes, excluded: SourceMask, sources: usize) -> SourceHashes {
    let mut merged = SourceHashes::empty(sources);
    for i in 0..sources {
        let hash = if excluded.contains(i) {
            recorded.get(i)
        } else {
            observed.get(i)
        };
        merged.set(i, hash);
    }
    merged
}

/// Retire `root` and every live revision under it with the same stamp.
/// Drafts of this version are dropped instead.
async fn retire_subtree(ctx: &EngineContext, root: &Revision, batch: &mut RevisionBatch) -> Result<(), EngineError> {
    let stamp = ctx.retire_stamp();
    let mut stack = vec![root.clone()];
    let mut retired = 0usize;

    while let Some(mut revision) = stack.pop() {
        if !revision.level.is_leaf() {
            stack.extend(
                ctx.store
                    .children(&revision.surrogate_id)
                    .await?
                    .into_iter()
                    .filter(Revision::is_live),
            );
        }
        crate::metrics::record_revision(revision.level.as_str(), "retired");
        if ctx.is_draft(&revision) || stamp == 0 {
            batch.discard(revision.surrogate_id);
        } else {
            revision.retire(stamp);
            batch.put(revision);
        }
        retired += 1;
    }

    debug!(
        level = %root.level,
        natural_id = %root.natural_id,
        objects = retired,
        final_version = stamp,
        "Retired subtree"
    );
    Ok(())
}
