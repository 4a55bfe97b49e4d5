// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Merged view over every configured source.
//!
//! A child exists if any non-skipped source lists it. For each child the
//! view records which sources listed it and the hash each reported, then
//! diffs that against the catalog's current children.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::mask::SourceMask;
use super::traits::{SourceAdapter, SourceError};
use crate::error::EngineError;
use crate::revision::{Level, ObjectRef, Revision, SourceHashes};

/// Concurrent `object_hash` lookups per listing.
const LOOKUP_CONCURRENCY: usize = 16;

/// What the sources currently say about one child.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedChild {
    pub natural_id: String,
    /// Sources that listed the child
    pub presence: SourceMask,
    /// Hash per source; empty where the source did not list it or was skipped
    pub hashes: SourceHashes,
    /// Sources that listed the child but could not hash it
    pub skip: SourceMask,
}

/// A catalog child that is still reported (or protected by a skipped source).
#[derive(Debug, Clone)]
pub struct ExistingChild {
    pub current: Revision,
    pub observed: ObservedChild,
    pub revised: bool,
}

/// Result of reconciling one parent's children.
#[derive(Debug, Clone, Default)]
pub struct ChildDiff {
    /// Sources whose listing was unavailable
    pub listing_skip: SourceMask,
    pub new: Vec<ObservedChild>,
    pub existing: Vec<ExistingChild>,
    pub retired: Vec<Revision>,
}

impl ChildDiff {
    pub fn new_ids(&self) -> Vec<&str> {
        self.new.iter().map(|c| c.natural_id.as_str()).collect()
    }

    pub fn existing_ids(&self) -> Vec<&str> {
        self.existing.iter().map(|c| c.current.natural_id.as_str()).collect()
    }

    pub fn revised_ids(&self) -> Vec<&str> {
        self.existing
            .iter()
            .filter(|c| c.revised)
            .map(|c| c.current.natural_id.as_str())
            .collect()
    }

    pub fn retired_ids(&self) -> Vec<&str> {
        self.retired.iter().map(|c| c.natural_id.as_str()).collect()
    }
}

pub struct MultiSourceView {
    sources: Vec<Arc<dyn SourceAdapter>>,
}

impl MultiSourceView {
    pub fn new(sources: Vec<Arc<dyn SourceAdapter>>) -> Self {
        Self { sources }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    #[must_use]
    pub fn source(&self, index: usize) -> Option<&Arc<dyn SourceAdapter>> {
        self.sources.get(index)
    }

    #[must_use]
    pub fn source_name(&self, index: usize) -> &str {
        self.sources.get(index).map_or("?", |s| s.name())
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Diff `current` (the parent's live children in the catalog) against
    /// what the non-skipped sources report under `parent`.
    ///
    /// Output lists are ordered by natural id whatever order the sources
    /// answered in.
    pub async fn reconcile_children(
        &self,
        parent: &Revision,
        current: &[Revision],
        skip: SourceMask,
    ) -> Result<ChildDiff, EngineError> {
        self.reconcile_children_with(parent, current, skip, &|_| SourceMask::NONE)
            .await
    }

    /// As [`reconcile_children`](Self::reconcile_children), with extra
    /// sources skipped per child id (configured skip rules). Those sources
    /// neither make the child exist nor count in its comparison, and are
    /// recorded in the child's skip mask.
    pub async fn reconcile_children_with(
        &self,
        parent: &Revision,
        current: &[Revision],
        skip: SourceMask,
        per_child: &(dyn Fn(&str) -> SourceMask + Sync),
    ) -> Result<ChildDiff, EngineError> {
        let child_level = parent.level.child().ok_or_else(|| {
            EngineError::Invariant(format!("{} '{}' has no children", parent.level, parent.natural_id))
        })?;
        let parent_ref = parent.object_ref();

        let listings = join_all(
            self.sources
                .iter()
                .enumerate()
                .filter(|(i, _)| !skip.contains(*i))
                .map(|(i, source)| {
                    let parent_ref = &parent_ref;
                    async move { (i, source.list_children(parent_ref).await) }
                }),
        )
        .await;

        let mut listing_skip = SourceMask::NONE;
        let mut presence: BTreeMap<String, SourceMask> = BTreeMap::new();
        for (i, result) in listings {
            let source_name = self.source_name(i);
            match result {
                Ok(ids) => {
                    let mut seen = HashSet::with_capacity(ids.len());
                    for id in ids {
                        if !seen.insert(id.clone()) {
                            error!(
                                level = %child_level,
                                natural_id = %id,
                                source = source_name,
                                parent = %parent.natural_id,
                                "Duplicate natural id in listing"
                            );
                            return Err(EngineError::DuplicateNaturalId {
                                level: child_level,
                                natural_id: id,
                                source_name: source_name.to_string(),
                                parent: parent.natural_id.clone(),
                            });
                        }
                        if !per_child(&id).contains(i) {
                            presence.entry(id).or_default().insert(i);
                        }
                    }
                }
                Err(SourceError::Unavailable(message)) => {
                    warn!(
                        source = source_name,
                        parent = %parent_ref,
                        %message,
                        "Listing unavailable, skipping source"
                    );
                    crate::metrics::record_source_skip(source_name, parent.level.as_str());
                    listing_skip.insert(i);
                }
                Err(SourceError::NotFound(_)) => {}
                Err(SourceError::Backend(message)) => {
                    return Err(EngineError::Source {
                        source_name: source_name.to_string(),
                        object: parent_ref.to_string(),
                        message,
                    });
                }
            }
        }
        let effective = skip | listing_skip;

        let observed: Vec<Result<ObservedChild, EngineError>> = stream::iter(presence)
            .map(|(id, present)| {
                let configured = per_child(&id);
                self.observe(child_level, id, present, effective, configured)
            })
            .buffer_unordered(LOOKUP_CONCURRENCY)
            .collect()
            .await;
        let mut observed_by_id: BTreeMap<String, ObservedChild> = BTreeMap::new();
        for child in observed {
            let child = child?;
            observed_by_id.insert(child.natural_id.clone(), child);
        }

        let mut diff = ChildDiff {
            listing_skip,
            ..ChildDiff::default()
        };
        let mut current_by_id: BTreeMap<&str, &Revision> = BTreeMap::new();
        for child in current {
            current_by_id.insert(child.natural_id.as_str(), child);
        }

        for (id, child) in &observed_by_id {
            if !current_by_id.contains_key(id.as_str()) {
                diff.new.push(child.clone());
            }
        }

        for (id, revision) in current_by_id {
            let observed = match observed_by_id.get(id) {
                Some(observed) => observed.clone(),
                None => {
                    // Kept only while a skipped source still vouches for it.
                    let silent = effective | per_child(id);
                    let protected = silent
                        .indexes()
                        .any(|i| !revision.source_hashes.get(i).is_empty());
                    if !protected {
                        diff.retired.push(revision.clone());
                        continue;
                    }
                    debug!(
                        level = %revision.level,
                        natural_id = %revision.natural_id,
                        "Unlisted child kept, a skipped source still knows it"
                    );
                    ObservedChild {
                        natural_id: revision.natural_id.clone(),
                        presence: SourceMask::NONE,
                        hashes: SourceHashes::empty(self.sources.len()),
                        skip: per_child(id),
                    }
                }
            };
            let excluded = effective | observed.skip;
            let revised = (0..self.sources.len())
                .filter(|i| !excluded.contains(*i))
                .any(|i| revision.source_hashes.get(i) != observed.hashes.get(i));
            diff.existing.push(ExistingChild {
                current: revision.clone(),
                observed,
                revised,
            });
        }

        Ok(diff)
    }

    async fn observe(
        &self,
        level: Level,
        natural_id: String,
        presence: SourceMask,
        skip: SourceMask,
        configured: SourceMask,
    ) -> Result<ObservedChild, EngineError> {
        let object = ObjectRef::new(level, natural_id.clone());
        let (hashes, unavailable) = self.object_hashes(&object, skip | configured, presence).await?;
        Ok(ObservedChild {
            natural_id,
            presence,
            hashes,
            skip: unavailable | configured,
        })
    }

    /// Ask every source in `ask` (minus `skip`) for the object's hash.
    /// Returns the hashes and the sources that were unavailable.
    pub async fn object_hashes(
        &self,
        object: &ObjectRef,
        skip: SourceMask,
        ask: SourceMask,
    ) -> Result<(SourceHashes, SourceMask), EngineError> {
        let results = join_all(
            ask.indexes()
                .filter(|i| !skip.contains(*i))
                .filter_map(|i| self.sources.get(i).map(|source| (i, source)))
                .map(|(i, source)| async move { (i, source.object_hash(object).await) }),
        )
        .await;

        let mut hashes = SourceHashes::empty(self.sources.len());
        let mut unavailable = SourceMask::NONE;
        for (i, result) in results {
            match result {
                Ok(hash) => hashes.set(i, hash),
                Err(SourceError::Unavailable(message)) => {
                    warn!(source = self.source_name(i), %object, %message, "Hash unavailable, skipping source");
                    crate::metrics::record_source_skip(self.source_name(i), object.level.as_str());
                    unavailable.insert(i);
                }
                Err(SourceError::NotFound(_)) => {}
                Err(SourceError::Backend(message)) => {
                    return Err(EngineError::Source {
                        source_name: self.source_name(i).to_string(),
                        object: object.to_string(),
                        message,
                    });
                }
            }
        }
        Ok((hashes, unavailable))
    }

    /// Every source, as an `ask` mask.
    #[must_use]
    pub fn all(&self) -> SourceMask {
        (0..self.sources.len()).fold(SourceMask::NONE, SourceMask::with)
    }

    /// Descriptive metadata from the first non-skipped source that has any.
    pub async fn metadata(&self, object: &ObjectRef, skip: SourceMask) -> Option<Value> {
        for (i, source) in self.sources.iter().enumerate() {
            if skip.contains(i) {
                continue;
            }
            match source.metadata(object).await {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(e) => debug!(source = source.name(), %object, error = %e, "Metadata lookup failed"),
            }
        }
        None
    }
}
