// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Catalog revision records.
//!
//! A [`Revision`] is one immutable version of a catalog object's content.
//! The logical object is identified by `(level, natural_id)`; each revision
//! gets a fresh [`SurrogateId`]. Exactly one revision per logical object is
//! live (`final_version == 0`); the rest are history.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::merkle::{Hash, EMPTY_HASH};
use crate::sources::SourceMask;

/// Natural id of the single logical object at the version level.
pub const ROOT_NATURAL_ID: &str = "catalog";

/// Current time in epoch millis.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Hierarchy level, root first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Version,
    Collection,
    Patient,
    Study,
    Series,
    Instance,
}

impl Level {
    /// All levels, root first.
    pub const ALL: [Level; 6] = [
        Level::Version,
        Level::Collection,
        Level::Patient,
        Level::Study,
        Level::Series,
        Level::Instance,
    ];

    #[must_use]
    pub fn child(self) -> Option<Level> {
        match self {
            Self::Version => Some(Self::Collection),
            Self::Collection => Some(Self::Patient),
            Self::Patient => Some(Self::Study),
            Self::Study => Some(Self::Series),
            Self::Series => Some(Self::Instance),
            Self::Instance => None,
        }
    }

    #[must_use]
    pub fn parent(self) -> Option<Level> {
        match self {
            Self::Version => None,
            Self::Collection => Some(Self::Version),
            Self::Patient => Some(Self::Collection),
            Self::Study => Some(Self::Patient),
            Self::Series => Some(Self::Study),
            Self::Instance => Some(Self::Series),
        }
    }

    #[must_use]
    pub fn is_leaf(self) -> bool {
        self == Self::Instance
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::Collection => "collection",
            Self::Patient => "patient",
            Self::Study => "study",
            Self::Series => "series",
            Self::Instance => "instance",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown level '{0}'")]
pub struct ParseLevelError(pub String);

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Level::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| ParseLevelError(s.to_string()))
    }
}

/// Identifier minted once per revision, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurrogateId(Uuid);

impl SurrogateId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SurrogateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SurrogateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SurrogateId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Reference to a logical object, as sources address it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub level: Level,
    pub natural_id: String,
}

impl ObjectRef {
    pub fn new(level: Level, natural_id: impl Into<String>) -> Self {
        Self {
            level,
            natural_id: natural_id.into(),
        }
    }

    #[must_use]
    pub fn root() -> Self {
        Self::new(Level::Version, ROOT_NATURAL_ID)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.level, self.natural_id)
    }
}

/// One hash per known source, indexed by source position.
/// [`EMPTY_HASH`] means the source was skipped or does not know the object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceHashes(Vec<Hash>);

impl SourceHashes {
    /// All-empty hashes for `sources` sources.
    #[must_use]
    pub fn empty(sources: usize) -> Self {
        Self(vec![EMPTY_HASH.to_string(); sources])
    }

    #[must_use]
    pub fn from_vec(hashes: Vec<Hash>) -> Self {
        Self(hashes)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hash for source `index`, empty if out of range.
    #[must_use]
    pub fn get(&self, index: usize) -> &str {
        self.0.get(index).map_or(EMPTY_HASH, String::as_str)
    }

    pub fn set(&mut self, index: usize, hash: impl Into<Hash>) {
        if index >= self.0.len() {
            self.0.resize(index + 1, EMPTY_HASH.to_string());
        }
        self.0[index] = hash.into();
    }

    /// Pad or truncate to `sources` entries (the source list can change
    /// between runs).
    #[must_use]
    pub fn resized(mut self, sources: usize) -> Self {
        self.0.resize(sources, EMPTY_HASH.to_string());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Non-empty hashes only.
    pub fn present(&self) -> impl Iterator<Item = &str> {
        self.iter().filter(|h| !h.is_empty())
    }
}

/// Build lifecycle of an object.
///
/// `Expanding` and `Building` are in-flight states that only exist inside a
/// run; the persisted flags map to `New`, `Expanded` or `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    New,
    Expanding,
    Expanded,
    Building,
    Done,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "NEW"),
            Self::Expanding => write!(f, "EXPANDING"),
            Self::Expanded => write!(f, "EXPANDED"),
            Self::Building => write!(f, "BUILDING"),
            Self::Done => write!(f, "DONE"),
        }
    }
}

/// One immutable revision of a catalog object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub level: Level,
    /// Stable external identifier (collection name, case id, UID)
    pub natural_id: String,
    pub surrogate_id: SurrogateId,
    /// Parent revision this revision was minted under (`None` for the root)
    pub parent_ref: Option<SurrogateId>,
    /// Revision this one was cloned from (`None` if `is_new`)
    pub predecessor: Option<SurrogateId>,
    pub source_hashes: SourceHashes,
    /// Merkle hash over children's hashes; content hash for instances.
    /// Only meaningful once `done`.
    pub aggregate_hash: Hash,
    /// Payload bytes (instances) or the sum over live children
    pub size_bytes: u64,
    /// First seen (epoch millis)
    pub min_timestamp: i64,
    /// Last confirmed unchanged (epoch millis)
    pub max_timestamp: i64,
    pub init_version: u32,
    pub rev_version: u32,
    /// Version this revision was retired in; 0 while live
    pub final_version: u32,
    pub is_new: bool,
    pub expanded: bool,
    pub done: bool,
    pub revised: bool,
    /// Sources excluded when this object was observed or its children listed
    pub skip_mask: SourceMask,
    /// Descriptive fields from sources (DOI, license, ...). Never hashed.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl Revision {
    /// First revision of the version root.
    pub fn root(version: u32, sources: usize) -> Self {
        Self::fresh(
            Level::Version,
            ROOT_NATURAL_ID.to_string(),
            None,
            version,
            SourceHashes::empty(sources),
            SourceMask::NONE,
        )
    }

    /// A child the catalog has never seen.
    pub fn new_child(
        level: Level,
        natural_id: String,
        parent: SurrogateId,
        version: u32,
        source_hashes: SourceHashes,
        skip_mask: SourceMask,
    ) -> Self {
        Self::fresh(level, natural_id, Some(parent), version, source_hashes, skip_mask)
    }

    fn fresh(
        level: Level,
        natural_id: String,
        parent_ref: Option<SurrogateId>,
        version: u32,
        source_hashes: SourceHashes,
        skip_mask: SourceMask,
    ) -> Self {
        let now = now_millis();
        Self {
            level,
            natural_id,
            surrogate_id: SurrogateId::new(),
            parent_ref,
            predecessor: None,
            source_hashes,
            aggregate_hash: EMPTY_HASH.to_string(),
            size_bytes: 0,
            min_timestamp: now,
            max_timestamp: now,
            init_version: version,
            rev_version: version,
            final_version: 0,
            is_new: true,
            expanded: false,
            done: false,
            revised: false,
            skip_mask,
            metadata: Value::Null,
        }
    }

    /// Copy-on-write clone for a revised object.
    ///
    /// Scalar fields are copied; the clone has a fresh surrogate id, points
    /// back at `self` and starts un-expanded and not done. The caller copies
    /// the children edges.
    #[must_use]
    pub fn revise(&self, parent_ref: Option<SurrogateId>, version: u32) -> Self {
        Self {
            surrogate_id: SurrogateId::new(),
            parent_ref,
            predecessor: Some(self.surrogate_id),
            rev_version: version,
            final_version: 0,
            is_new: false,
            expanded: false,
            done: false,
            revised: false,
            skip_mask: SourceMask::NONE,
            ..self.clone()
        }
    }

    /// Stamp this revision as retired in `final_version`.
    pub fn retire(&mut self, final_version: u32) {
        self.final_version = final_version;
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.final_version == 0
    }

    #[must_use]
    pub fn state(&self) -> BuildState {
        if self.done {
            BuildState::Done
        } else if self.expanded {
            BuildState::Expanded
        } else {
            BuildState::New
        }
    }

    #[must_use]
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.level, self.natural_id.clone())
    }

    /// Object store key for an instance payload.
    #[must_use]
    pub fn payload_key(&self) -> String {
        self.surrogate_id.to_string()
    }
}
