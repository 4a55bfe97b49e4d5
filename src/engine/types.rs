// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::fmt;

use crate::error::ErrorClass;
use crate::revision::Level;
use crate::storage::LevelCounts;

/// Where a build left an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Done,
    /// Some descendant is not done yet; resumable on the next run
    Pending,
}

impl BuildStatus {
    #[must_use]
    pub fn is_done(self) -> bool {
        self == Self::Done
    }
}

/// What happened to the version a run worked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOutcome {
    /// Root done and its content differs from the previous version
    Accepted,
    /// Root done with the same content as the previous version; the
    /// version was egested and the previous one is live again
    RolledBack,
    /// Root not done; the next run resumes the same version
    Incomplete,
}

impl fmt::Display for VersionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::Incomplete => write!(f, "incomplete"),
        }
    }
}

/// An object a run could not finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedObject {
    pub level: Level,
    pub natural_id: String,
    /// Metric label of the last error
    pub kind: &'static str,
    pub class: ErrorClass,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    /// Version the run worked on
    pub version: u32,
    /// Version that is live after the run
    pub live_version: u32,
    pub outcome: VersionOutcome,
    /// Counts for every level, root first
    pub counts: Vec<(Level, LevelCounts)>,
    /// Objects still not done because of an error in this run
    pub failed: Vec<FailedObject>,
}

impl RunReport {
    /// True when every object in scope reached done.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcome != VersionOutcome::Incomplete
    }

    #[must_use]
    pub fn counts_for(&self, level: Level) -> LevelCounts {
        self.counts
            .iter()
            .find(|(l, _)| *l == level)
            .map(|(_, c)| *c)
            .unwrap_or_default()
    }

    /// Failures that need an operator before the version can finish.
    #[must_use]
    pub fn has_fatal(&self) -> bool {
        self.failed.iter().any(|f| f.class == ErrorClass::Fatal)
    }

    #[must_use]
    pub fn not_done(&self) -> u64 {
        self.counts.iter().map(|(_, c)| c.not_done).sum()
    }
}
