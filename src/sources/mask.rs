// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-source bitmaps.
//!
//! The same shape serves as a skip mask (sources excluded for an object and
//! its descendants) and a presence bitmap (sources that listed a child).
//! Bit `i` is source index `i`; at most [`SourceMask::MAX_SOURCES`] sources.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceMask(u64);

impl SourceMask {
    pub const MAX_SOURCES: usize = 64;
    pub const NONE: SourceMask = SourceMask(0);

    #[must_use]
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Mask with only source `index` set.
    #[must_use]
    pub fn single(index: usize) -> Self {
        Self::NONE.with(index)
    }

    /// Copy with source `index` set. Out-of-range indexes are ignored.
    #[must_use]
    pub fn with(self, index: usize) -> Self {
        if index >= Self::MAX_SOURCES {
            return self;
        }
        Self(self.0 | (1u64 << index))
    }

    pub fn insert(&mut self, index: usize) {
        *self = self.with(index);
    }

    #[must_use]
    pub fn contains(self, index: usize) -> bool {
        index < Self::MAX_SOURCES && self.0 & (1u64 << index) != 0
    }

    #[must_use]
    pub fn union(self, other: SourceMask) -> Self {
        Self(self.0 | other.0)
    }

    /// Sources set here but not in `other`.
    #[must_use]
    pub fn difference(self, other: SourceMask) -> Self {
        Self(self.0 & !other.0)
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Set indexes, ascending.
    pub fn indexes(self) -> impl Iterator<Item = usize> {
        (0..Self::MAX_SOURCES).filter(move |i| self.contains(*i))
    }

    /// True if every one of `sources` sources is set.
    #[must_use]
    pub fn covers(self, sources: usize) -> bool {
        (0..sources.min(Self::MAX_SOURCES)).all(|i| self.contains(i))
    }
}

impl std::ops::BitOr for SourceMask {
    type Output = SourceMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl fmt::Display for SourceMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#b}", self.0)
    }
}
