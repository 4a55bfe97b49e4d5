// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! External catalog sources.
//!
//! Each source implements [`SourceAdapter`]. [`MultiSourceView`] merges any
//! number of them (up to [`SourceMask::MAX_SOURCES`]): an object exists if
//! any non-skipped source reports it, and a source that cannot answer is
//! skipped for that object and everything under it rather than read as
//! empty.

mod guarded;
mod mask;
mod memory;
mod traits;
mod view;

pub use guarded::GuardedSource;
pub use mask::SourceMask;
pub use memory::MemorySource;
pub use traits::{SourceAdapter, SourceError};
pub use view::{ChildDiff, ExistingChild, MultiSourceView, ObservedChild};
