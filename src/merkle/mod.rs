// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Merkle hashing for catalog verification.
//!
//! # Design
//!
//! The catalog is a five-level tree under a version root:
//!
//! ```text
//! version ────────────── merkle(collections)
//! └── collection ─────── merkle(patients)
//!     └── patient ────── merkle(studies)
//!         └── study ──── merkle(series)
//!             └── series merkle(instances)
//!                 └── instance ── content_hash(payload)
//! ```
//!
//! Hashes are computed per source (each source's view of the subtree) and
//! once across all sources (the aggregate). A parent is only hashed after
//! every live child is done, so a parent's hash proves its content is the
//! exact aggregate of its children's.

mod hash_tree;

pub use hash_tree::{Hash, HashTree, EMPTY_HASH};
