// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Order-independent aggregate hashing over a set of child hashes.
//!
//! Every catalog object carries one hash per source plus an aggregate. A
//! parent's hash is derived only from its children's hashes, so a change
//! anywhere in a subtree surfaces at every ancestor without re-reading leaf
//! payloads.

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Lowercase hex SHA-256 digest.
pub type Hash = String;

/// Sentinel for "no hash": an empty child set, or a source that does not
/// know the object.
pub const EMPTY_HASH: &str = "";

/// Pure hashing functions. No state.
#[derive(Debug)]
pub struct HashTree;

impl HashTree {
    /// Content digest of a single payload.
    #[must_use]
    pub fn content_hash(payload: &[u8]) -> Hash {
        hex::encode(Sha256::digest(payload))
    }

    /// Aggregate hash of a set of child hashes.
    ///
    /// Empty strings are ignored and duplicates collapse (set semantics). The
    /// survivors are sorted lexicographically, concatenated and digested.
    /// An empty set yields [`EMPTY_HASH`].
    #[must_use]
    pub fn merkle<I, S>(hashes: I) -> Hash
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let sorted: BTreeSet<String> = hashes
            .into_iter()
            .filter(|h| !h.as_ref().is_empty())
            .map(|h| h.as_ref().to_string())
            .collect();

        if sorted.is_empty() {
            return EMPTY_HASH.to_string();
        }

        let mut hasher = Sha256::new();
        // BTreeSet iterates in sorted order
        for hash in &sorted {
            hasher.update(hash.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// True if `hash` is the empty sentinel.
    #[inline]
    #[must_use]
    pub fn is_empty(hash: &str) -> bool {
        hash == EMPTY_HASH
    }
}
