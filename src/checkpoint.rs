// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Append-only log of completed instance transfers.
//!
//! One JSON object per line. On restart the log is replayed into an
//! in-memory index so an instance whose payload already reached the object
//! store is marked done without fetching it again, even before the catalog
//! is consulted. A torn trailing line from a crash is skipped.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::merkle::Hash;
use crate::revision::SurrogateId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub natural_id: String,
    pub surrogate_id: SurrogateId,
    pub hash: Hash,
    pub size: u64,
}

pub struct CheckpointLog {
    path: PathBuf,
    index: DashMap<String, CheckpointEntry>,
    file: Mutex<File>,
}

impl CheckpointLog {
    /// Open (or create) the log at `path` and replay it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        let index = DashMap::new();
        let mut needs_newline = false;

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                needs_newline = !contents.is_empty() && !contents.ends_with('\n');
                let mut skipped = 0usize;
                for (line_no, line) in contents.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<CheckpointEntry>(line) {
                        Ok(entry) => {
                            index.insert(entry.natural_id.clone(), entry);
                        }
                        Err(e) => {
                            skipped += 1;
                            warn!(path = %path.display(), line = line_no + 1, error = %e, "Skipping malformed checkpoint line");
                        }
                    }
                }
                info!(path = %path.display(), entries = index.len(), skipped, "Checkpoint log replayed");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Starting new checkpoint log");
            }
            Err(e) => return Err(e.into()),
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if needs_newline {
            file.write_all(b"\n").await?;
        }

        Ok(Self {
            path,
            index,
            file: Mutex::new(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The logged transfer for this exact revision and content, if any.
    /// A later entry for the same natural id supersedes earlier ones.
    pub fn completed(&self, natural_id: &str, surrogate_id: SurrogateId, hash: &str) -> Option<CheckpointEntry> {
        let hit = self
            .index
            .get(natural_id)
            .filter(|e| e.surrogate_id == surrogate_id && e.hash == hash)
            .map(|e| e.value().clone());
        crate::metrics::record_checkpoint(hit.is_some());
        hit
    }

    /// Append an entry and flush it to disk.
    pub async fn record(&self, entry: CheckpointEntry) -> Result<(), EngineError> {
        let mut line = serde_json::to_string(&entry).map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
        line.push('\n');
        {
            let mut file = self.file.lock().await;
            file.write_all(line.as_bytes()).await?;
            file.sync_data().await?;
        }
        self.index.insert(entry.natural_id.clone(), entry);
        Ok(())
    }
}
