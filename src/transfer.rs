// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Instance payload transfer into owned storage.
//!
//! fetch → hash → stage under the surrogate id → upload → read back and
//! compare → drop the staged file. Any failure leaves the instance not done;
//! a bad remote copy is deleted before the error is returned.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::error::EngineError;
use crate::merkle::{Hash, HashTree};
use crate::revision::Revision;
use crate::sources::{MultiSourceView, SourceError, SourceMask};
use crate::storage::ObjectStore;

/// Hash and size of a stored payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub hash: Hash,
    pub size: u64,
    /// Index of the source the payload was fetched from
    pub source: usize,
}

pub struct ContentTransfer {
    view: Arc<MultiSourceView>,
    objects: Arc<dyn ObjectStore>,
    staging_dir: PathBuf,
}

impl ContentTransfer {
    pub fn new(view: Arc<MultiSourceView>, objects: Arc<dyn ObjectStore>, staging_dir: PathBuf) -> Self {
        Self {
            view,
            objects,
            staging_dir,
        }
    }

    #[must_use]
    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    /// Copy the instance's payload into the object store under its
    /// surrogate id and verify the stored copy.
    #[instrument(skip(self, instance), fields(natural_id = %instance.natural_id, surrogate_id = %instance.surrogate_id))]
    pub async fn transfer(&self, instance: &Revision, skip: SourceMask) -> Result<TransferOutcome, EngineError> {
        let (source, payload) = self.fetch(instance, skip).await?;
        let hash = HashTree::content_hash(&payload);
        let size = payload.len() as u64;
        self.verify_reported(instance, skip, &hash)?;

        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let staged = self.staging_dir.join(instance.payload_key());
        if let Err(e) = tokio::fs::write(&staged, &payload).await {
            discard_staged(&staged).await;
            return Err(e.into());
        }
        drop(payload);

        let key = instance.payload_key();
        let result = self.upload_and_verify(&key, &staged, &instance.natural_id, &hash, size).await;

        discard_staged(&staged).await;

        match &result {
            Ok(()) => {
                crate::metrics::record_transfer("ok");
                crate::metrics::record_transfer_bytes(size);
                debug!(size, source = self.view.source_name(source), "Payload stored");
            }
            Err(e) => crate::metrics::record_transfer(e.kind()),
        }
        result.map(|()| TransferOutcome { hash, size, source })
    }

    /// Fetch from the first non-skipped source that reported the instance,
    /// falling through sources that are unavailable.
    async fn fetch(&self, instance: &Revision, skip: SourceMask) -> Result<(usize, Vec<u8>), EngineError> {
        let object = instance.object_ref();
        let mut last_unavailable = None;

        let candidates = (0..self.view.len())
            .filter(|i| !skip.contains(*i) && !instance.source_hashes.get(*i).is_empty());
        for i in candidates {
            let Some(source) = self.view.source(i) else {
                continue;
            };
            match source.fetch_payload(&object).await {
                Ok(bytes) => return Ok((i, bytes)),
                Err(SourceError::Unavailable(message)) => {
                    warn!(source = source.name(), %object, %message, "Payload unavailable from source");
                    last_unavailable = Some((source.name().to_string(), message));
                }
                Err(e) => {
                    return Err(EngineError::Source {
                        source_name: source.name().to_string(),
                        object: object.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        match last_unavailable {
            Some((source_name, message)) => Err(EngineError::SourceUnavailable {
                source_name,
                object: object.to_string(),
                message,
            }),
            None => Err(EngineError::TransferIntegrity {
                natural_id: instance.natural_id.clone(),
                message: "no non-skipped source reports this instance".into(),
            }),
        }
    }

    /// Every non-skipped source that reported a hash must agree with the
    /// fetched content.
    fn verify_reported(&self, instance: &Revision, skip: SourceMask, actual: &str) -> Result<(), EngineError> {
        for i in (0..self.view.len()).filter(|i| !skip.contains(*i)) {
            let expected = instance.source_hashes.get(i);
            if !expected.is_empty() && expected != actual {
                crate::metrics::record_hash_mismatch(instance.level.as_str());
                return Err(EngineError::HashMismatch {
                    level: instance.level,
                    natural_id: instance.natural_id.clone(),
                    source_name: self.view.source_name(i).to_string(),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn upload_and_verify(
        &self,
        key: &str,
        staged: &Path,
        natural_id: &str,
        hash: &str,
        size: u64,
    ) -> Result<(), EngineError> {
        self.objects.put_file(key, staged).await?;

        let problem = match self.objects.head(key).await? {
            None => Some("stored copy missing after upload".to_string()),
            Some(meta) if meta.size != size => Some(format!("stored size {} != {}", meta.size, size)),
            Some(meta) if meta.hash != hash => Some(format!("stored hash {} != {}", meta.hash, hash)),
            Some(_) => None,
        };

        if let Some(message) = problem {
            warn!(natural_id, key, %message, "Stored copy failed verification, deleting");
            self.objects.delete(key).await?;
            return Err(EngineError::TransferIntegrity {
                natural_id: natural_id.to_string(),
                message,
            });
        }
        Ok(())
    }
}

/// Remove a staged payload, complete or partial.
async fn discard_staged(staged: &Path) {
    match tokio::fs::remove_file(staged).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %staged.display(), error = %e, "Failed to remove staged payload"),
    }
}
