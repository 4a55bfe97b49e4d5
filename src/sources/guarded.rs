// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::traits::{SourceAdapter, SourceError};
use crate::merkle::Hash;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitStats};
use crate::revision::ObjectRef;

/// Wraps an adapter in a circuit breaker. While the circuit is open every
/// call fails with [`SourceError::Unavailable`], which the engine turns
/// into a skip.
pub struct GuardedSource {
    inner: Arc<dyn SourceAdapter>,
    circuit: CircuitBreaker,
}

impl GuardedSource {
    pub fn new(inner: Arc<dyn SourceAdapter>, config: CircuitConfig) -> Self {
        let circuit = CircuitBreaker::new(format!("source_{}", inner.name()), config);
        Self { inner, circuit }
    }

    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        self.circuit.stats()
    }

    fn map_err(&self, err: CircuitError<SourceError>) -> SourceError {
        match err {
            CircuitError::Rejected => {
                SourceError::Unavailable(format!("circuit open for {}", self.inner.name()))
            }
            CircuitError::Inner(e) => e,
        }
    }
}

#[async_trait]
impl SourceAdapter for GuardedSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn list_children(&self, parent: &ObjectRef) -> Result<Vec<String>, SourceError> {
        self.circuit
            .call(|| self.inner.list_children(parent))
            .await
            .map_err(|e| self.map_err(e))
    }

    async fn object_hash(&self, object: &ObjectRef) -> Result<Hash, SourceError> {
        self.circuit
            .call(|| self.inner.object_hash(object))
            .await
            .map_err(|e| self.map_err(e))
    }

    async fn metadata(&self, object: &ObjectRef) -> Result<Option<Value>, SourceError> {
        self.circuit
            .call(|| self.inner.metadata(object))
            .await
            .map_err(|e| self.map_err(e))
    }

    async fn fetch_payload(&self, instance: &ObjectRef) -> Result<Vec<u8>, SourceError> {
        self.circuit
            .call(|| self.inner.fetch_payload(instance))
            .await
            .map_err(|e| self.map_err(e))
    }
}
