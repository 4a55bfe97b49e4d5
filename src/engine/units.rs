// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use tracing::debug;

use super::build::build;
use super::context::EngineContext;
use super::types::BuildStatus;
use crate::dispatch::{UnitHandler, WorkUnit};
use crate::error::EngineError;
use crate::revision::Level;

/// Builds one patient subtree per unit. Each worker gets its own
/// repository handle from the connector.
pub struct PatientUnits {
    ctx: EngineContext,
}

impl PatientUnits {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl UnitHandler for PatientUnits {
    type Worker = EngineContext;

    async fn open_worker(&self, worker: usize) -> Result<EngineContext, EngineError> {
        let store = self.ctx.connector.connect().await?;
        debug!(worker, version = self.ctx.version, "Worker connected");
        Ok(self.ctx.with_store(store))
    }

    async fn close_worker(&self, ctx: EngineContext) {
        ctx.store.close().await;
    }

    async fn process(&self, ctx: &EngineContext, unit: &WorkUnit) -> Result<(), EngineError> {
        match build(ctx, unit.child, unit.skip).await? {
            BuildStatus::Done => Ok(()),
            BuildStatus::Pending => Err(EngineError::Incomplete {
                level: Level::Patient,
                natural_id: unit.child_natural_id.clone(),
            }),
        }
    }
}
