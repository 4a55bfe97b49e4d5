// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Short-lived access token shared by every worker.
//!
//! Reads take a `parking_lot` read lock and clone the cached value; the lock
//! is never held across an await. Refresh is serialised by one async mutex
//! so concurrent workers that see an expiring token trigger a single fetch.
//! Callers ask for the token right before each call that needs it rather
//! than holding one across long work.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::CatalogConfig;
use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: Instant,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            expires_at: Instant::now() + ttl,
        }
    }
}

/// Mints tokens (OAuth refresh, metadata server, ...).
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<AccessToken, EngineError>;
}

pub struct SharedToken {
    source: Arc<dyn TokenSource>,
    cached: RwLock<Option<AccessToken>>,
    refresh: Mutex<()>,
    margin: Duration,
}

impl SharedToken {
    /// `margin`: treat the token as expired this long before it really is.
    pub fn new(source: Arc<dyn TokenSource>, margin: Duration) -> Self {
        Self {
            source,
            cached: RwLock::new(None),
            refresh: Mutex::new(()),
            margin,
        }
    }

    /// Refresh margin taken from `token_refresh_margin_secs`.
    pub fn from_config(source: Arc<dyn TokenSource>, config: &CatalogConfig) -> Self {
        Self::new(source, config.token_refresh_margin())
    }

    /// A token valid for at least `margin`, refreshing if needed.
    pub async fn get(&self) -> Result<String, EngineError> {
        if let Some(token) = self.fresh() {
            return Ok(token);
        }

        let _refreshing = self.refresh.lock().await;
        // Another worker may have refreshed while we waited.
        if let Some(token) = self.fresh() {
            return Ok(token);
        }

        match self.source.fetch().await {
            Ok(token) => {
                crate::metrics::record_token_refresh(true);
                debug!(ttl_secs = token.expires_at.saturating_duration_since(Instant::now()).as_secs(), "Access token refreshed");
                let value = token.value.clone();
                *self.cached.write() = Some(token);
                Ok(value)
            }
            Err(e) => {
                crate::metrics::record_token_refresh(false);
                warn!(error = %e, "Access token refresh failed");
                Err(e)
            }
        }
    }

    /// Drop the cached token, e.g. after the remote side rejected it.
    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }

    fn fresh(&self) -> Option<String> {
        let cached = self.cached.read();
        cached
            .as_ref()
            .filter(|t| t.expires_at.saturating_duration_since(Instant::now()) > self.margin)
            .map(|t| t.value.clone())
    }
}
