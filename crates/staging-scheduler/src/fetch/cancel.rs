// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cancellation fetcher.
//!
//! Canceled files are only removed from the registry here. The poll task
//! owning their token notices the removal on its next run and aborts them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use super::FetchConfig;
use crate::drain::DrainMode;
use crate::error::Result;
use crate::task::TaskEnv;

/// Propagates user cancellations to the live bring-online requests.
pub struct FetchCancelStaging {
    env: Arc<TaskEnv>,
    drain: Arc<DrainMode>,
    config: FetchConfig,
    shutdown: Arc<Notify>,
}

impl FetchCancelStaging {
    /// Create a new cancellation fetcher.
    pub fn new(env: Arc<TaskEnv>, drain: Arc<DrainMode>, config: FetchConfig) -> Self {
        Self {
            env,
            drain,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Sweep cancellations until shutdown.
    pub async fn run(self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Cancellation fetcher started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Cancellation fetcher shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.next_sleep(&self.drain)) => {
                    if self.drain.is_draining() {
                        debug!("Draining, cancellation sweep skipped");
                        continue;
                    }
                    if let Err(e) = self.pass().await {
                        error!(error = %e, "BRINGONLINE cancellation pass failed");
                    }
                }
            }
        }
    }

    /// Run one sweep. Returns the number of live URLs canceled.
    pub async fn pass(&self) -> Result<usize> {
        let rows = self.env.store.get_staging_files_for_canceling().await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let mut by_token: HashMap<Option<String>, Vec<String>> = HashMap::new();
        for row in rows {
            by_token
                .entry(row.token.filter(|t| !t.is_empty()))
                .or_default()
                .push(row.surl);
        }

        let removed = self.env.registry.cancel(&by_token);
        info!(
            tokens = by_token.len(),
            urls = removed,
            "BRINGONLINE canceled files removed from active requests"
        );
        Ok(removed)
    }
}
