// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deletion fetcher.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use super::FetchConfig;
use crate::context::{DeletionContext, GroupKey};
use crate::drain::DrainMode;
use crate::error::{Error, Result};
use crate::store::{DeletionRequest, FileState};
use crate::task::DeletionTask;
use crate::worker_pool::WorkerPool;

/// Groups pending deletions and submits one unlink per group.
pub struct FetchDeletion {
    pool: Arc<WorkerPool>,
    drain: Arc<DrainMode>,
    config: FetchConfig,
    shutdown: Arc<Notify>,
}

impl FetchDeletion {
    /// Create a new deletion fetcher.
    pub fn new(pool: Arc<WorkerPool>, drain: Arc<DrainMode>, config: FetchConfig) -> Self {
        Self {
            pool,
            drain,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Requeue interrupted deletions, then fetch until shutdown.
    pub async fn run(self) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Deletion fetcher started"
        );

        match self.pool.env().store.requeue_started_deletions().await {
            Ok(0) => {}
            Ok(count) => info!(files = count, "DELETION requeued interrupted deletions"),
            Err(e) => error!(error = %e, "DELETION could not requeue interrupted deletions"),
        }

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Deletion fetcher shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.next_sleep(&self.drain)) => {
                    if self.drain.is_draining() {
                        info!("Set to drain mode, no more checking deletions for this instance");
                        continue;
                    }
                    if let Err(e) = self.pass().await {
                        error!(error = %e, "DELETION fetch pass failed");
                    }
                }
            }
        }
    }

    /// Run one fetch pass. Returns the number of tasks submitted.
    pub async fn pass(&self) -> Result<usize> {
        let env = self.pool.env();
        let files = env.store.get_files_for_deletion().await?;
        if files.is_empty() {
            debug!("No files waiting for deletion");
            return Ok(0);
        }

        let mut groups: BTreeMap<GroupKey, Vec<DeletionRequest>> = BTreeMap::new();
        for file in files {
            groups
                .entry(DeletionContext::key_of(&file))
                .or_default()
                .push(file);
        }

        let mut submitted = 0;
        for (key, requests) in groups {
            match self.build_task(&requests).await {
                Ok(task) => {
                    self.pool.submit(task);
                    submitted += 1;
                }
                Err(e) => {
                    error!(
                        vo = %key.vo_name,
                        user_dn = %key.user_dn,
                        endpoint = %key.endpoint,
                        files = requests.len(),
                        error = %e,
                        "DELETION could not prepare group"
                    );
                    let reason = e.to_string();
                    for request in &requests {
                        env.updater.update(
                            &request.job_id,
                            request.file_id,
                            FileState::Failed,
                            &reason,
                            false,
                        );
                    }
                }
            }
        }
        Ok(submitted)
    }

    async fn build_task(&self, requests: &[DeletionRequest]) -> Result<DeletionTask> {
        let env = self.pool.env();
        let (first, rest) = requests
            .split_first()
            .ok_or_else(|| Error::Other("empty deletion group".to_string()))?;

        let mut ctx = DeletionContext::new(first, env.credentials.as_ref()).await?;
        for request in rest {
            ctx.add(request);
        }
        DeletionTask::new(ctx, env).await
    }
}
