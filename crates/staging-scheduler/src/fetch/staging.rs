// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Staging fetcher.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use super::FetchConfig;
use crate::context::{GroupKey, StagingContext};
use crate::drain::DrainMode;
use crate::error::{Error, Result};
use crate::remote::Operation;
use crate::store::{FileState, StagingRequest, StartedStaging};
use crate::task::{BringOnlineTask, PollTask, TaskSession};
use crate::worker_pool::WorkerPool;

/// Groups pending staging requests and submits one bring-online per group.
pub struct FetchStaging {
    pool: Arc<WorkerPool>,
    drain: Arc<DrainMode>,
    config: FetchConfig,
    shutdown: Arc<Notify>,
}

impl FetchStaging {
    /// Create a new staging fetcher.
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

    /// Requeue files interrupted before a token, recover issued tokens, then
    /// fetch until shutdown.
    pub async fn run(self) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Staging fetcher started"
        );

        match self.pool.env().store.requeue_started_staging().await {
            Ok(0) => {}
            Ok(count) => info!(files = count, "BRINGONLINE requeued files started without a token"),
            Err(e) => error!(error = %e, "BRINGONLINE could not requeue interrupted files"),
        }

        match self.recover().await {
            Ok(0) => {}
            Ok(count) => info!(tokens = count, "BRINGONLINE recovered started requests"),
            Err(e) => error!(error = %e, "BRINGONLINE could not recover started requests"),
        }

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Staging fetcher shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.next_sleep(&self.drain)) => {
                    if self.drain.is_draining() {
                        info!("Set to drain mode, no more checking stage-in files for this instance");
                        continue;
                    }
                    if let Err(e) = self.pass().await {
                        error!(error = %e, "BRINGONLINE fetch pass failed");
                    }
                }
            }
        }
    }

    /// Turn every already issued token into a poll task.
    ///
    /// Returns the number of poll tasks submitted.
    pub async fn recover(&self) -> Result<usize> {
        let env = self.pool.env();
        let started = env.store.get_already_started_staging().await?;

        let mut by_token: BTreeMap<String, Vec<StartedStaging>> = BTreeMap::new();
        for row in started {
            by_token.entry(row.token.clone()).or_default().push(row);
        }

        let mut submitted = 0;
        for (token, rows) in by_token {
            match self.build_poll(&token, &rows).await {
                Ok(task) => {
                    self.pool.submit(task);
                    submitted += 1;
                }
                Err(e) => error!(token = %token, error = %e, "BRINGONLINE could not recover token"),
            }
        }
        Ok(submitted)
    }

    async fn build_poll(&self, token: &str, rows: &[StartedStaging]) -> Result<PollTask> {
        let env = self.pool.env();
        let (first, rest) = rows
            .split_first()
            .ok_or_else(|| Error::Other(format!("no files for token {token}")))?;

        let mut ctx = StagingContext::new(&first.request, env.credentials.as_ref()).await?;
        for row in rest {
            ctx.add(&row.request);
        }
        let session = TaskSession::open(
            env.remote.as_ref(),
            Operation::BringOnline,
            &env.session_config,
        )
        .await?;
        Ok(PollTask::recover(
            ctx,
            session,
            token.to_string(),
            env.registry.clone(),
        ))
    }

    /// Run one fetch pass. Returns the number of tasks submitted.
    pub async fn pass(&self) -> Result<usize> {
        let env = self.pool.env();
        let files = env.store.get_files_for_staging().await?;
        if files.is_empty() {
            debug!("No files waiting for staging");
            return Ok(0);
        }

        let mut groups: BTreeMap<GroupKey, Vec<StagingRequest>> = BTreeMap::new();
        for file in files {
            groups
                .entry(StagingContext::key_of(&file))
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
                        "BRINGONLINE could not prepare group"
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

    async fn build_task(&self, requests: &[StagingRequest]) -> Result<BringOnlineTask> {
        let env = self.pool.env();
        let (first, rest) = requests
            .split_first()
            .ok_or_else(|| Error::Other("empty staging group".to_string()))?;

        let mut ctx = StagingContext::new(first, env.credentials.as_ref()).await?;
        for request in rest {
            ctx.add(request);
        }
        BringOnlineTask::new(ctx, env).await
    }
}
