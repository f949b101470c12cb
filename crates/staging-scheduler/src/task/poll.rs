// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Polling of an issued bring-online request.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use nix::errno::Errno;
use tracing::{debug, info, warn};

use super::{TaskEnv, TaskSession, report_url_failure};
use crate::context::StagingContext;
use crate::error::{Error, Result};
use crate::registry::{ActiveTokenRegistry, CancelCheck};
use crate::remote::{Operation, error_at};
use crate::store::FileState;
use crate::waiting_room::Deferred;

/// Upper bound of the delay between two polls.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(180);

/// Delay after the `n`-th poll: 1, 2, 4 … 64 seconds, then 180.
pub fn poll_interval(n: u32) -> Duration {
    let doubled = 2u64.saturating_pow(n.saturating_add(1));
    if doubled > MAX_POLL_INTERVAL.as_secs() {
        MAX_POLL_INTERVAL
    } else {
        Duration::from_secs(doubled / 2)
    }
}

/// Polls one token until every URL under it is final.
pub struct PollTask {
    ctx: StagingContext,
    session: Option<TaskSession>,
    token: String,
    poll_count: u32,
    wake_at: DateTime<Utc>,
    registry: Arc<ActiveTokenRegistry>,
}

impl PollTask {
    /// Rebuild a poll task for a token issued before the last restart.
    pub fn recover(
        ctx: StagingContext,
        session: TaskSession,
        token: String,
        registry: Arc<ActiveTokenRegistry>,
    ) -> Self {
        registry.register_token(&token, &ctx.unique_urls());
        Self::queued(ctx, Some(session), token, registry)
    }

    pub(crate) fn queued(
        ctx: StagingContext,
        session: Option<TaskSession>,
        token: String,
        registry: Arc<ActiveTokenRegistry>,
    ) -> Self {
        Self {
            ctx,
            session,
            token,
            poll_count: 0,
            wake_at: Utc::now(),
            registry,
        }
    }

    /// Request token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Number of polls issued so far.
    pub fn poll_count(&self) -> u32 {
        self.poll_count
    }

    /// URLs still tracked.
    pub fn context(&self) -> &StagingContext {
        &self.ctx
    }

    /// Poll once. URLs still pending send the task back to the waiting room.
    pub async fn run(mut self, env: &TaskEnv) -> Result<()> {
        if self.poll(env).await? {
            let delay = self.schedule_next();
            info!(
                token = %self.token,
                files = %self.ctx.log_summary(),
                next_attempt_secs = delay.as_secs(),
                "BRINGONLINE polling"
            );
            env.poll_room.add(self);
        }
        Ok(())
    }

    fn schedule_next(&mut self) -> Duration {
        let delay = poll_interval(self.poll_count);
        self.poll_count = self.poll_count.saturating_add(1);
        self.wake_at = Utc::now() + TimeDelta::seconds(delay.as_secs() as i64);
        delay
    }

    /// Returns whether URLs are still pending.
    async fn poll(&mut self, env: &TaskEnv) -> Result<bool> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::Task(format!("poll session for {} closed", self.token)))?;

        if session.credential().is_none()
            && let Err(e) = session.set_proxy(&self.ctx, env).await
        {
            let urls = self.ctx.unique_urls();
            warn!(
                token = %self.token,
                urls = urls.len(),
                "BRINGONLINE proxy unusable, aborting request"
            );
            session.abort(&self.token, &urls).await;
            return Err(e);
        }

        let urls = self.ctx.unique_urls();
        match self.registry.check(&self.token, &urls) {
            CancelCheck::Active => {}
            CancelCheck::Partial(canceled) => {
                info!(token = %self.token, urls = canceled.len(), "BRINGONLINE canceling files");
                session.abort(&self.token, &canceled).await;
                for surl in &canceled {
                    self.ctx.remove_url(surl);
                }
            }
            CancelCheck::Canceled => {
                info!(token = %self.token, "BRINGONLINE request canceled");
                session.abort(&self.token, &urls).await;
                return Ok(false);
            }
        }

        if self.ctx.is_empty() {
            return Ok(false);
        }

        let urls = self.ctx.unique_urls();
        let result = session
            .remote()
            .poll_bring_online(&self.token, &urls)
            .await;

        let mut done = Vec::new();
        let mut failed = Vec::new();
        if result.status < 0 {
            for (index, surl) in urls.iter().enumerate() {
                report_url_failure(
                    &env.updater,
                    self.ctx.ids_for_url(surl),
                    Operation::BringOnline,
                    surl,
                    error_at(&result.errors, index),
                );
            }
            done.clone_from(&urls);
            failed.clone_from(&urls);
        } else {
            for (index, surl) in urls.iter().enumerate() {
                let ids = self.ctx.ids_for_url(surl);
                match error_at(&result.errors, index) {
                    Some(e) if e.code == Errno::EAGAIN as i32 => {
                        debug!(token = %self.token, surl = %surl, message = %e.message, "BRINGONLINE not finished");
                    }
                    None => {
                        info!(token = %self.token, surl = %surl, "BRINGONLINE FINISHED");
                        env.updater.update_ids(ids, FileState::Finished, "", false);
                        done.push(surl.clone());
                    }
                    Some(e) if e.code == Errno::EOPNOTSUPP as i32 => {
                        info!(
                            token = %self.token,
                            surl = %surl,
                            message = %e.message,
                            "BRINGONLINE FINISHED, not supported by the storage"
                        );
                        env.updater.update_ids(ids, FileState::Finished, "", false);
                        done.push(surl.clone());
                    }
                    Some(e) => {
                        report_url_failure(&env.updater, ids, Operation::BringOnline, surl, Some(e));
                        done.push(surl.clone());
                        failed.push(surl.clone());
                    }
                }
            }
        }

        for surl in &done {
            self.ctx.remove_url(surl);
        }
        self.registry.remove_urls(&self.token, &done);

        // failed requests may stay queued on the storage until aborted
        session.abort(&self.token, &failed).await;

        Ok(!self.ctx.is_empty())
    }
}

impl Deferred for PollTask {
    fn wake_at(&self) -> DateTime<Utc> {
        self.wake_at
    }
}

impl Drop for PollTask {
    fn drop(&mut self) {
        self.registry.remove_token(&self.token);
    }
}
