// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bulk bring-online.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::{CONTRACT_VIOLATION_REASON, PollTask, TaskEnv, TaskSession, report_url_failure};
use crate::context::StagingContext;
use crate::error::{Error, Result};
use crate::registry::ActiveTokenRegistry;
use crate::remote::{Operation, error_at};
use crate::store::FileState;

/// Issues one bring-online request for a staging group.
pub struct BringOnlineTask {
    ctx: StagingContext,
    session: Option<TaskSession>,
    token: Option<String>,
    registry: Arc<ActiveTokenRegistry>,
}

impl BringOnlineTask {
    /// Open a session for `ctx` and mark its URLs as waiting for a token.
    pub async fn new(ctx: StagingContext, env: &TaskEnv) -> Result<Self> {
        let session = TaskSession::open(
            env.remote.as_ref(),
            Operation::BringOnline,
            &env.session_config,
        )
        .await?;
        env.registry.register_pending(&ctx.unique_urls());
        Ok(Self {
            ctx,
            session: Some(session),
            token: None,
            registry: env.registry.clone(),
        })
    }

    /// The staging group.
    pub fn context(&self) -> &StagingContext {
        &self.ctx
    }

    /// Issue the request and record its outcome.
    ///
    /// A queued request continues as a [`PollTask`] in the poll waiting room.
    pub async fn run(mut self, env: &TaskEnv) -> Result<()> {
        let staged = self.stage(env).await;
        match staged {
            Ok(Some(token)) => {
                let poll = self.into_poll_task(token);
                env.poll_room.add(poll);
                Ok(())
            }
            Ok(None) => {
                self.session = None;
                Ok(())
            }
            Err(e) => {
                self.session = None;
                Err(e)
            }
        }
    }

    /// Hand the context and session over to a poll task for `token`.
    pub fn into_poll_task(mut self, token: String) -> PollTask {
        let ctx = std::mem::take(&mut self.ctx);
        let session = self.session.take();
        self.registry.promote(&token, &ctx.unique_urls());
        PollTask::queued(ctx, session, token, self.registry.clone())
    }

    async fn stage(&mut self, env: &TaskEnv) -> Result<Option<String>> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::Task("bring-online session already closed".to_string()))?;

        session.set_proxy(&self.ctx, env).await?;

        if let Err(e) = session.set_space_token(self.ctx.space_token()) {
            let reason = e.to_string();
            error!(
                space_token = self.ctx.space_token().unwrap_or_default(),
                error = %reason,
                "BRINGONLINE could not set space token"
            );
            env.updater
                .update_all(&self.ctx, FileState::Failed, &reason, true);
            return Err(e.into());
        }

        let urls = self.ctx.unique_urls();
        info!(
            urls = urls.len(),
            pin_lifetime = self.ctx.pin_lifetime(),
            timeout = self.ctx.timeout(),
            files = %self.ctx.log_summary(),
            "BRINGONLINE issuing"
        );

        let result = session
            .remote()
            .bring_online(&urls, self.ctx.pin_lifetime(), self.ctx.timeout())
            .await;

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
            return Ok(None);
        }

        if result.status == 0 {
            let Some(token) = result.token.filter(|t| !t.is_empty()) else {
                error!(
                    files = %self.ctx.log_summary(),
                    "BRINGONLINE queued but no token was returned"
                );
                env.updater
                    .update_all(&self.ctx, FileState::Failed, CONTRACT_VIOLATION_REASON, false);
                return Ok(None);
            };
            self.token = Some(token.clone());
            if let Err(e) = self.ctx.record_token(env.store.as_ref(), &token).await {
                warn!(token = %token, error = %e, "BRINGONLINE could not record token");
            }
            info!(token = %token, files = %self.ctx.log_summary(), "BRINGONLINE queued");
            return Ok(Some(token));
        }

        for (index, surl) in urls.iter().enumerate() {
            let ids = self.ctx.ids_for_url(surl);
            match error_at(&result.errors, index) {
                None => {
                    info!(surl = %surl, "BRINGONLINE FINISHED");
                    env.updater.update_ids(ids, FileState::Finished, "", false);
                }
                Some(e) => {
                    report_url_failure(&env.updater, ids, Operation::BringOnline, surl, Some(e))
                }
            }
        }
        Ok(None)
    }
}

impl Drop for BringOnlineTask {
    fn drop(&mut self) {
        let urls = self.ctx.unique_urls();
        self.registry.release_pending(&urls);

        let Some(mut session) = self.session.take() else {
            return;
        };
        if urls.is_empty() {
            return;
        }
        let Some(token) = self.token.take() else {
            warn!(
                urls = urls.len(),
                "BRINGONLINE interrupted before a token was issued, nothing to abort"
            );
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(token = %token, urls = urls.len(), "BRINGONLINE interrupted, aborting");
                handle.spawn(async move {
                    session.abort(&token, &urls).await;
                });
            }
            Err(_) => warn!(
                token = %token,
                urls = urls.len(),
                "BRINGONLINE interrupted outside a runtime, request left on the storage"
            ),
        }
    }
}
