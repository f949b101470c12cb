// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bulk remote deletion.

use tracing::info;

use super::{TaskEnv, TaskSession, report_url_failure};
use crate::context::DeletionContext;
use crate::error::Result;
use crate::remote::{Operation, error_at};
use crate::store::FileState;

/// Unlinks every URL of a deletion group in one call.
pub struct DeletionTask {
    ctx: DeletionContext,
    session: TaskSession,
}

impl DeletionTask {
    /// Open a session for `ctx`.
    pub async fn new(ctx: DeletionContext, env: &TaskEnv) -> Result<Self> {
        let session =
            TaskSession::open(env.remote.as_ref(), Operation::Deletion, &env.session_config)
                .await?;
        Ok(Self { ctx, session })
    }

    /// The deletion group.
    pub fn context(&self) -> &DeletionContext {
        &self.ctx
    }

    /// Issue the unlink and record its outcome.
    pub async fn run(mut self, env: &TaskEnv) -> Result<()> {
        self.session.set_proxy(&self.ctx, env).await?;

        let urls = self.ctx.unique_urls();
        info!(urls = urls.len(), files = %self.ctx.log_summary(), "DELETION issuing");

        let result = self.session.remote().unlink(&urls).await;

        for (index, surl) in urls.iter().enumerate() {
            let ids = self.ctx.ids_for_url(surl);
            match error_at(&result.errors, index) {
                Some(e) => {
                    report_url_failure(&env.updater, ids, Operation::Deletion, surl, Some(e))
                }
                None if result.status < 0 => {
                    report_url_failure(&env.updater, ids, Operation::Deletion, surl, None)
                }
                None => {
                    info!(surl = %surl, "DELETION FINISHED");
                    env.updater.update_ids(ids, FileState::Finished, "", false);
                }
            }
        }
        Ok(())
    }
}
