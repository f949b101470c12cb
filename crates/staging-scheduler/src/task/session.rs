// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote session owned by a task.

use tracing::{error, info, warn};

use super::TaskEnv;
use crate::context::JobContext;
use crate::error::{Error, Result};
use crate::remote::{self, Operation, RemoteSession, RemoteStagingClient, SessionConfig, error_at};
use crate::store::FileState;

/// One configured remote session plus the proxy installed on it.
pub struct TaskSession {
    handle: Box<dyn RemoteSession>,
    operation: Operation,
    credential: Option<String>,
}

impl TaskSession {
    /// Open a session for `operation`.
    pub async fn open(
        remote: &dyn RemoteStagingClient,
        operation: Operation,
        config: &SessionConfig,
    ) -> remote::Result<Self> {
        let handle = remote.open_session(operation, config).await?;
        Ok(Self {
            handle,
            operation,
            credential: None,
        })
    }

    /// Operation the session was opened for.
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Proxy installed on the session, if any.
    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    /// The underlying remote session.
    pub fn remote(&mut self) -> &mut dyn RemoteSession {
        self.handle.as_mut()
    }

    /// Install the proxy of `ctx`.
    ///
    /// When the proxy is no longer usable every file of the context is
    /// reported FAILED without retry and the task must stop.
    pub async fn set_proxy(&mut self, ctx: &JobContext, env: &TaskEnv) -> Result<()> {
        let validity = env.credentials.is_valid(ctx.proxy()).await;
        if !validity.valid {
            error!(
                operation = %self.operation,
                proxy = ctx.proxy(),
                reason = %validity.message,
                files = %ctx.log_summary(),
                "Proxy is not valid anymore"
            );
            env.updater
                .update_all(ctx, FileState::Failed, &validity.message, false);
            return Err(Error::Task(format!(
                "{} proxy not valid: {}",
                self.operation, validity.message
            )));
        }

        if let Err(e) = self.handle.set_credential(ctx.proxy()) {
            let reason = e.to_string();
            error!(operation = %self.operation, error = %reason, "Could not install proxy");
            env.updater.update_all(ctx, FileState::Failed, &reason, false);
            return Err(e.into());
        }

        self.credential = Some(ctx.proxy().to_string());
        Ok(())
    }

    /// Restrict the session to a space token. Nothing happens without one.
    pub fn set_space_token(&mut self, space_token: Option<&str>) -> remote::Result<()> {
        match space_token {
            Some(token) if !token.is_empty() => self.handle.set_space_token(token),
            _ => Ok(()),
        }
    }

    /// Abort `urls` of `token`. The outcome is only logged.
    ///
    /// Nothing is sent for an empty token.
    pub async fn abort(&mut self, token: &str, urls: &[String]) {
        if urls.is_empty() {
            return;
        }
        if token.is_empty() {
            warn!(operation = %self.operation, urls = urls.len(), "Abort skipped, no token");
            return;
        }
        let result = self.handle.abort(token, urls).await;
        if result.status >= 0 {
            info!(operation = %self.operation, token, urls = urls.len(), "Aborted");
            return;
        }
        for (index, surl) in urls.iter().enumerate() {
            match error_at(&result.errors, index) {
                Some(e) => warn!(
                    token,
                    surl,
                    code = e.code,
                    message = %e.message,
                    "Abort FAILED"
                ),
                None => warn!(token, surl, "Abort failed but the error was not set"),
            }
        }
    }
}
