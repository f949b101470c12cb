// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Units of remote work.
//!
//! A task owns one remote session and one context. It issues a single bulk
//! call, interprets the per-URL outcome and records every file state through
//! the [`StateUpdater`]. A [`BringOnlineTask`] that receives a token turns
//! into a [`PollTask`], which re-enters the poll waiting room until every URL
//! it tracks is final.

pub mod bring_online;
pub mod deletion;
pub mod poll;
pub mod session;

pub use bring_online::BringOnlineTask;
pub use deletion::DeletionTask;
pub use poll::{PollTask, poll_interval};
pub use session::TaskSession;

use std::sync::Arc;

use tracing::{error, warn};

use crate::credentials::CredentialProvider;
use crate::registry::ActiveTokenRegistry;
use crate::remote::{Operation, RemoteStagingClient, SessionConfig, UrlError};
use crate::retry::{ErrorCategory, classify_retry};
use crate::state_updater::StateUpdater;
use crate::store::{FileState, JobStateStore};
use crate::waiting_room::WaitingRoom;

/// Reason recorded when a remote call failed without saying why.
pub const CONTRACT_VIOLATION_REASON: &str = "Error not set by remote client";

/// Collaborators shared by every task.
pub struct TaskEnv {
    /// Opens remote sessions.
    pub remote: Arc<dyn RemoteStagingClient>,
    /// Checks and regenerates proxies.
    pub credentials: Arc<dyn CredentialProvider>,
    /// Job state store, for token updates.
    pub store: Arc<dyn JobStateStore>,
    /// Buffered file state updates.
    pub updater: Arc<StateUpdater>,
    /// Live tokens and URLs.
    pub registry: Arc<ActiveTokenRegistry>,
    /// Where poll tasks wait for their next attempt.
    pub poll_room: Arc<WaitingRoom<PollTask>>,
    /// Applied to every new session.
    pub session_config: SessionConfig,
}

/// Any task the worker pool can run.
pub enum Task {
    /// Issue a bulk bring-online.
    BringOnline(BringOnlineTask),
    /// Poll an issued bring-online.
    Poll(PollTask),
    /// Issue a bulk unlink.
    Deletion(DeletionTask),
}

impl Task {
    /// Task kind for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Task::BringOnline(_) => "bring_online",
            Task::Poll(_) => "poll",
            Task::Deletion(_) => "deletion",
        }
    }

    /// Run the task to completion.
    pub async fn run(self, env: Arc<TaskEnv>) {
        let kind = self.kind();
        let result = match self {
            Task::BringOnline(task) => task.run(&env).await,
            Task::Poll(task) => task.run(&env).await,
            Task::Deletion(task) => task.run(&env).await,
        };
        if let Err(e) = result {
            warn!(task = kind, error = %e, "Task ended early");
        }
    }
}

impl From<BringOnlineTask> for Task {
    fn from(task: BringOnlineTask) -> Self {
        Task::BringOnline(task)
    }
}

impl From<PollTask> for Task {
    fn from(task: PollTask) -> Self {
        Task::Poll(task)
    }
}

impl From<DeletionTask> for Task {
    fn from(task: DeletionTask) -> Self {
        Task::Deletion(task)
    }
}

/// Record a failed URL for every file waiting on it.
///
/// A missing error is a client contract violation and is never retried.
pub(crate) fn report_url_failure(
    updater: &StateUpdater,
    ids: &[(String, i64)],
    operation: Operation,
    surl: &str,
    error: Option<&UrlError>,
) {
    match error {
        Some(e) => {
            let retry = classify_retry(e.code, ErrorCategory::Source, &e.message);
            error!(
                operation = %operation,
                surl,
                code = e.code,
                message = %e.message,
                retry,
                "Remote operation FAILED"
            );
            updater.update_ids(ids, FileState::Failed, &e.message, retry);
        }
        None => {
            error!(
                operation = %operation,
                surl,
                "Remote operation failed but the error was not set"
            );
            updater.update_ids(ids, FileState::Failed, CONTRACT_VIOLATION_REASON, false);
        }
    }
}
