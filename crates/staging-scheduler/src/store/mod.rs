// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job and file state store.
//!
//! The store owns the file request rows. Fetchers claim eligible rows from it
//! and tasks report per-file outcomes back to it.

pub mod memory;
pub mod postgres;

pub use self::memory::InMemoryStateStore;
pub use self::postgres::PgStateStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be interpreted.
    #[error("Invalid state value: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Lifecycle of one file request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileState {
    /// Waiting to be picked up.
    Submitted,
    /// Claimed by a fetcher.
    Started,
    /// Bring-online accepted, token issued.
    Queued,
    /// Terminal success.
    Finished,
    /// Terminal failure.
    Failed,
    /// Canceled by the user.
    Canceled,
}

impl FileState {
    /// Upper-case name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Submitted => "SUBMITTED",
            FileState::Started => "STARTED",
            FileState::Queued => "QUEUED",
            FileState::Finished => "FINISHED",
            FileState::Failed => "FAILED",
            FileState::Canceled => "CANCELED",
        }
    }

    /// Whether the state is final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileState::Finished | FileState::Failed | FileState::Canceled
        )
    }
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FileState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SUBMITTED" => Ok(FileState::Submitted),
            "STARTED" => Ok(FileState::Started),
            "QUEUED" => Ok(FileState::Queued),
            "FINISHED" => Ok(FileState::Finished),
            "FAILED" => Ok(FileState::Failed),
            "CANCELED" => Ok(FileState::Canceled),
            other => Err(StoreError::InvalidState(other.to_string())),
        }
    }
}

/// One file to bring online.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StagingRequest {
    /// Virtual organization of the owner.
    pub vo_name: String,
    /// Distinguished name of the owner.
    pub user_dn: String,
    /// Delegation the proxy is taken from.
    pub delegation_id: String,
    /// Storage URL.
    pub surl: String,
    /// Owning job.
    pub job_id: String,
    /// File within the job.
    pub file_id: i64,
    /// Requested pin lifetime in seconds.
    pub pin_lifetime: i64,
    /// Requested bring-online timeout in seconds.
    pub bring_online_timeout: i64,
    /// Space token, if any.
    pub space_token: Option<String>,
}

/// A staging request whose bring-online was already accepted.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StartedStaging {
    /// The request.
    #[sqlx(flatten)]
    pub request: StagingRequest,
    /// Token issued by the storage.
    pub token: String,
}

/// A staging file the user canceled.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CancelRequest {
    /// File within the job.
    pub file_id: i64,
    /// Storage URL.
    pub surl: String,
    /// Token, `None` if the bring-online had not been accepted yet.
    pub token: Option<String>,
}

/// One file to delete.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DeletionRequest {
    /// Virtual organization of the owner.
    pub vo_name: String,
    /// Distinguished name of the owner.
    pub user_dn: String,
    /// Delegation the proxy is taken from.
    pub delegation_id: String,
    /// Storage URL.
    pub surl: String,
    /// Owning job.
    pub job_id: String,
    /// File within the job.
    pub file_id: i64,
}

/// A buffered per-file state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStateUpdate {
    /// Owning job.
    pub job_id: String,
    /// File within the job.
    pub file_id: i64,
    /// New state.
    pub state: FileState,
    /// Reason, empty on success.
    pub reason: String,
    /// Whether a later pass may retry the file.
    pub retry: bool,
}

/// A delegated proxy as stored by the delegation service.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DelegatedCredential {
    /// Delegation identifier.
    pub delegation_id: String,
    /// Owner distinguished name.
    pub user_dn: String,
    /// PEM encoded proxy chain.
    pub proxy: String,
    /// Proxy expiry.
    pub termination_time: DateTime<Utc>,
}

/// Storage backend for file requests.
#[async_trait]
pub trait JobStateStore: Send + Sync {
    /// Claim staging requests that are waiting to be brought online.
    async fn get_files_for_staging(&self) -> Result<Vec<StagingRequest>>;

    /// Staging requests with an issued token, used once at startup.
    async fn get_already_started_staging(&self) -> Result<Vec<StartedStaging>>;

    /// Claim canceled staging files not yet handled.
    async fn get_staging_files_for_canceling(&self) -> Result<Vec<CancelRequest>>;

    /// Claim deletion requests waiting to be executed.
    async fn get_files_for_deletion(&self) -> Result<Vec<DeletionRequest>>;

    /// Record a state change for one file.
    async fn update_file_state(
        &self,
        job_id: &str,
        file_id: i64,
        state: FileState,
        reason: &str,
        retry: bool,
    ) -> Result<()>;

    /// Record a batch of state changes.
    async fn update_file_states(&self, updates: &[FileStateUpdate]) -> Result<()> {
        for u in updates {
            self.update_file_state(&u.job_id, u.file_id, u.state, &u.reason, u.retry)
                .await?;
        }
        Ok(())
    }

    /// Attach a bring-online token and mark the file queued.
    async fn update_file_token(&self, job_id: &str, file_id: i64, token: &str) -> Result<()>;

    /// Return staging files left started without a token to the queue.
    async fn requeue_started_staging(&self) -> Result<u64>;

    /// Return deletions left started by a previous run to the queue.
    async fn requeue_started_deletions(&self) -> Result<u64>;

    /// Look up the delegated proxy of a user.
    async fn get_delegated_credential(
        &self,
        user_dn: &str,
        delegation_id: &str,
    ) -> Result<Option<DelegatedCredential>>;
}
