// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote storage client abstraction.
//!
//! The scheduler never talks to a storage endpoint directly. It opens one
//! [`RemoteSession`] per task through a [`RemoteStagingClient`] and issues
//! bulk calls on it. Every bulk call returns a per-URL error slot in the
//! same order as the URLs that were passed in.

pub mod mock;
pub mod tape_rest;

use async_trait::async_trait;
use thiserror::Error;

pub use mock::{MockRemoteClient, MockRemoteState, RemoteCall};
pub use tape_rest::TapeRestClient;

/// Errors raised while setting up or configuring a session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RemoteError {
    /// The session handle could not be created.
    #[error("{operation} bad initialisation: {code} {message}")]
    SessionInit {
        /// Operation the session was opened for.
        operation: Operation,
        /// Raw error code.
        code: i32,
        /// Error message.
        message: String,
    },

    /// A session option was rejected.
    #[error("could not set {option}: {message}")]
    Option {
        /// Option name.
        option: &'static str,
        /// Error message.
        message: String,
    },

    /// Other error.
    #[error("Remote: {0}")]
    Other(String),
}

/// Result type for session setup.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// What a session is opened for, used in logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Bring-online and its polling.
    BringOnline,
    /// Remote unlink.
    Deletion,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::BringOnline => write!(f, "BRINGONLINE"),
            Operation::Deletion => write!(f, "DELETION"),
        }
    }
}

/// Transfer protocols a staged file may be offered under.
pub const TURL_PROTOCOLS: &[&str] = &["rfio", "gsidcap", "dcap", "gsiftp"];

/// Settings applied once to every new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Information system endpoint, `None` disables lookups.
    pub infosys: Option<String>,
    /// Protocols requested when staging.
    pub turl_protocols: Vec<String>,
    /// Keep control connections open between calls.
    pub session_reuse: bool,
}

impl SessionConfig {
    /// Build the session configuration from an information system setting.
    ///
    /// The literal `false` disables the information system.
    pub fn new(infosys: &str) -> Self {
        Self {
            infosys: (infosys != "false").then(|| infosys.to_string()),
            turl_protocols: TURL_PROTOCOLS.iter().map(|p| p.to_string()).collect(),
            session_reuse: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new("false")
    }
}

/// Error reported for one URL of a bulk call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlError {
    /// Raw OS error code.
    pub code: i32,
    /// Human readable message.
    pub message: String,
}

impl UrlError {
    /// Create a new per-URL error.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Outcome of a bulk bring-online call.
#[derive(Debug, Clone, Default)]
pub struct BringOnlineResult {
    /// `< 0` failed, `0` queued (token issued), `> 0` already online.
    pub status: i32,
    /// Request token, set when `status == 0`.
    pub token: Option<String>,
    /// One slot per requested URL.
    pub errors: Vec<Option<UrlError>>,
}

/// Outcome of a bulk poll, abort or unlink call.
#[derive(Debug, Clone, Default)]
pub struct BulkResult {
    /// `< 0` failed, `0` some pending, `> 0` all terminal.
    pub status: i32,
    /// One slot per requested URL.
    pub errors: Vec<Option<UrlError>>,
}

/// Opens sessions against remote storage.
#[async_trait]
pub trait RemoteStagingClient: Send + Sync {
    /// Client name for logging.
    fn client_type(&self) -> &'static str;

    /// Open a configured session for one task.
    async fn open_session(
        &self,
        operation: Operation,
        config: &SessionConfig,
    ) -> Result<Box<dyn RemoteSession>>;
}

/// One live session, owned by exactly one task.
#[async_trait]
pub trait RemoteSession: Send {
    /// Authenticate subsequent calls with the given proxy file.
    fn set_credential(&mut self, proxy_path: &str) -> Result<()>;

    /// Restrict staging to a space token.
    fn set_space_token(&mut self, space_token: &str) -> Result<()>;

    /// Request that `urls` are brought online.
    async fn bring_online(
        &mut self,
        urls: &[String],
        pin_lifetime: i64,
        timeout: i64,
    ) -> BringOnlineResult;

    /// Check the progress of a previously issued request.
    async fn poll_bring_online(&mut self, token: &str, urls: &[String]) -> BulkResult;

    /// Abort `urls` of a previously issued request.
    ///
    /// `token` is the non-empty token returned by
    /// [`bring_online`](Self::bring_online).
    async fn abort(&mut self, token: &str, urls: &[String]) -> BulkResult;

    /// Delete `urls`.
    async fn unlink(&mut self, urls: &[String]) -> BulkResult;
}

/// Slot for URL `index`, treating a short error vector as "no error".
pub(crate) fn error_at(errors: &[Option<UrlError>], index: usize) -> Option<&UrlError> {
    errors.get(index).and_then(|e| e.as_ref())
}
