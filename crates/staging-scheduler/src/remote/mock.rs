// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock remote client for testing.
//!
//! Responses are scripted per URL. An outcome queue is consumed one entry per
//! call, and its last entry sticks once the queue is down to one element, so
//! a URL scripted as `[EAGAIN]` stays pending forever.

use async_trait::async_trait;
use nix::errno::Errno;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::*;

/// A call observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    /// A session was opened.
    OpenSession(Operation),
    /// A proxy was installed on a session.
    SetCredential(String),
    /// A space token was installed on a session.
    SetSpaceToken(String),
    /// Bulk bring-online.
    BringOnline {
        /// Requested URLs.
        urls: Vec<String>,
        /// Pin lifetime passed along.
        pin_lifetime: i64,
        /// Timeout passed along.
        timeout: i64,
    },
    /// Bulk poll.
    Poll {
        /// Token polled.
        token: String,
        /// URLs polled.
        urls: Vec<String>,
    },
    /// Bulk abort.
    Abort {
        /// Token aborted.
        token: String,
        /// URLs aborted.
        urls: Vec<String>,
    },
    /// Bulk unlink.
    Unlink(Vec<String>),
}

/// Scripted behaviour and call log shared by a client and its sessions.
#[derive(Debug, Default)]
pub struct MockRemoteState {
    /// Queued `(status, token)` answers for bring-online, default `(1, None)`.
    pub bring_online: VecDeque<(i32, Option<String>)>,
    /// Per-URL error for bring-online.
    pub bring_online_errors: HashMap<String, UrlError>,
    /// Per-URL poll outcomes.
    pub poll_outcomes: HashMap<String, VecDeque<Option<UrlError>>>,
    /// Forced poll statuses, computed from the outcomes when empty.
    pub poll_status: VecDeque<i32>,
    /// Per-URL error for abort.
    pub abort_errors: HashMap<String, UrlError>,
    /// Per-URL error for unlink.
    pub unlink_errors: HashMap<String, UrlError>,
    /// Forced unlink status, computed from the errors when unset.
    pub unlink_status: Option<i32>,
    /// Make `open_session` fail with this message.
    pub fail_open: Option<String>,
    /// Make `set_credential` fail with this message.
    pub fail_credential: Option<String>,
    /// Every call in order.
    pub calls: Vec<RemoteCall>,
}

/// Mock remote client.
#[derive(Clone, Default)]
pub struct MockRemoteClient {
    state: Arc<Mutex<MockRemoteState>>,
}

impl MockRemoteClient {
    /// Create a mock where every file is already online.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockRemoteState> {
        lock_state(&self.state)
    }

    /// Queue the status and token of the next bring-online call.
    pub fn push_bring_online(&self, status: i32, token: Option<&str>) {
        self.lock()
            .bring_online
            .push_back((status, token.map(str::to_string)));
    }

    /// Report `error` for `surl` on bring-online.
    pub fn set_bring_online_error(&self, surl: &str, error: UrlError) {
        self.lock()
            .bring_online_errors
            .insert(surl.to_string(), error);
    }

    /// Script the poll outcomes of `surl`.
    pub fn set_poll_outcomes(&self, surl: &str, outcomes: Vec<Option<UrlError>>) {
        self.lock()
            .poll_outcomes
            .insert(surl.to_string(), outcomes.into());
    }

    /// Keep `surl` pending on every poll.
    pub fn keep_pending(&self, surl: &str) {
        self.set_poll_outcomes(
            surl,
            vec![Some(UrlError::new(Errno::EAGAIN as i32, "still queued"))],
        );
    }

    /// Force the status of the next poll.
    pub fn push_poll_status(&self, status: i32) {
        self.lock().poll_status.push_back(status);
    }

    /// Report `error` for `surl` on abort.
    pub fn set_abort_error(&self, surl: &str, error: UrlError) {
        self.lock().abort_errors.insert(surl.to_string(), error);
    }

    /// Report `error` for `surl` on unlink.
    pub fn set_unlink_error(&self, surl: &str, error: UrlError) {
        self.lock().unlink_errors.insert(surl.to_string(), error);
    }

    /// Force the status of every unlink.
    pub fn set_unlink_status(&self, status: i32) {
        self.lock().unlink_status = Some(status);
    }

    /// Make every `open_session` fail.
    pub fn fail_open_session(&self, message: &str) {
        self.lock().fail_open = Some(message.to_string());
    }

    /// Make every `set_credential` fail.
    pub fn fail_set_credential(&self, message: &str) {
        self.lock().fail_credential = Some(message.to_string());
    }

    /// Snapshot of every call so far.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    /// Number of polls issued for `token`.
    pub fn poll_count(&self, token: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, RemoteCall::Poll { token: t, .. } if t == token))
            .count()
    }

    /// URLs of the most recent poll for `token`.
    pub fn last_polled(&self, token: &str) -> Option<Vec<String>> {
        self.lock().calls.iter().rev().find_map(|c| match c {
            RemoteCall::Poll { token: t, urls } if t == token => Some(urls.clone()),
            _ => None,
        })
    }

    /// Every URL aborted under `token`.
    pub fn aborted(&self, token: &str) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                RemoteCall::Abort { token: t, urls } if t == token => Some(urls.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

fn lock_state(state: &Mutex<MockRemoteState>) -> MutexGuard<'_, MockRemoteState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl RemoteStagingClient for MockRemoteClient {
    fn client_type(&self) -> &'static str {
        "mock"
    }

    async fn open_session(
        &self,
        operation: Operation,
        _config: &SessionConfig,
    ) -> Result<Box<dyn RemoteSession>> {
        let mut state = self.lock();
        if let Some(message) = state.fail_open.clone() {
            return Err(RemoteError::SessionInit {
                operation,
                code: Errno::EIO as i32,
                message,
            });
        }
        state.calls.push(RemoteCall::OpenSession(operation));
        Ok(Box::new(MockSession {
            state: self.state.clone(),
        }))
    }
}

struct MockSession {
    state: Arc<Mutex<MockRemoteState>>,
}

fn next_outcome(queue: &mut VecDeque<Option<UrlError>>) -> Option<UrlError> {
    if queue.len() > 1 {
        queue.pop_front().flatten()
    } else {
        queue.front().cloned().flatten()
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    fn set_credential(&mut self, proxy_path: &str) -> Result<()> {
        let mut state = lock_state(&self.state);
        if let Some(message) = state.fail_credential.clone() {
            return Err(RemoteError::Option {
                option: "X509 credential",
                message,
            });
        }
        state
            .calls
            .push(RemoteCall::SetCredential(proxy_path.to_string()));
        Ok(())
    }

    fn set_space_token(&mut self, space_token: &str) -> Result<()> {
        lock_state(&self.state)
            .calls
            .push(RemoteCall::SetSpaceToken(space_token.to_string()));
        Ok(())
    }

    async fn bring_online(
        &mut self,
        urls: &[String],
        pin_lifetime: i64,
        timeout: i64,
    ) -> BringOnlineResult {
        let mut state = lock_state(&self.state);
        state.calls.push(RemoteCall::BringOnline {
            urls: urls.to_vec(),
            pin_lifetime,
            timeout,
        });
        let (status, token) = state.bring_online.pop_front().unwrap_or((1, None));
        let errors = urls
            .iter()
            .map(|u| state.bring_online_errors.get(u).cloned())
            .collect();
        BringOnlineResult {
            status,
            token,
            errors,
        }
    }

    async fn poll_bring_online(&mut self, token: &str, urls: &[String]) -> BulkResult {
        let mut state = lock_state(&self.state);
        state.calls.push(RemoteCall::Poll {
            token: token.to_string(),
            urls: urls.to_vec(),
        });
        let errors: Vec<Option<UrlError>> = urls
            .iter()
            .map(|u| state.poll_outcomes.get_mut(u).and_then(next_outcome))
            .collect();
        let status = state.poll_status.pop_front().unwrap_or_else(|| {
            let pending = errors
                .iter()
                .flatten()
                .any(|e| e.code == Errno::EAGAIN as i32);
            if pending { 0 } else { 1 }
        });
        BulkResult { status, errors }
    }

    async fn abort(&mut self, token: &str, urls: &[String]) -> BulkResult {
        let mut state = lock_state(&self.state);
        state.calls.push(RemoteCall::Abort {
            token: token.to_string(),
            urls: urls.to_vec(),
        });
        let errors: Vec<Option<UrlError>> = urls
            .iter()
            .map(|u| state.abort_errors.get(u).cloned())
            .collect();
        let status = if errors.iter().any(Option::is_some) { -1 } else { 0 };
        BulkResult { status, errors }
    }

    async fn unlink(&mut self, urls: &[String]) -> BulkResult {
        let mut state = lock_state(&self.state);
        state.calls.push(RemoteCall::Unlink(urls.to_vec()));
        let errors: Vec<Option<UrlError>> = urls
            .iter()
            .map(|u| state.unlink_errors.get(u).cloned())
            .collect();
        let status = state
            .unlink_status
            .unwrap_or(if errors.iter().any(Option::is_some) { -1 } else { 0 });
        BulkResult { status, errors }
    }
}
