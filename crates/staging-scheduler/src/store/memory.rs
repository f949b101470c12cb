// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory job state store.
//!
//! Mirrors the claiming semantics of [`PgStateStore`](super::PgStateStore)
//! without a database. Used by tests and local runs.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{
    CancelRequest, DelegatedCredential, DeletionRequest, FileState, FileStateUpdate,
    JobStateStore, Result, StagingRequest, StartedStaging, StoreError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Staging,
    Deletion,
}

/// Snapshot of one stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Current state.
    pub state: FileState,
    /// Last reason recorded.
    pub reason: String,
    /// Last retry flag recorded.
    pub retry: bool,
    /// Bring-online token, if issued.
    pub token: Option<String>,
    /// Storage URL.
    pub surl: String,
    kind: Kind,
    staging: Option<StagingRequest>,
    deletion: Option<DeletionRequest>,
    cancel_handled: bool,
}

#[derive(Default)]
struct Inner {
    files: BTreeMap<(String, i64), FileRecord>,
    credentials: HashMap<(String, String), DelegatedCredential>,
    failing_updates: usize,
    state_updates: usize,
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStateStore {
    inner: Mutex<Inner>,
}

impl InMemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Submit a staging request.
    pub fn submit_staging(&self, request: StagingRequest) {
        let record = FileRecord {
            state: FileState::Submitted,
            reason: String::new(),
            retry: false,
            token: None,
            surl: request.surl.clone(),
            kind: Kind::Staging,
            staging: Some(request.clone()),
            deletion: None,
            cancel_handled: false,
        };
        self.lock()
            .files
            .insert((request.job_id, request.file_id), record);
    }

    /// Insert a staging request already queued under `token`.
    pub fn insert_queued_staging(&self, request: StagingRequest, token: &str) {
        let key = (request.job_id.clone(), request.file_id);
        self.submit_staging(request);
        if let Some(record) = self.lock().files.get_mut(&key) {
            record.state = FileState::Queued;
            record.token = Some(token.to_string());
        }
    }

    /// Submit a deletion request.
    pub fn submit_deletion(&self, request: DeletionRequest) {
        let record = FileRecord {
            state: FileState::Submitted,
            reason: String::new(),
            retry: false,
            token: None,
            surl: request.surl.clone(),
            kind: Kind::Deletion,
            staging: None,
            deletion: Some(request.clone()),
            cancel_handled: false,
        };
        self.lock()
            .files
            .insert((request.job_id, request.file_id), record);
    }

    /// Mark a file as started, as a claim from a previous run would have.
    pub fn mark_started(&self, job_id: &str, file_id: i64) {
        if let Some(record) = self.lock().files.get_mut(&(job_id.to_string(), file_id)) {
            record.state = FileState::Started;
        }
    }

    /// Cancel a file as the user would.
    pub fn cancel(&self, job_id: &str, file_id: i64) {
        if let Some(record) = self.lock().files.get_mut(&(job_id.to_string(), file_id)) {
            record.state = FileState::Canceled;
            record.cancel_handled = false;
        }
    }

    /// Store a delegated credential.
    pub fn insert_credential(&self, credential: DelegatedCredential) {
        self.lock().credentials.insert(
            (credential.user_dn.clone(), credential.delegation_id.clone()),
            credential,
        );
    }

    /// Fail the next `n` state update calls.
    pub fn fail_next_updates(&self, n: usize) {
        self.lock().failing_updates = n;
    }

    /// Number of successful state update calls.
    pub fn state_update_calls(&self) -> usize {
        self.lock().state_updates
    }

    /// Snapshot of a file.
    pub fn file(&self, job_id: &str, file_id: i64) -> Option<FileRecord> {
        self.lock().files.get(&(job_id.to_string(), file_id)).cloned()
    }

    /// Current state of a file.
    pub fn state_of(&self, job_id: &str, file_id: i64) -> Option<FileState> {
        self.file(job_id, file_id).map(|f| f.state)
    }
}

fn apply(inner: &mut Inner, update: &FileStateUpdate) {
    if let Some(record) = inner.files.get_mut(&(update.job_id.clone(), update.file_id))
        && record.state != FileState::Canceled
    {
        record.state = update.state;
        record.reason = update.reason.clone();
        record.retry = update.retry;
    }
}

fn check_failure(inner: &mut Inner) -> Result<()> {
    if inner.failing_updates > 0 {
        inner.failing_updates -= 1;
        return Err(StoreError::Other("injected update failure".to_string()));
    }
    Ok(())
}

#[async_trait]
impl JobStateStore for InMemoryStateStore {
    async fn get_files_for_staging(&self) -> Result<Vec<StagingRequest>> {
        let mut inner = self.lock();
        let mut claimed = Vec::new();
        for record in inner.files.values_mut() {
            if record.kind == Kind::Staging && record.state == FileState::Submitted {
                record.state = FileState::Started;
                claimed.extend(record.staging.clone());
            }
        }
        Ok(claimed)
    }

    async fn get_already_started_staging(&self) -> Result<Vec<StartedStaging>> {
        let inner = self.lock();
        Ok(inner
            .files
            .values()
            .filter(|r| r.kind == Kind::Staging && r.state == FileState::Queued)
            .filter_map(|r| {
                Some(StartedStaging {
                    request: r.staging.clone()?,
                    token: r.token.clone()?,
                })
            })
            .collect())
    }

    async fn get_staging_files_for_canceling(&self) -> Result<Vec<CancelRequest>> {
        let mut inner = self.lock();
        let mut claimed = Vec::new();
        for ((_, file_id), record) in inner.files.iter_mut() {
            if record.kind == Kind::Staging
                && record.state == FileState::Canceled
                && !record.cancel_handled
            {
                record.cancel_handled = true;
                claimed.push(CancelRequest {
                    file_id: *file_id,
                    surl: record.surl.clone(),
                    token: record.token.clone(),
                });
            }
        }
        Ok(claimed)
    }

    async fn get_files_for_deletion(&self) -> Result<Vec<DeletionRequest>> {
        let mut inner = self.lock();
        let mut claimed = Vec::new();
        for record in inner.files.values_mut() {
            if record.kind == Kind::Deletion && record.state == FileState::Submitted {
                record.state = FileState::Started;
                claimed.extend(record.deletion.clone());
            }
        }
        Ok(claimed)
    }

    async fn update_file_state(
        &self,
        job_id: &str,
        file_id: i64,
        state: FileState,
        reason: &str,
        retry: bool,
    ) -> Result<()> {
        self.update_file_states(&[FileStateUpdate {
            job_id: job_id.to_string(),
            file_id,
            state,
            reason: reason.to_string(),
            retry,
        }])
        .await
    }

    async fn update_file_states(&self, updates: &[FileStateUpdate]) -> Result<()> {
        let mut inner = self.lock();
        check_failure(&mut inner)?;
        for update in updates {
            apply(&mut inner, update);
        }
        inner.state_updates += 1;
        Ok(())
    }

    async fn update_file_token(&self, job_id: &str, file_id: i64, token: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(record) = inner.files.get_mut(&(job_id.to_string(), file_id))
            && record.state != FileState::Canceled
        {
            record.state = FileState::Queued;
            record.token = Some(token.to_string());
        }
        Ok(())
    }

    async fn requeue_started_staging(&self) -> Result<u64> {
        let mut inner = self.lock();
        let mut count = 0;
        for record in inner.files.values_mut() {
            if record.kind == Kind::Staging
                && record.state == FileState::Started
                && record.token.is_none()
            {
                record.state = FileState::Submitted;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn requeue_started_deletions(&self) -> Result<u64> {
        let mut inner = self.lock();
        let mut count = 0;
        for record in inner.files.values_mut() {
            if record.kind == Kind::Deletion && record.state == FileState::Started {
                record.state = FileState::Submitted;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_delegated_credential(
        &self,
        user_dn: &str,
        delegation_id: &str,
    ) -> Result<Option<DelegatedCredential>> {
        Ok(self
            .lock()
            .credentials
            .get(&(user_dn.to_string(), delegation_id.to_string()))
            .cloned())
    }
}
