// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for staging-scheduler tests.
//!
//! Provides TestEnv wiring the in-memory store, the mock remote client and
//! the mock credential provider into a task environment.

#![allow(dead_code)]

use std::sync::Arc;

use staging_scheduler::context::{DeletionContext, StagingContext};
use staging_scheduler::credentials::MockCredentialProvider;
use staging_scheduler::registry::ActiveTokenRegistry;
use staging_scheduler::remote::{MockRemoteClient, SessionConfig};
use staging_scheduler::state_updater::{StateUpdater, StateUpdaterConfig};
use staging_scheduler::store::{DeletionRequest, InMemoryStateStore, JobStateStore, StagingRequest};
use staging_scheduler::task::{PollTask, TaskEnv};
use staging_scheduler::waiting_room::{WaitingRoom, WaitingRoomConfig};

pub const VO: &str = "dteam";
pub const USER_DN: &str = "/DC=ch/DC=cern/CN=tester";
pub const DELEGATION_ID: &str = "dlg-1";

/// Task environment over in-memory collaborators.
pub struct TestEnv {
    pub remote: MockRemoteClient,
    pub credentials: Arc<MockCredentialProvider>,
    pub store: Arc<InMemoryStateStore>,
    pub updater: Arc<StateUpdater>,
    pub registry: Arc<ActiveTokenRegistry>,
    pub poll_room: Arc<WaitingRoom<PollTask>>,
    pub env: Arc<TaskEnv>,
}

impl TestEnv {
    /// Create a new test environment.
    pub fn new() -> Self {
        let remote = MockRemoteClient::new();
        let credentials = Arc::new(MockCredentialProvider::new());
        let store = Arc::new(InMemoryStateStore::new());
        let updater = Arc::new(StateUpdater::new(
            store.clone(),
            StateUpdaterConfig::default(),
        ));
        let registry = Arc::new(ActiveTokenRegistry::new());
        let poll_room = Arc::new(WaitingRoom::new(WaitingRoomConfig::default()));

        let env = Arc::new(TaskEnv {
            remote: Arc::new(remote.clone()),
            credentials: credentials.clone(),
            store: store.clone(),
            updater: updater.clone(),
            registry: registry.clone(),
            poll_room: poll_room.clone(),
            session_config: SessionConfig::default(),
        });

        Self {
            remote,
            credentials,
            store,
            updater,
            registry,
            poll_room,
            env,
        }
    }

    /// Submit staging requests and claim them as a fetch pass would.
    pub async fn claim_staging(&self, requests: &[StagingRequest]) -> Vec<StagingRequest> {
        for request in requests {
            self.store.submit_staging(request.clone());
        }
        self.store
            .get_files_for_staging()
            .await
            .expect("claim staging")
    }

    /// Build one staging group from `requests`.
    pub async fn staging_context(&self, requests: &[StagingRequest]) -> StagingContext {
        let (first, rest) = requests.split_first().expect("at least one request");
        let mut ctx = StagingContext::new(first, self.credentials.as_ref())
            .await
            .expect("staging context");
        for request in rest {
            ctx.add(request);
        }
        ctx
    }

    /// Build one deletion group from `requests`.
    pub async fn deletion_context(&self, requests: &[DeletionRequest]) -> DeletionContext {
        let (first, rest) = requests.split_first().expect("at least one request");
        let mut ctx = DeletionContext::new(first, self.credentials.as_ref())
            .await
            .expect("deletion context");
        for request in rest {
            ctx.add(request);
        }
        ctx
    }

    /// Write buffered state updates to the store.
    pub async fn flush(&self) {
        self.updater.flush().await.expect("flush state updates");
    }
}

/// Create a staging request in the default group.
pub fn staging_request(job_id: &str, file_id: i64, surl: &str) -> StagingRequest {
    StagingRequest {
        vo_name: VO.to_string(),
        user_dn: USER_DN.to_string(),
        delegation_id: DELEGATION_ID.to_string(),
        surl: surl.to_string(),
        job_id: job_id.to_string(),
        file_id,
        pin_lifetime: 3600,
        bring_online_timeout: 28800,
        space_token: None,
    }
}

/// Create a deletion request in the default group.
pub fn deletion_request(job_id: &str, file_id: i64, surl: &str) -> DeletionRequest {
    DeletionRequest {
        vo_name: VO.to_string(),
        user_dn: USER_DN.to_string(),
        delegation_id: DELEGATION_ID.to_string(),
        surl: surl.to_string(),
        job_id: job_id.to_string(),
        file_id,
    }
}

/// Owned URL list.
pub fn urls(list: &[&str]) -> Vec<String> {
    list.iter().map(|u| u.to_string()).collect()
}
