// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the staging, deletion and cancellation fetchers.

mod common;

use std::sync::Arc;

use common::{TestEnv, USER_DN, deletion_request, staging_request};
use nix::errno::Errno;

use staging_scheduler::credentials::MockCredentialProvider;
use staging_scheduler::drain::DrainMode;
use staging_scheduler::fetch::{FetchCancelStaging, FetchConfig, FetchDeletion, FetchStaging};
use staging_scheduler::remote::{RemoteCall, UrlError};
use staging_scheduler::store::FileState;
use staging_scheduler::worker_pool::WorkerPool;

fn pool(t: &TestEnv) -> Arc<WorkerPool> {
    Arc::new(WorkerPool::new(t.env.clone(), 4))
}

fn drain() -> Arc<DrainMode> {
    Arc::new(DrainMode::new(false))
}

fn bring_online_batches(calls: &[RemoteCall]) -> Vec<Vec<String>> {
    let mut batches: Vec<Vec<String>> = calls
        .iter()
        .filter_map(|c| match c {
            RemoteCall::BringOnline { urls, .. } => Some(urls.clone()),
            _ => None,
        })
        .collect();
    batches.sort();
    batches
}

#[tokio::test]
async fn test_staging_groups_by_endpoint_and_space_token() {
    let t = TestEnv::new();
    t.store
        .submit_staging(staging_request("job-1", 1, "srm://se1.cern.ch/data/a"));
    t.store
        .submit_staging(staging_request("job-2", 1, "srm://se1.cern.ch/data/b"));
    t.store
        .submit_staging(staging_request("job-1", 2, "srm://se2.desy.de/data/c"));
    let mut tokened = staging_request("job-3", 1, "srm://se1.cern.ch/data/d");
    tokened.space_token = Some("TAPE".to_string());
    t.store.submit_staging(tokened);

    let pool = pool(&t);
    let fetcher = FetchStaging::new(pool.clone(), drain(), FetchConfig::staging());

    assert_eq!(fetcher.pass().await.unwrap(), 3);
    pool.wait_idle().await;
    t.flush().await;

    assert_eq!(
        bring_online_batches(&t.remote.calls()),
        vec![
            vec![
                "srm://se1.cern.ch/data/a".to_string(),
                "srm://se1.cern.ch/data/b".to_string(),
            ],
            vec!["srm://se1.cern.ch/data/d".to_string()],
            vec!["srm://se2.desy.de/data/c".to_string()],
        ]
    );
    for (job, file) in [("job-1", 1), ("job-2", 1), ("job-1", 2), ("job-3", 1)] {
        assert_eq!(t.store.state_of(job, file), Some(FileState::Finished));
    }

    assert_eq!(fetcher.pass().await.unwrap(), 0);
}

#[tokio::test]
async fn test_staging_credential_failure_fails_group() {
    let t = TestEnv::new();
    t.store
        .submit_staging(staging_request("job-1", 1, "srm://se1.cern.ch/data/a"));
    t.credentials.invalidate(
        &MockCredentialProvider::cached_path(USER_DN, common::DELEGATION_ID),
        "proxy expired",
    );
    t.credentials.fail_generation("delegation not found");

    let pool = pool(&t);
    let fetcher = FetchStaging::new(pool.clone(), drain(), FetchConfig::staging());

    assert_eq!(fetcher.pass().await.unwrap(), 0);
    t.flush().await;

    let file = t.store.file("job-1", 1).unwrap();
    assert_eq!(file.state, FileState::Failed);
    assert!(file.reason.contains("delegation not found"));
    assert!(!file.retry);
    assert!(t.remote.calls().is_empty());
}

#[tokio::test]
async fn test_staging_recovers_queued_tokens() {
    let t = TestEnv::new();
    t.store.insert_queued_staging(
        staging_request("job-1", 1, "srm://se1.cern.ch/data/a"),
        "tok-r",
    );
    t.store.insert_queued_staging(
        staging_request("job-1", 2, "srm://se1.cern.ch/data/b"),
        "tok-r",
    );

    let pool = pool(&t);
    let fetcher = FetchStaging::new(pool.clone(), drain(), FetchConfig::staging());

    assert_eq!(fetcher.recover().await.unwrap(), 1);
    pool.wait_idle().await;
    t.flush().await;

    assert_eq!(t.remote.poll_count("tok-r"), 1);
    assert_eq!(t.store.state_of("job-1", 1), Some(FileState::Finished));
    assert_eq!(t.store.state_of("job-1", 2), Some(FileState::Finished));
}

#[tokio::test]
async fn test_deletion_reports_each_url() {
    let t = TestEnv::new();
    t.store
        .submit_deletion(deletion_request("job-1", 1, "srm://se1.cern.ch/data/a"));
    t.store
        .submit_deletion(deletion_request("job-1", 2, "srm://se1.cern.ch/data/b"));
    t.remote.set_unlink_error(
        "srm://se1.cern.ch/data/b",
        UrlError::new(Errno::EACCES as i32, "Permission denied"),
    );

    let pool = pool(&t);
    let fetcher = FetchDeletion::new(pool.clone(), drain(), FetchConfig::deletion());

    assert_eq!(fetcher.pass().await.unwrap(), 1);
    pool.wait_idle().await;
    t.flush().await;

    assert_eq!(t.store.state_of("job-1", 1), Some(FileState::Finished));
    let failed = t.store.file("job-1", 2).unwrap();
    assert_eq!(failed.state, FileState::Failed);
    assert!(!failed.retry);
}

#[tokio::test]
async fn test_deletion_failure_without_error_is_not_finished() {
    let t = TestEnv::new();
    t.store
        .submit_deletion(deletion_request("job-1", 1, "srm://se1.cern.ch/data/a"));
    t.remote.set_unlink_status(-1);

    let pool = pool(&t);
    let fetcher = FetchDeletion::new(pool.clone(), drain(), FetchConfig::deletion());

    fetcher.pass().await.unwrap();
    pool.wait_idle().await;
    t.flush().await;

    assert_eq!(t.store.state_of("job-1", 1), Some(FileState::Failed));
}

#[tokio::test]
async fn test_cancel_removes_live_urls() {
    let t = TestEnv::new();
    t.store.insert_queued_staging(
        staging_request("job-1", 1, "srm://se1.cern.ch/data/a"),
        "tok-c",
    );
    t.store.insert_queued_staging(
        staging_request("job-1", 2, "srm://se1.cern.ch/data/b"),
        "tok-c",
    );
    t.registry.register_token(
        "tok-c",
        &common::urls(&["srm://se1.cern.ch/data/a", "srm://se1.cern.ch/data/b"]),
    );
    t.store.cancel("job-1", 1);

    let fetcher = FetchCancelStaging::new(t.env.clone(), drain(), FetchConfig::cancel());

    assert_eq!(fetcher.pass().await.unwrap(), 1);
    assert!(!t.registry.contains("tok-c", "srm://se1.cern.ch/data/a"));
    assert!(t.registry.contains("tok-c", "srm://se1.cern.ch/data/b"));

    assert_eq!(fetcher.pass().await.unwrap(), 0);
}

#[tokio::test]
async fn test_cancel_before_token_drops_pending_url() {
    let t = TestEnv::new();
    t.store
        .submit_staging(staging_request("job-1", 1, "srm://se1.cern.ch/data/a"));
    t.store.mark_started("job-1", 1);
    t.registry
        .register_pending(&common::urls(&["srm://se1.cern.ch/data/a"]));
    t.store.cancel("job-1", 1);

    let fetcher = FetchCancelStaging::new(t.env.clone(), drain(), FetchConfig::cancel());

    assert_eq!(fetcher.pass().await.unwrap(), 1);
    assert!(!t.registry.is_pending("srm://se1.cern.ch/data/a"));
}

#[tokio::test]
async fn test_cancel_after_token_stored_before_promote() {
    let t = TestEnv::new();
    let surls = common::urls(&["srm://se1.cern.ch/data/a", "srm://se1.cern.ch/data/b"]);
    t.store.insert_queued_staging(
        staging_request("job-1", 1, "srm://se1.cern.ch/data/a"),
        "tok-1",
    );
    t.store.insert_queued_staging(
        staging_request("job-1", 2, "srm://se1.cern.ch/data/b"),
        "tok-1",
    );
    t.registry.register_pending(&surls);
    t.store.cancel("job-1", 1);

    let fetcher = FetchCancelStaging::new(t.env.clone(), drain(), FetchConfig::cancel());

    assert_eq!(fetcher.pass().await.unwrap(), 1);
    t.registry.promote("tok-1", &surls);

    assert!(!t.registry.contains("tok-1", "srm://se1.cern.ch/data/a"));
    assert!(t.registry.contains("tok-1", "srm://se1.cern.ch/data/b"));
}
