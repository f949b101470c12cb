// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for bring-online polling and cancellation.

mod common;

use std::collections::HashMap;

use chrono::{TimeDelta, Utc};
use common::{TestEnv, staging_request, urls};
use nix::errno::Errno;

use staging_scheduler::remote::{Operation, RemoteCall, UrlError};
use staging_scheduler::store::{FileState, StagingRequest};
use staging_scheduler::task::{CONTRACT_VIOLATION_REASON, PollTask, TaskSession};
use staging_scheduler::waiting_room::Deferred;

const F1: &str = "srm://se.cern.ch/data/f1";
const F2: &str = "srm://se.cern.ch/data/f2";

fn queued_requests() -> Vec<StagingRequest> {
    vec![
        staging_request("job-1", 1, F1),
        staging_request("job-1", 2, F2),
    ]
}

/// Recover a poll task for `token` over files already queued in the store.
async fn poll_task(t: &TestEnv, token: &str, requests: &[StagingRequest]) -> PollTask {
    for request in requests {
        t.store.insert_queued_staging(request.clone(), token);
    }
    let ctx = t.staging_context(requests).await;
    let session = TaskSession::open(
        t.env.remote.as_ref(),
        Operation::BringOnline,
        &t.env.session_config,
    )
    .await
    .unwrap();
    PollTask::recover(ctx, session, token.to_string(), t.registry.clone())
}

/// Take the single parked poll task, whatever its wake time.
fn next_parked(t: &TestEnv) -> PollTask {
    let mut due = t.poll_room.take_due(Utc::now() + TimeDelta::days(1));
    assert_eq!(due.len(), 1, "expected exactly one parked poll task");
    due.remove(0)
}

#[tokio::test]
async fn test_poll_until_final() {
    let t = TestEnv::new();
    t.remote.set_poll_outcomes(
        F1,
        vec![Some(UrlError::new(Errno::EAGAIN as i32, "queued")), None],
    );
    t.remote.set_poll_outcomes(
        F2,
        vec![
            Some(UrlError::new(Errno::EAGAIN as i32, "queued")),
            Some(UrlError::new(Errno::ENOENT as i32, "No such file or directory")),
        ],
    );
    let task = poll_task(&t, "tok-1", &queued_requests()).await;

    task.run(&t.env).await.unwrap();
    t.flush().await;
    assert_eq!(t.store.state_of("job-1", 1), Some(FileState::Queued));
    assert_eq!(t.store.state_of("job-1", 2), Some(FileState::Queued));

    let task = next_parked(&t);
    assert_eq!(task.poll_count(), 1);
    task.run(&t.env).await.unwrap();
    t.flush().await;

    assert_eq!(t.store.state_of("job-1", 1), Some(FileState::Finished));
    let failed = t.store.file("job-1", 2).unwrap();
    assert_eq!(failed.state, FileState::Failed);
    assert!(!failed.retry);

    assert_eq!(t.remote.poll_count("tok-1"), 2);
    assert_eq!(t.remote.aborted("tok-1"), urls(&[F2]));
    assert!(t.poll_room.is_empty());
    assert_eq!(t.registry.token_count(), 0);
}

#[tokio::test]
async fn test_poll_installs_proxy_on_recovered_session() {
    let t = TestEnv::new();
    let task = poll_task(&t, "tok-1", &queued_requests()).await;

    task.run(&t.env).await.unwrap();

    let calls = t.remote.calls();
    let credential = calls
        .iter()
        .position(|c| matches!(c, RemoteCall::SetCredential(_)))
        .expect("proxy installed");
    let poll = calls
        .iter()
        .position(|c| matches!(c, RemoteCall::Poll { .. }))
        .expect("poll issued");
    assert!(credential < poll);
}

#[tokio::test]
async fn test_backoff_grows_between_polls() {
    let t = TestEnv::new();
    t.remote.keep_pending(F1);
    let task = poll_task(&t, "tok-1", &[staging_request("job-1", 1, F1)]).await;

    let mut task = task;
    let mut gaps = Vec::new();
    for _ in 0..4 {
        let before = Utc::now();
        task.run(&t.env).await.unwrap();
        task = next_parked(&t);
        gaps.push((task.wake_at() - before).num_seconds());
    }

    assert_eq!(task.poll_count(), 4);
    assert_eq!(gaps, vec![1, 2, 4, 8]);
}

#[tokio::test]
async fn test_not_supported_counts_as_finished() {
    let t = TestEnv::new();
    t.remote.set_poll_outcomes(
        F1,
        vec![Some(UrlError::new(
            Errno::EOPNOTSUPP as i32,
            "Operation not supported",
        ))],
    );
    let task = poll_task(&t, "tok-1", &[staging_request("job-1", 1, F1)]).await;

    task.run(&t.env).await.unwrap();
    t.flush().await;

    assert_eq!(t.store.state_of("job-1", 1), Some(FileState::Finished));
    assert!(t.remote.aborted("tok-1").is_empty());
    assert!(t.poll_room.is_empty());
}

#[tokio::test]
async fn test_failed_poll_fails_every_url() {
    let t = TestEnv::new();
    t.remote.push_poll_status(-1);
    t.remote.set_poll_outcomes(
        F1,
        vec![Some(UrlError::new(Errno::ETIMEDOUT as i32, "Connection timed out"))],
    );
    let task = poll_task(&t, "tok-1", &queued_requests()).await;

    task.run(&t.env).await.unwrap();
    t.flush().await;

    let timed_out = t.store.file("job-1", 1).unwrap();
    assert_eq!(timed_out.state, FileState::Failed);
    assert!(timed_out.retry);
    let unexplained = t.store.file("job-1", 2).unwrap();
    assert_eq!(unexplained.state, FileState::Failed);
    assert_eq!(unexplained.reason, CONTRACT_VIOLATION_REASON);

    assert_eq!(t.remote.aborted("tok-1"), urls(&[F1, F2]));
    assert!(t.poll_room.is_empty());
}

#[tokio::test]
async fn test_partial_cancel_aborts_only_canceled_urls() {
    let t = TestEnv::new();
    t.remote.keep_pending(F1);
    let task = poll_task(&t, "tok-1", &queued_requests()).await;

    let mut groups = HashMap::new();
    groups.insert(Some("tok-1".to_string()), urls(&[F2]));
    assert_eq!(t.registry.cancel(&groups), 1);

    task.run(&t.env).await.unwrap();

    assert_eq!(t.remote.aborted("tok-1"), urls(&[F2]));
    assert_eq!(t.remote.last_polled("tok-1"), Some(urls(&[F1])));

    let task = next_parked(&t);
    assert_eq!(task.context().unique_urls(), urls(&[F1]));
    assert!(t.registry.contains("tok-1", F1));
}

#[tokio::test]
async fn test_full_cancel_aborts_without_polling() {
    let t = TestEnv::new();
    let task = poll_task(&t, "tok-1", &queued_requests()).await;

    let mut groups = HashMap::new();
    groups.insert(Some("tok-1".to_string()), urls(&[F1, F2]));
    assert_eq!(t.registry.cancel(&groups), 2);

    task.run(&t.env).await.unwrap();

    assert_eq!(t.remote.poll_count("tok-1"), 0);
    assert_eq!(t.remote.aborted("tok-1"), urls(&[F1, F2]));
    assert!(t.poll_room.is_empty());
    assert_eq!(t.registry.token_count(), 0);
}

#[tokio::test]
async fn test_unusable_proxy_aborts_recovered_request() {
    let t = TestEnv::new();
    let task = poll_task(&t, "tok-1", &queued_requests()).await;
    t.credentials.invalidate(task.context().proxy(), "proxy expired");

    assert!(task.run(&t.env).await.is_err());
    t.flush().await;

    for file_id in [1, 2] {
        let file = t.store.file("job-1", file_id).unwrap();
        assert_eq!(file.state, FileState::Failed);
        assert_eq!(file.reason, "proxy expired");
        assert!(!file.retry);
    }
    assert_eq!(t.remote.poll_count("tok-1"), 0);
    assert_eq!(t.remote.aborted("tok-1"), urls(&[F1, F2]));
    assert_eq!(t.registry.token_count(), 0);
    assert!(t.poll_room.is_empty());
}

#[tokio::test]
async fn test_dropped_poll_task_forgets_token() {
    let t = TestEnv::new();
    let task = poll_task(&t, "tok-1", &queued_requests()).await;
    assert!(t.registry.contains("tok-1", F1));

    drop(task);

    assert_eq!(t.registry.token_count(), 0);
}
