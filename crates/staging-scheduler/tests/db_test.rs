// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the PostgreSQL job state store.
//!
//! Run with TEST_STAGING_DATABASE_URL pointing at a disposable database.

use chrono::{TimeDelta, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use staging_scheduler::store::{FileState, JobStateStore, PgStateStore};

/// Helper macro to skip tests if database URL is not set.
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_STAGING_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_STAGING_DATABASE_URL not set");
            return;
        }
    };
}

/// Get a migrated store for testing.
async fn get_test_store() -> Option<(PgPool, PgStateStore)> {
    let database_url = std::env::var("TEST_STAGING_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    let store = PgStateStore::new(pool.clone());
    store.migrate().await.ok()?;
    Some((pool, store))
}

async fn insert_file(pool: &PgPool, job_id: &str, file_id: i64, operation: &str, surl: &str) {
    sqlx::query(
        r#"
        INSERT INTO file_requests
            (job_id, file_id, operation, vo_name, user_dn, delegation_id, surl,
             pin_lifetime, bring_online_timeout)
        VALUES ($1, $2, $3, 'dteam', '/CN=tester', 'dlg', $4, 3600, 28800)
        "#,
    )
    .bind(job_id)
    .bind(file_id)
    .bind(operation)
    .bind(surl)
    .execute(pool)
    .await
    .expect("insert file request");
}

async fn state_of(pool: &PgPool, job_id: &str, file_id: i64) -> (String, Option<String>, bool) {
    sqlx::query_as("SELECT state, reason, retry FROM file_requests WHERE job_id = $1 AND file_id = $2")
        .bind(job_id)
        .bind(file_id)
        .fetch_one(pool)
        .await
        .expect("file request row")
}

async fn cleanup(pool: &PgPool, job_id: &str) {
    sqlx::query("DELETE FROM file_requests WHERE job_id = $1")
        .bind(job_id)
        .execute(pool)
        .await
        .ok();
}

#[tokio::test]
async fn test_staging_claim_is_exclusive() {
    skip_if_no_db!();
    let Some((pool, store)) = get_test_store().await else {
        return;
    };
    let job_id = format!("job-{}", Uuid::new_v4());
    insert_file(&pool, &job_id, 1, "STAGING", "srm://se.cern.ch/data/f1").await;

    let claimed = store.get_files_for_staging().await.unwrap();
    assert!(claimed.iter().any(|r| r.job_id == job_id));

    let again = store.get_files_for_staging().await.unwrap();
    assert!(again.iter().all(|r| r.job_id != job_id));
    assert_eq!(state_of(&pool, &job_id, 1).await.0, "STARTED");

    cleanup(&pool, &job_id).await;
}

#[tokio::test]
async fn test_token_update_and_recovery() {
    skip_if_no_db!();
    let Some((pool, store)) = get_test_store().await else {
        return;
    };
    let job_id = format!("job-{}", Uuid::new_v4());
    let token = format!("tok-{}", Uuid::new_v4());
    insert_file(&pool, &job_id, 1, "STAGING", "srm://se.cern.ch/data/f1").await;
    store.get_files_for_staging().await.unwrap();

    store.update_file_token(&job_id, 1, &token).await.unwrap();

    let started = store.get_already_started_staging().await.unwrap();
    let ours: Vec<_> = started.iter().filter(|s| s.token == token).collect();
    assert_eq!(ours.len(), 1);
    assert_eq!(ours[0].request.surl, "srm://se.cern.ch/data/f1");
    assert_eq!(state_of(&pool, &job_id, 1).await.0, "QUEUED");

    cleanup(&pool, &job_id).await;
}

#[tokio::test]
async fn test_state_updates_skip_canceled_files() {
    skip_if_no_db!();
    let Some((pool, store)) = get_test_store().await else {
        return;
    };
    let job_id = format!("job-{}", Uuid::new_v4());
    insert_file(&pool, &job_id, 1, "STAGING", "srm://se.cern.ch/data/f1").await;
    insert_file(&pool, &job_id, 2, "STAGING", "srm://se.cern.ch/data/f2").await;
    store.get_files_for_staging().await.unwrap();
    sqlx::query("UPDATE file_requests SET state = 'CANCELED' WHERE job_id = $1 AND file_id = 2")
        .bind(&job_id)
        .execute(&pool)
        .await
        .unwrap();

    store
        .update_file_state(&job_id, 1, FileState::Failed, "Connection timed out", true)
        .await
        .unwrap();
    store
        .update_file_state(&job_id, 2, FileState::Finished, "", false)
        .await
        .unwrap();

    let (state, reason, retry) = state_of(&pool, &job_id, 1).await;
    assert_eq!(state, "FAILED");
    assert_eq!(reason.as_deref(), Some("Connection timed out"));
    assert!(retry);
    assert_eq!(state_of(&pool, &job_id, 2).await.0, "CANCELED");

    let canceled = store.get_staging_files_for_canceling().await.unwrap();
    assert!(canceled.iter().any(|c| c.surl == "srm://se.cern.ch/data/f2"));
    let again = store.get_staging_files_for_canceling().await.unwrap();
    assert!(again.iter().all(|c| c.surl != "srm://se.cern.ch/data/f2"));

    cleanup(&pool, &job_id).await;
}

#[tokio::test]
async fn test_started_deletions_are_requeued() {
    skip_if_no_db!();
    let Some((pool, store)) = get_test_store().await else {
        return;
    };
    let job_id = format!("job-{}", Uuid::new_v4());
    insert_file(&pool, &job_id, 1, "DELETION", "srm://se.cern.ch/data/old").await;
    store.get_files_for_deletion().await.unwrap();
    assert_eq!(state_of(&pool, &job_id, 1).await.0, "STARTED");

    assert!(store.requeue_started_deletions().await.unwrap() >= 1);
    assert_eq!(state_of(&pool, &job_id, 1).await.0, "SUBMITTED");

    cleanup(&pool, &job_id).await;
}

#[tokio::test]
async fn test_started_staging_without_token_is_requeued() {
    skip_if_no_db!();
    let Some((pool, store)) = get_test_store().await else {
        return;
    };
    let job_id = format!("job-{}", Uuid::new_v4());
    let token = format!("tok-{}", Uuid::new_v4());
    insert_file(&pool, &job_id, 1, "STAGING", "srm://se.cern.ch/data/f1").await;
    insert_file(&pool, &job_id, 2, "STAGING", "srm://se.cern.ch/data/f2").await;
    store.get_files_for_staging().await.unwrap();
    store.update_file_token(&job_id, 2, &token).await.unwrap();

    assert!(store.requeue_started_staging().await.unwrap() >= 1);
    assert_eq!(state_of(&pool, &job_id, 1).await.0, "SUBMITTED");
    assert_eq!(state_of(&pool, &job_id, 2).await.0, "QUEUED");

    cleanup(&pool, &job_id).await;
}

#[tokio::test]
async fn test_delegated_credential_lookup() {
    skip_if_no_db!();
    let Some((pool, store)) = get_test_store().await else {
        return;
    };
    let delegation_id = format!("dlg-{}", Uuid::new_v4());
    let termination = Utc::now() + TimeDelta::hours(12);
    sqlx::query(
        "INSERT INTO delegated_credentials (delegation_id, user_dn, proxy, termination_time) VALUES ($1, '/CN=tester', 'PEM', $2)",
    )
    .bind(&delegation_id)
    .bind(termination)
    .execute(&pool)
    .await
    .unwrap();

    let credential = store
        .get_delegated_credential("/CN=tester", &delegation_id)
        .await
        .unwrap()
        .expect("credential stored");
    assert_eq!(credential.proxy, "PEM");
    assert!(
        store
            .get_delegated_credential("/CN=nobody", &delegation_id)
            .await
            .unwrap()
            .is_none()
    );

    sqlx::query("DELETE FROM delegated_credentials WHERE delegation_id = $1")
        .bind(&delegation_id)
        .execute(&pool)
        .await
        .ok();
}

#[tokio::test]
async fn test_concurrent_claims_never_share_a_file() {
    skip_if_no_db!();
    let Some((pool, store)) = get_test_store().await else {
        return;
    };
    let job_id = format!("job-{}", Uuid::new_v4());
    for file_id in 0..20 {
        insert_file(
            &pool,
            &job_id,
            file_id,
            "STAGING",
            &format!("srm://se.cern.ch/data/f{file_id}"),
        )
        .await;
    }

    let claimers: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone().with_batch_size(5);
            async move { store.get_files_for_staging().await.unwrap() }
        })
        .collect();
    let results = futures::future::join_all(claimers).await;

    let mut ours: Vec<i64> = results
        .into_iter()
        .flatten()
        .filter(|r| r.job_id == job_id)
        .map(|r| r.file_id)
        .collect();
    let claimed = ours.len();
    ours.sort_unstable();
    ours.dedup();
    assert_eq!(ours.len(), claimed);

    cleanup(&pool, &job_id).await;
}
