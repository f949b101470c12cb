// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed job state store.
//!
//! Claiming queries move rows out of their eligible state in the same
//! statement that reads them (`FOR UPDATE SKIP LOCKED`), so two scheduler
//! instances sharing a database never dispatch the same file twice.

use async_trait::async_trait;
use sqlx::PgPool;

use super::{
    CancelRequest, DelegatedCredential, DeletionRequest, FileState, FileStateUpdate,
    JobStateStore, Result, StagingRequest, StartedStaging,
};

/// Default maximum number of rows claimed per fetch.
pub const DEFAULT_BATCH_SIZE: i64 = 1000;

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
    batch_size: i64,
}

impl PgStateStore {
    /// Create a new store over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Limit the number of rows claimed per fetch.
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Apply the embedded migrations.
    pub async fn migrate(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

// ============================================================================
// Claiming
// ============================================================================

/// Claim submitted staging requests.
pub async fn claim_staging(pool: &PgPool, limit: i64) -> Result<Vec<StagingRequest>> {
    let rows = sqlx::query_as::<_, StagingRequest>(
        r#"
        UPDATE file_requests
        SET state = 'STARTED', started_at = NOW()
        WHERE (job_id, file_id) IN (
            SELECT job_id, file_id
            FROM file_requests
            WHERE operation = 'STAGING' AND state = 'SUBMITTED'
            ORDER BY created_at
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING vo_name, user_dn, delegation_id, surl, job_id, file_id,
                  pin_lifetime, bring_online_timeout, space_token
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Staging requests queued under a token.
pub async fn list_started_staging(pool: &PgPool) -> Result<Vec<StartedStaging>> {
    let rows = sqlx::query_as::<_, StartedStaging>(
        r#"
        SELECT vo_name, user_dn, delegation_id, surl, job_id, file_id,
               pin_lifetime, bring_online_timeout, space_token,
               bring_online_token AS token
        FROM file_requests
        WHERE operation = 'STAGING'
          AND state = 'QUEUED'
          AND bring_online_token IS NOT NULL
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Claim canceled staging files whose cancellation was not yet propagated.
pub async fn claim_canceled_staging(pool: &PgPool) -> Result<Vec<CancelRequest>> {
    let rows = sqlx::query_as::<_, CancelRequest>(
        r#"
        UPDATE file_requests
        SET cancel_handled_at = NOW()
        WHERE operation = 'STAGING'
          AND state = 'CANCELED'
          AND started_at IS NOT NULL
          AND cancel_handled_at IS NULL
        RETURNING file_id, surl, bring_online_token AS token
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Claim submitted deletion requests.
pub async fn claim_deletions(pool: &PgPool, limit: i64) -> Result<Vec<DeletionRequest>> {
    let rows = sqlx::query_as::<_, DeletionRequest>(
        r#"
        UPDATE file_requests
        SET state = 'STARTED', started_at = NOW()
        WHERE (job_id, file_id) IN (
            SELECT job_id, file_id
            FROM file_requests
            WHERE operation = 'DELETION' AND state = 'SUBMITTED'
            ORDER BY created_at
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING vo_name, user_dn, delegation_id, surl, job_id, file_id
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

// ============================================================================
// State updates
// ============================================================================

const UPDATE_STATE_SQL: &str = r#"
    UPDATE file_requests
    SET state = $3,
        reason = NULLIF($4, ''),
        retry = $5,
        finished_at = CASE WHEN $3 IN ('FINISHED', 'FAILED') THEN NOW() ELSE finished_at END
    WHERE job_id = $1 AND file_id = $2 AND state <> 'CANCELED'
"#;

/// Set the state of one file. Canceled files are left untouched.
pub async fn update_state(
    pool: &PgPool,
    job_id: &str,
    file_id: i64,
    state: FileState,
    reason: &str,
    retry: bool,
) -> Result<()> {
    sqlx::query(UPDATE_STATE_SQL)
        .bind(job_id)
        .bind(file_id)
        .bind(state.as_str())
        .bind(reason)
        .bind(retry)
        .execute(pool)
        .await?;

    Ok(())
}

/// Apply a batch of updates in one transaction.
pub async fn update_states(pool: &PgPool, updates: &[FileStateUpdate]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for u in updates {
        sqlx::query(UPDATE_STATE_SQL)
            .bind(&u.job_id)
            .bind(u.file_id)
            .bind(u.state.as_str())
            .bind(&u.reason)
            .bind(u.retry)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(())
}

/// Store the bring-online token of a file.
pub async fn update_token(pool: &PgPool, job_id: &str, file_id: i64, token: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE file_requests
        SET state = 'QUEUED', bring_online_token = $3
        WHERE job_id = $1 AND file_id = $2 AND state <> 'CANCELED'
        "#,
    )
    .bind(job_id)
    .bind(file_id)
    .bind(token)
    .execute(pool)
    .await?;

    Ok(())
}

/// Put staging files claimed but never issued back into the queue.
pub async fn requeue_staging(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE file_requests
        SET state = 'SUBMITTED', started_at = NULL
        WHERE operation = 'STAGING' AND state = 'STARTED'
          AND bring_online_token IS NULL
        "#,
    )
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Put deletions interrupted by a previous run back into the queue.
pub async fn requeue_deletions(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE file_requests
        SET state = 'SUBMITTED', started_at = NULL
        WHERE operation = 'DELETION' AND state = 'STARTED'
        "#,
    )
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Fetch the delegated proxy of a user.
pub async fn get_credential(
    pool: &PgPool,
    user_dn: &str,
    delegation_id: &str,
) -> Result<Option<DelegatedCredential>> {
    let record = sqlx::query_as::<_, DelegatedCredential>(
        r#"
        SELECT delegation_id, user_dn, proxy, termination_time
        FROM delegated_credentials
        WHERE user_dn = $1 AND delegation_id = $2
        "#,
    )
    .bind(user_dn)
    .bind(delegation_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

#[async_trait]
impl JobStateStore for PgStateStore {
    async fn get_files_for_staging(&self) -> Result<Vec<StagingRequest>> {
        claim_staging(&self.pool, self.batch_size).await
    }

    async fn get_already_started_staging(&self) -> Result<Vec<StartedStaging>> {
        list_started_staging(&self.pool).await
    }

    async fn get_staging_files_for_canceling(&self) -> Result<Vec<CancelRequest>> {
        claim_canceled_staging(&self.pool).await
    }

    async fn get_files_for_deletion(&self) -> Result<Vec<DeletionRequest>> {
        claim_deletions(&self.pool, self.batch_size).await
    }

    async fn update_file_state(
        &self,
        job_id: &str,
        file_id: i64,
        state: FileState,
        reason: &str,
        retry: bool,
    ) -> Result<()> {
        update_state(&self.pool, job_id, file_id, state, reason, retry).await
    }

    async fn update_file_states(&self, updates: &[FileStateUpdate]) -> Result<()> {
        update_states(&self.pool, updates).await
    }

    async fn update_file_token(&self, job_id: &str, file_id: i64, token: &str) -> Result<()> {
        update_token(&self.pool, job_id, file_id, token).await
    }

    async fn requeue_started_staging(&self) -> Result<u64> {
        requeue_staging(&self.pool).await
    }

    async fn requeue_started_deletions(&self) -> Result<u64> {
        requeue_deletions(&self.pool).await
    }

    async fn get_delegated_credential(
        &self,
        user_dn: &str,
        delegation_id: &str,
    ) -> Result<Option<DelegatedCredential>> {
        get_credential(&self.pool, user_dn, delegation_id).await
    }
}
