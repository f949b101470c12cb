// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Staging Scheduler - Bring-online and Deletion Daemon
//!
//! Polls the file request tables for:
//! - Files to bring online from tape, and the polling of issued requests
//! - Canceled staging files to abort
//! - Files to delete from remote storage

use std::sync::Arc;
use tracing::{info, warn};

use staging_scheduler::config::Config;
use staging_scheduler::credentials::FileCredentialProvider;
use staging_scheduler::remote::{RemoteStagingClient, SessionConfig, TapeRestClient};
use staging_scheduler::runtime::StagingRuntime;
use staging_scheduler::state_updater::StateUpdaterConfig;
use staging_scheduler::store::{JobStateStore, PgStateStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "staging_scheduler=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        worker_threads = config.worker_threads,
        proxy_dir = %config.proxy_dir.display(),
        infosys = %config.infosys,
        drain = config.drain,
        "Starting Staging Scheduler"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    let pg_store = PgStateStore::new(pool);
    pg_store.migrate().await?;

    info!("Database schema verified");

    let store: Arc<dyn JobStateStore> = Arc::new(pg_store);
    let credentials = Arc::new(FileCredentialProvider::new(
        store.clone(),
        &config.proxy_dir,
        config.min_proxy_validity,
    ));
    let remote = Arc::new(TapeRestClient::default());
    info!(remote = remote.client_type(), "Remote client initialized");

    let runtime = StagingRuntime::builder()
        .store(store)
        .remote(remote)
        .credentials(credentials)
        .worker_threads(config.worker_threads)
        .session_config(SessionConfig::new(&config.infosys))
        .drain(config.drain)
        .state_updater(StateUpdaterConfig {
            flush_interval: config.state_flush_interval,
            spool_dir: config.spool_dir.clone(),
        })
        .build()?
        .start()
        .await?;

    info!("Staging Scheduler ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Staging Scheduler shut down");

    Ok(())
}
