// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for staging-scheduler.
//!
//! [`StagingRuntime`] wires the fetchers, the worker pool, the poll waiting
//! room and the state updater together and runs them as background tasks of
//! the current tokio runtime.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use staging_scheduler::runtime::StagingRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = StagingRuntime::builder()
//!         .store(store)
//!         .remote(remote)
//!         .credentials(credentials)
//!         .worker_threads(32)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::credentials::CredentialProvider;
use crate::drain::DrainMode;
use crate::fetch::{FetchCancelStaging, FetchConfig, FetchDeletion, FetchStaging};
use crate::registry::ActiveTokenRegistry;
use crate::remote::{RemoteStagingClient, SessionConfig};
use crate::state_updater::{StateUpdater, StateUpdaterConfig};
use crate::store::JobStateStore;
use crate::task::{PollTask, TaskEnv};
use crate::waiting_room::{TaskSink, WaitingRoom, WaitingRoomConfig};
use crate::worker_pool::WorkerPool;

/// Builder for creating a [`StagingRuntime`].
pub struct StagingRuntimeBuilder {
    store: Option<Arc<dyn JobStateStore>>,
    remote: Option<Arc<dyn RemoteStagingClient>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    worker_threads: usize,
    session_config: SessionConfig,
    drain: bool,
    staging_fetch: FetchConfig,
    deletion_fetch: FetchConfig,
    cancel_fetch: FetchConfig,
    state_updater: StateUpdaterConfig,
    waiting_room: WaitingRoomConfig,
    shutdown_timeout: Duration,
}

impl Default for StagingRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            remote: None,
            credentials: None,
            worker_threads: 32,
            session_config: SessionConfig::default(),
            drain: false,
            staging_fetch: FetchConfig::staging(),
            deletion_fetch: FetchConfig::deletion(),
            cancel_fetch: FetchConfig::cancel(),
            state_updater: StateUpdaterConfig::default(),
            waiting_room: WaitingRoomConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl StagingRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the job state store (required).
    pub fn store(mut self, store: Arc<dyn JobStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the remote storage client (required).
    pub fn remote(mut self, remote: Arc<dyn RemoteStagingClient>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Set the credential provider (required).
    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Set the number of tasks running at once.
    ///
    /// Default: 32
    pub fn worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    /// Set the configuration applied to every remote session.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Start in drain mode.
    ///
    /// Default: false
    pub fn drain(mut self, drain: bool) -> Self {
        self.drain = drain;
        self
    }

    /// Set the staging fetcher configuration.
    pub fn staging_fetch(mut self, config: FetchConfig) -> Self {
        self.staging_fetch = config;
        self
    }

    /// Set the deletion fetcher configuration.
    pub fn deletion_fetch(mut self, config: FetchConfig) -> Self {
        self.deletion_fetch = config;
        self
    }

    /// Set the cancellation fetcher configuration.
    pub fn cancel_fetch(mut self, config: FetchConfig) -> Self {
        self.cancel_fetch = config;
        self
    }

    /// Set the state updater configuration.
    pub fn state_updater(mut self, config: StateUpdaterConfig) -> Self {
        self.state_updater = config;
        self
    }

    /// Set the poll waiting room configuration.
    pub fn waiting_room(mut self, config: WaitingRoomConfig) -> Self {
        self.waiting_room = config;
        self
    }

    /// Set how long shutdown waits for running tasks.
    ///
    /// Default: 30 seconds
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<StagingRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let remote = self
            .remote
            .ok_or_else(|| anyhow::anyhow!("remote is required"))?;
        let credentials = self
            .credentials
            .ok_or_else(|| anyhow::anyhow!("credentials is required"))?;
        if self.worker_threads == 0 {
            anyhow::bail!("worker_threads must be at least 1");
        }

        Ok(StagingRuntimeConfig {
            store,
            remote,
            credentials,
            worker_threads: self.worker_threads,
            session_config: self.session_config,
            drain: self.drain,
            staging_fetch: self.staging_fetch,
            deletion_fetch: self.deletion_fetch,
            cancel_fetch: self.cancel_fetch,
            state_updater: self.state_updater,
            waiting_room: self.waiting_room,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

/// Configuration for a [`StagingRuntime`].
pub struct StagingRuntimeConfig {
    store: Arc<dyn JobStateStore>,
    remote: Arc<dyn RemoteStagingClient>,
    credentials: Arc<dyn CredentialProvider>,
    worker_threads: usize,
    session_config: SessionConfig,
    drain: bool,
    staging_fetch: FetchConfig,
    deletion_fetch: FetchConfig,
    cancel_fetch: FetchConfig,
    state_updater: StateUpdaterConfig,
    waiting_room: WaitingRoomConfig,
    shutdown_timeout: Duration,
}

impl StagingRuntimeConfig {
    /// Start the runtime, spawning the fetchers, the waiting room and the state updater.
    pub async fn start(self) -> Result<StagingRuntime> {
        let updater = Arc::new(StateUpdater::new(self.store.clone(), self.state_updater));
        if let Err(e) = updater.recover_spool().await {
            warn!(error = %e, "Failed to recover spooled state updates");
        }

        let registry = Arc::new(ActiveTokenRegistry::new());
        let poll_room = Arc::new(WaitingRoom::<PollTask>::new(self.waiting_room));
        let drain = Arc::new(DrainMode::new(self.drain));

        let env = Arc::new(TaskEnv {
            remote: self.remote.clone(),
            credentials: self.credentials,
            store: self.store,
            updater: updater.clone(),
            registry: registry.clone(),
            poll_room: poll_room.clone(),
            session_config: self.session_config,
        });
        let pool = Arc::new(WorkerPool::new(env.clone(), self.worker_threads));

        let sink: Arc<dyn TaskSink<PollTask>> = pool.clone();
        let poll_room_handle = poll_room.attach(sink)?;

        let updater_shutdown = updater.shutdown_handle();
        let updater_task = updater.clone();
        let updater_handle = tokio::spawn(async move {
            updater_task.run().await;
        });

        let staging = FetchStaging::new(pool.clone(), drain.clone(), self.staging_fetch);
        let staging_shutdown = staging.shutdown_handle();
        let staging_handle = tokio::spawn(async move {
            staging.run().await;
        });

        let deletion = FetchDeletion::new(pool.clone(), drain.clone(), self.deletion_fetch);
        let deletion_shutdown = deletion.shutdown_handle();
        let deletion_handle = tokio::spawn(async move {
            deletion.run().await;
        });

        let cancel = FetchCancelStaging::new(env, drain.clone(), self.cancel_fetch);
        let cancel_shutdown = cancel.shutdown_handle();
        let cancel_handle = tokio::spawn(async move {
            cancel.run().await;
        });

        info!(
            remote = self.remote.client_type(),
            worker_threads = self.worker_threads,
            drain = self.drain,
            "StagingRuntime started"
        );

        Ok(StagingRuntime {
            staging_handle,
            deletion_handle,
            cancel_handle,
            poll_room_handle,
            updater_handle,
            staging_shutdown,
            deletion_shutdown,
            cancel_shutdown,
            updater_shutdown,
            pool,
            poll_room,
            registry,
            updater,
            drain,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

/// A running staging scheduler.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct StagingRuntime {
    staging_handle: JoinHandle<()>,
    deletion_handle: JoinHandle<()>,
    cancel_handle: JoinHandle<()>,
    poll_room_handle: JoinHandle<()>,
    updater_handle: JoinHandle<()>,
    staging_shutdown: Arc<Notify>,
    deletion_shutdown: Arc<Notify>,
    cancel_shutdown: Arc<Notify>,
    updater_shutdown: Arc<Notify>,
    pool: Arc<WorkerPool>,
    poll_room: Arc<WaitingRoom<PollTask>>,
    registry: Arc<ActiveTokenRegistry>,
    updater: Arc<StateUpdater>,
    drain: Arc<DrainMode>,
    shutdown_timeout: Duration,
}

impl StagingRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> StagingRuntimeBuilder {
        StagingRuntimeBuilder::new()
    }

    /// Host drain flag, consulted by every fetcher pass.
    pub fn drain(&self) -> &Arc<DrainMode> {
        &self.drain
    }

    /// Live tokens and URLs.
    pub fn registry(&self) -> &Arc<ActiveTokenRegistry> {
        &self.registry
    }

    /// Buffered file state updates.
    pub fn updater(&self) -> &Arc<StateUpdater> {
        &self.updater
    }

    /// Worker pool running the tasks.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Poll tasks waiting for their next attempt.
    pub fn poll_room(&self) -> &Arc<WaitingRoom<PollTask>> {
        &self.poll_room
    }

    /// Gracefully shut down the runtime.
    ///
    /// Fetchers stop first, then the waiting room. Running tasks get
    /// `shutdown_timeout` to finish before the state updater writes its
    /// final batch.
    pub async fn shutdown(self) -> Result<()> {
        info!("StagingRuntime shutting down...");

        self.staging_shutdown.notify_one();
        self.deletion_shutdown.notify_one();
        self.cancel_shutdown.notify_one();

        if let Err(e) = self.staging_handle.await {
            error!("Staging fetcher task panicked: {}", e);
        }
        if let Err(e) = self.deletion_handle.await {
            error!("Deletion fetcher task panicked: {}", e);
        }
        if let Err(e) = self.cancel_handle.await {
            error!("Cancellation fetcher task panicked: {}", e);
        }

        self.poll_room.shutdown();
        if let Err(e) = self.poll_room_handle.await {
            error!("Waiting room task panicked: {}", e);
        }

        self.pool.close();
        if tokio::time::timeout(self.shutdown_timeout, self.pool.wait_idle())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.pool.in_flight(),
                "Tasks still running at shutdown"
            );
        }

        self.updater_shutdown.notify_one();
        if let Err(e) = self.updater_handle.await {
            error!("State updater task panicked: {}", e);
        }

        info!(
            parked_polls = self.poll_room.len(),
            "StagingRuntime shutdown complete"
        );
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.staging_handle.is_finished()
            && !self.deletion_handle.is_finished()
            && !self.cancel_handle.is_finished()
            && !self.poll_room_handle.is_finished()
            && !self.updater_handle.is_finished()
    }
}
