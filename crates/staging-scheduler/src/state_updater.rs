// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Buffered file state updates.
//!
//! Tasks record per-file outcomes here instead of writing to the store
//! directly. A background loop swaps the buffer out and writes it as one
//! batch every flush interval. A batch that fails to write goes back to the
//! front of the buffer and is retried on the next tick.
//!
//! On shutdown the buffer is flushed one last time. If that fails and a
//! spool directory is configured, the remaining updates are written there as
//! JSON and loaded back by [`StateUpdater::recover_spool`] on the next start.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::context::JobContext;
use crate::store::{self, FileState, FileStateUpdate, JobStateStore};

const SPOOL_PREFIX: &str = "state-updates-";

/// State updater configuration.
#[derive(Debug, Clone)]
pub struct StateUpdaterConfig {
    /// How often the buffer is written to the store
    pub flush_interval: Duration,
    /// Where unwritten updates are kept across restarts
    pub spool_dir: Option<PathBuf>,
}

impl Default for StateUpdaterConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(10),
            spool_dir: None,
        }
    }
}

/// Accumulates state changes and writes them in batches.
pub struct StateUpdater {
    store: Arc<dyn JobStateStore>,
    buffer: Mutex<Vec<FileStateUpdate>>,
    config: StateUpdaterConfig,
    shutdown: Arc<Notify>,
}

impl StateUpdater {
    /// Create a new updater writing to `store`.
    pub fn new(store: Arc<dyn JobStateStore>, config: StateUpdaterConfig) -> Self {
        Self {
            store,
            buffer: Mutex::new(Vec::new()),
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<FileStateUpdate>> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Record a state change for one file.
    pub fn update(&self, job_id: &str, file_id: i64, state: FileState, reason: &str, retry: bool) {
        self.lock().push(FileStateUpdate {
            job_id: job_id.to_string(),
            file_id,
            state,
            reason: reason.to_string(),
            retry,
        });
    }

    /// Record the same state change for several files.
    pub fn update_ids(&self, ids: &[(String, i64)], state: FileState, reason: &str, retry: bool) {
        let mut buffer = self.lock();
        buffer.extend(ids.iter().map(|(job_id, file_id)| FileStateUpdate {
            job_id: job_id.clone(),
            file_id: *file_id,
            state,
            reason: reason.to_string(),
            retry,
        }));
    }

    /// Record the same state change for every file of a context.
    pub fn update_all(&self, ctx: &JobContext, state: FileState, reason: &str, retry: bool) {
        self.update_ids(&ctx.all_ids(), state, reason, retry);
    }

    /// Copy of the updates not yet written.
    pub fn pending(&self) -> Vec<FileStateUpdate> {
        self.lock().clone()
    }

    /// Write everything buffered so far. Returns the number of updates written.
    pub async fn flush(&self) -> store::Result<usize> {
        let batch = std::mem::take(&mut *self.lock());
        if batch.is_empty() {
            return Ok(0);
        }

        match self.store.update_file_states(&batch).await {
            Ok(()) => {
                debug!(count = batch.len(), "Flushed file state updates");
                Ok(batch.len())
            }
            Err(e) => {
                warn!(count = batch.len(), error = %e, "State update batch put back");
                self.put_back(batch);
                Err(e)
            }
        }
    }

    fn put_back(&self, batch: Vec<FileStateUpdate>) {
        let mut buffer = self.lock();
        let newer = std::mem::replace(&mut *buffer, batch);
        buffer.extend(newer);
    }

    /// Run the flush loop until shutdown, then flush a final time.
    pub async fn run(&self) {
        info!(
            flush_interval_secs = self.config.flush_interval.as_secs(),
            "State updater started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    break;
                }
                _ = tokio::time::sleep(self.config.flush_interval) => {
                    if let Err(e) = self.flush().await {
                        error!(error = %e, "Failed to flush file state updates");
                    }
                }
            }
        }

        if let Err(e) = self.flush().await {
            error!(error = %e, "Final flush of file state updates failed");
            match self.spool().await {
                Ok(Some(path)) => info!(path = %path.display(), "Spooled file state updates"),
                Ok(None) => {}
                Err(e) => error!(error = %e, "Failed to spool file state updates"),
            }
        }
        info!("State updater stopped");
    }

    /// Write the buffer to the spool directory.
    ///
    /// Returns `None` when nothing was written.
    pub async fn spool(&self) -> crate::error::Result<Option<PathBuf>> {
        let Some(dir) = self.config.spool_dir.as_deref() else {
            return Ok(None);
        };
        let batch = std::mem::take(&mut *self.lock());
        if batch.is_empty() {
            return Ok(None);
        }

        let path = dir.join(format!("{SPOOL_PREFIX}{}.json", uuid::Uuid::new_v4()));
        let body = serde_json::to_vec(&batch)?;
        if let Err(e) = write_spool(dir, &path, &body).await {
            self.put_back(batch);
            return Err(e.into());
        }
        Ok(Some(path))
    }

    /// Load spooled updates into the buffer and remove their files.
    ///
    /// Returns the number of updates recovered.
    pub async fn recover_spool(&self) -> crate::error::Result<usize> {
        let Some(dir) = self.config.spool_dir.as_deref() else {
            return Ok(0);
        };
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut recovered = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(SPOOL_PREFIX) || !name.ends_with(".json") {
                continue;
            }
            let body = tokio::fs::read(entry.path()).await?;
            let updates: Vec<FileStateUpdate> = serde_json::from_slice(&body)?;
            recovered += updates.len();
            self.lock().extend(updates);
            tokio::fs::remove_file(entry.path()).await?;
        }

        if recovered > 0 {
            info!(count = recovered, "Recovered spooled file state updates");
        }
        Ok(recovered)
    }
}

async fn write_spool(dir: &Path, path: &Path, body: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, body).await
}
