// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded pool running tasks on the tokio runtime.
//!
//! Submitting never blocks: each task is spawned at once and waits for one
//! of the pool's permits before it starts, so at most `size` tasks talk to
//! remote storage at the same time.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

use crate::task::{PollTask, Task, TaskEnv};
use crate::waiting_room::TaskSink;

/// Runs tasks with bounded concurrency.
pub struct WorkerPool {
    env: Arc<TaskEnv>,
    permits: Arc<Semaphore>,
    size: usize,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

struct InFlight {
    counter: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.counter.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl WorkerPool {
    /// Create a pool of `size` workers sharing `env`.
    pub fn new(env: Arc<TaskEnv>, size: usize) -> Self {
        Self {
            env,
            permits: Arc::new(Semaphore::new(size)),
            size,
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Collaborators handed to every task.
    pub fn env(&self) -> &Arc<TaskEnv> {
        &self.env
    }

    /// Maximum number of concurrently running tasks.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks submitted and not yet finished, running or waiting for a permit.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Queue a task for execution.
    pub fn submit(&self, task: impl Into<Task>) {
        self.dispatch(task.into());
    }

    fn dispatch(&self, task: Task) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight {
            counter: self.in_flight.clone(),
            idle: self.idle.clone(),
        };
        let permits = self.permits.clone();
        let env = self.env.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(task = task.kind(), "Worker pool closed, dropping task");
                    return;
                }
            };
            debug!(task = task.kind(), "Running task");
            task.run(env).await;
        });
    }

    /// Wait until every submitted task has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Refuse to start any task still waiting for a permit.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[async_trait]
impl TaskSink<PollTask> for WorkerPool {
    async fn submit(&self, task: PollTask) {
        self.dispatch(Task::Poll(task));
    }
}
