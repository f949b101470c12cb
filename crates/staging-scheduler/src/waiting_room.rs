// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deferred dispatch of tasks.
//!
//! A [`WaitingRoom`] holds tasks that must not run before a wall-clock
//! instant. A single background loop wakes once per tick, takes every task
//! whose time has come and hands it to the attached [`TaskSink`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A task that knows when it wants to run.
pub trait Deferred: Send + 'static {
    /// Earliest instant the task may be dispatched.
    fn wake_at(&self) -> DateTime<Utc>;
}

/// Destination of dispatched tasks.
#[async_trait]
pub trait TaskSink<T>: Send + Sync {
    /// Accept a task for execution.
    async fn submit(&self, task: T);
}

/// Waiting room errors.
#[derive(Debug, Error)]
pub enum WaitingRoomError {
    /// `attach` was called a second time.
    #[error("waiting room is already attached to a sink")]
    AlreadyAttached,
}

/// Waiting room configuration.
#[derive(Debug, Clone)]
pub struct WaitingRoomConfig {
    /// How often due tasks are collected
    pub tick: Duration,
}

impl Default for WaitingRoomConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
        }
    }
}

struct Entry<T> {
    wake_at: DateTime<Utc>,
    seq: u64,
    task: T,
}

// min-heap on (wake_at, seq)
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .wake_at
            .cmp(&self.wake_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

/// Time-ordered holding area for tasks.
pub struct WaitingRoom<T: Deferred> {
    heap: Mutex<BinaryHeap<Entry<T>>>,
    seq: AtomicU64,
    attached: AtomicBool,
    shutdown: watch::Sender<bool>,
    config: WaitingRoomConfig,
}

impl<T: Deferred> WaitingRoom<T> {
    /// Create an empty, detached waiting room.
    pub fn new(config: WaitingRoomConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            attached: AtomicBool::new(false),
            shutdown,
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BinaryHeap<Entry<T>>> {
        self.heap
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Park a task until its wake time.
    pub fn add(&self, task: T) {
        let entry = Entry {
            wake_at: task.wake_at(),
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            task,
        };
        self.lock().push(entry);
    }

    /// Remove and return every task due at `now`, earliest first.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<T> {
        let mut heap = self.lock();
        let mut due = Vec::new();
        while heap.peek().is_some_and(|entry| entry.wake_at <= now) {
            if let Some(entry) = heap.pop() {
                due.push(entry.task);
            }
        }
        due
    }

    /// Number of parked tasks.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no task is parked.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether the dispatch loop was started.
    pub fn is_attached(&self) -> bool {
        self.attached.load(AtomicOrdering::SeqCst)
    }

    /// Stop the dispatch loop. Parked tasks stay parked.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Start the dispatch loop. Must be called exactly once.
    pub fn attach(
        self: &Arc<Self>,
        sink: Arc<dyn TaskSink<T>>,
    ) -> Result<JoinHandle<()>, WaitingRoomError> {
        if self.attached.swap(true, AtomicOrdering::SeqCst) {
            return Err(WaitingRoomError::AlreadyAttached);
        }
        let room = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        Ok(tokio::spawn(async move { room.run(sink, shutdown).await }))
    }

    async fn run(&self, sink: Arc<dyn TaskSink<T>>, mut shutdown: watch::Receiver<bool>) {
        info!(tick_ms = self.config.tick.as_millis() as u64, "Waiting room started");

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.tick) => {
                    self.dispatch_due(sink.as_ref(), &shutdown).await;
                }
            }
        }

        info!(parked = self.len(), "Waiting room stopped");
    }

    async fn dispatch_due(&self, sink: &dyn TaskSink<T>, shutdown: &watch::Receiver<bool>) {
        let due = self.take_due(Utc::now());
        if !due.is_empty() {
            debug!(count = due.len(), "Dispatching due tasks");
        }
        let mut due = due.into_iter();
        while let Some(task) = due.next() {
            if *shutdown.borrow() {
                self.add(task);
                due.for_each(|task| self.add(task));
                return;
            }
            sink.submit(task).await;
        }
    }
}
