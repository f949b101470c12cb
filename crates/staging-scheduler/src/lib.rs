// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Staging Scheduler - Bring-online and Deletion Scheduling
//!
//! This crate moves tape-resident files to disk ("bring-online") and deletes
//! files on remote grid storage, on behalf of a transfer service that records
//! the requests in PostgreSQL.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            PostgreSQL                                │
//! │                  (file_requests, delegated_credentials)              │
//! └──────────────────────────────────────────────────────────────────────┘
//!        │ claim            │ claim            │ canceled        ▲
//!        ▼                  ▼                  ▼                 │ batch
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │FetchStaging │   │FetchDeletion │   │ FetchCancel  │   │ StateUpdater │
//! └──────┬──────┘   └──────┬───────┘   └──────┬───────┘   └──────────────┘
//!        │ BringOnlineTask │ DeletionTask     │ cancel           ▲
//!        ▼                 ▼                  ▼                  │
//! ┌─────────────────────────────────┐  ┌──────────────┐          │
//! │           WorkerPool            │  │ ActiveToken  │          │
//! │   (N permits, tokio tasks)      │◄─│   Registry   │          │
//! └──────┬───────────────▲──────────┘  └──────────────┘          │
//!        │ token         │ due                                   │
//!        ▼               │                                       │
//! ┌─────────────────────────────────┐                            │
//! │     WaitingRoom<PollTask>       │── file states ─────────────┘
//! └─────────────────────────────────┘
//! ```
//!
//! Pending requests are grouped by VO, user, storage endpoint and space token
//! so one remote call serves many files. A bring-online that is queued by the
//! storage returns a token, and the group continues as a poll task with
//! exponential backoff until every file is on disk, failed or canceled.
//!
//! # File State Machine
//!
//! ```text
//!   SUBMITTED ──claim──► STARTED ──token──► QUEUED ──poll──► FINISHED
//!                           │                  │
//!                           └──────────────────┴────────────► FAILED
//!
//!   any non-terminal state ──user──► CANCELED
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `STAGING_DATABASE_URL` | Yes | - | PostgreSQL connection string |
//! | `STAGING_WORKER_THREADS` | No | `32` | Tasks running at once |
//! | `STAGING_PROXY_DIR` | No | `/tmp` | Directory for proxy files |
//! | `STAGING_INFOSYS` | No | `false` | Information system, `false` disables it |
//! | `STAGING_STATE_FLUSH_INTERVAL_SECS` | No | `10` | State update batch period |
//! | `STAGING_DRAIN` | No | `false` | Start in drain mode |
//! | `STAGING_SPOOL_DIR` | No | - | Spool for unwritten state updates |
//! | `STAGING_MIN_PROXY_VALIDITY_SECS` | No | `300` | Minimum remaining proxy lifetime |
//!
//! # Modules
//!
//! - [`config`]: Server configuration from environment variables
//! - [`context`]: Grouping of file requests into batchable units
//! - [`credentials`]: Delegated proxy resolution
//! - [`fetch`]: Periodic producers reading the job state store
//! - [`registry`]: Live bring-online tokens and cancellation
//! - [`remote`]: Remote storage client abstraction and implementations
//! - [`retry`]: Retry classification of remote errors
//! - [`runtime`]: Embeddable runtime wiring everything together
//! - [`store`]: Job state store backends
//! - [`task`]: Bring-online, poll and deletion tasks

#![deny(missing_docs)]

/// Server configuration loaded from environment variables.
pub mod config;

/// Grouping of file requests into batchable units.
pub mod context;

/// Delegated proxy resolution and validity checks.
pub mod credentials;

/// Host drain flag.
pub mod drain;

/// Error types for scheduler operations.
pub mod error;

/// Periodic fetchers for staging, deletion and cancellation.
pub mod fetch;

/// Live bring-online tokens and URLs.
pub mod registry;

/// Remote storage clients.
pub mod remote;

/// Retry classification of remote errors.
pub mod retry;

/// Embeddable runtime for staging-scheduler.
pub mod runtime;

/// Buffered file state updates.
pub mod state_updater;

/// Job state store backends.
pub mod store;

/// Bring-online, poll and deletion tasks.
pub mod task;

/// Deferred task dispatch.
pub mod waiting_room;

/// Bounded task execution.
pub mod worker_pool;

pub use config::Config;
pub use error::Error;
