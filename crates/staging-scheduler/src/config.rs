// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for staging-scheduler.

use std::path::PathBuf;
use std::time::Duration;

/// Scheduler configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL URL holding the file request tables
    pub database_url: String,
    /// Number of tasks allowed to run concurrently
    pub worker_threads: usize,
    /// Directory where delegated proxies are materialized
    pub proxy_dir: PathBuf,
    /// Information system passed to every remote session (`false` disables it)
    pub infosys: String,
    /// How often buffered state updates are written to the database
    pub state_flush_interval: Duration,
    /// Start with the drain flag raised
    pub drain: bool,
    /// Directory for state updates that could not be written at shutdown
    pub spool_dir: Option<PathBuf>,
    /// Cached proxies with less remaining lifetime than this are regenerated
    pub min_proxy_validity: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STAGING_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("STAGING_DATABASE_URL"))?;

        let worker_threads: usize = parse_var("STAGING_WORKER_THREADS", "32")?;
        if worker_threads == 0 {
            return Err(ConfigError::InvalidValue {
                var: "STAGING_WORKER_THREADS",
                value: "0".to_string(),
            });
        }

        let proxy_dir =
            PathBuf::from(std::env::var("STAGING_PROXY_DIR").unwrap_or_else(|_| "/tmp".into()));

        let infosys = std::env::var("STAGING_INFOSYS").unwrap_or_else(|_| "false".to_string());

        let state_flush_interval =
            Duration::from_secs(parse_var("STAGING_STATE_FLUSH_INTERVAL_SECS", "10")?);

        let drain = std::env::var("STAGING_DRAIN")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let spool_dir = std::env::var("STAGING_SPOOL_DIR").ok().map(PathBuf::from);

        let min_proxy_validity =
            Duration::from_secs(parse_var("STAGING_MIN_PROXY_VALIDITY_SECS", "300")?);

        Ok(Self {
            database_url,
            worker_threads,
            proxy_dir,
            infosys,
            state_flush_interval,
            drain,
            spool_dir,
            min_proxy_validity,
        })
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, default: &str) -> Result<T, ConfigError> {
    let value = std::env::var(var).unwrap_or_else(|_| default.to_string());
    value
        .parse()
        .map_err(|_| ConfigError::InvalidValue { var, value })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable could not be parsed.
    #[error("Invalid value for {var}: {value}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Raw value that failed to parse.
        value: String,
    },
}
