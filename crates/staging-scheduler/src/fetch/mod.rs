// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic producers pulling work out of the job state store.
//!
//! Every fetcher sleeps for its interval, then runs one pass. A failed pass
//! is logged and the loop carries on, so a fetcher only stops on shutdown.
//! While the host drains, passes are skipped and the loop sleeps for the
//! longer drain interval.

pub mod cancel;
pub mod deletion;
pub mod staging;

pub use cancel::FetchCancelStaging;
pub use deletion::FetchDeletion;
pub use staging::FetchStaging;

use std::time::Duration;

use crate::drain::DrainMode;

/// Fetcher configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Delay between two passes
    pub interval: Duration,
    /// Delay between two checks while draining
    pub drain_interval: Duration,
}

impl FetchConfig {
    /// Defaults of the staging fetcher.
    pub fn staging() -> Self {
        Self {
            interval: Duration::from_secs(1),
            drain_interval: Duration::from_secs(15),
        }
    }

    /// Defaults of the deletion fetcher.
    pub fn deletion() -> Self {
        Self::staging()
    }

    /// Defaults of the cancellation fetcher.
    pub fn cancel() -> Self {
        Self {
            interval: Duration::from_secs(10),
            ..Self::staging()
        }
    }

    /// Sleep before the next pass.
    pub fn next_sleep(&self, drain: &DrainMode) -> Duration {
        if drain.is_draining() {
            self.drain_interval
        } else {
            self.interval
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::staging()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_uses_longer_interval() {
        let config = FetchConfig::cancel();
        let drain = DrainMode::new(false);
        assert_eq!(config.next_sleep(&drain), Duration::from_secs(10));

        drain.set(true);
        assert_eq!(config.next_sleep(&drain), Duration::from_secs(15));
    }
}
