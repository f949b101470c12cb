// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host drain flag.

use std::sync::atomic::{AtomicBool, Ordering};

/// When set, fetchers stop picking up new work. Tasks already running or
/// waiting to be polled are not affected.
#[derive(Debug, Default)]
pub struct DrainMode {
    draining: AtomicBool,
}

impl DrainMode {
    /// Create the flag with an initial value.
    pub fn new(draining: bool) -> Self {
        Self {
            draining: AtomicBool::new(draining),
        }
    }

    /// Enter or leave drain mode.
    pub fn set(&self, draining: bool) {
        self.draining.store(draining, Ordering::SeqCst);
    }

    /// Whether the host is draining.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}
