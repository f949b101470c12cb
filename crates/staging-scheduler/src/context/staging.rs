// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Staging group: adds pin lifetime, timeout and space token.

use std::ops::{Deref, DerefMut};

use super::{GroupKey, JobContext, storage_endpoint};
use crate::credentials::{self, CredentialProvider};
use crate::store::{self, JobStateStore, StagingRequest};

/// A group of files to bring online together.
#[derive(Debug, Clone, Default)]
pub struct StagingContext {
    base: JobContext,
    max_pin_lifetime: i64,
    max_timeout: i64,
    space_token: Option<String>,
}

impl StagingContext {
    /// Grouping key of a request.
    pub fn key_of(request: &StagingRequest) -> GroupKey {
        GroupKey {
            vo_name: request.vo_name.clone(),
            user_dn: request.user_dn.clone(),
            endpoint: storage_endpoint(&request.surl),
            space_token: request.space_token.clone().filter(|t| !t.is_empty()),
        }
    }

    /// Start a group from its first request, resolving the proxy.
    pub async fn new(
        first: &StagingRequest,
        provider: &dyn CredentialProvider,
    ) -> credentials::Result<Self> {
        let base = JobContext::new(
            &first.user_dn,
            &first.vo_name,
            &first.delegation_id,
            provider,
        )
        .await?;
        let mut ctx = Self::from_base(base, first.space_token.clone());
        ctx.add(first);
        Ok(ctx)
    }

    /// Start a group over an existing base context.
    pub fn from_base(base: JobContext, space_token: Option<String>) -> Self {
        Self {
            base,
            max_pin_lifetime: 0,
            max_timeout: 0,
            space_token: space_token.filter(|t| !t.is_empty()),
        }
    }

    /// Add a request, raising the pin lifetime and timeout ceilings.
    pub fn add(&mut self, request: &StagingRequest) {
        self.base
            .add(&request.job_id, request.file_id, &request.surl);
        self.max_pin_lifetime = self.max_pin_lifetime.max(request.pin_lifetime);
        self.max_timeout = self.max_timeout.max(request.bring_online_timeout);
    }

    /// Largest pin lifetime requested by any file.
    pub fn pin_lifetime(&self) -> i64 {
        self.max_pin_lifetime
    }

    /// Largest bring-online timeout requested by any file.
    pub fn timeout(&self) -> i64 {
        self.max_timeout
    }

    /// Space token of the group.
    pub fn space_token(&self) -> Option<&str> {
        self.space_token.as_deref()
    }

    /// Store `token` on every file of the group.
    pub async fn record_token(&self, store: &dyn JobStateStore, token: &str) -> store::Result<()> {
        for (job_id, file_id) in self.base.all_ids() {
            store.update_file_token(&job_id, file_id, token).await?;
        }
        Ok(())
    }
}

impl Deref for StagingContext {
    type Target = JobContext;

    fn deref(&self) -> &JobContext {
        &self.base
    }
}

impl DerefMut for StagingContext {
    fn deref_mut(&mut self) -> &mut JobContext {
        &mut self.base
    }
}
