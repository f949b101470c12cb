// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deletion group.

use std::ops::{Deref, DerefMut};

use super::{GroupKey, JobContext, storage_endpoint};
use crate::credentials::{self, CredentialProvider};
use crate::store::DeletionRequest;

/// A group of files to delete together.
#[derive(Debug, Clone, Default)]
pub struct DeletionContext {
    base: JobContext,
}

impl DeletionContext {
    /// Grouping key of a request.
    pub fn key_of(request: &DeletionRequest) -> GroupKey {
        GroupKey {
            vo_name: request.vo_name.clone(),
            user_dn: request.user_dn.clone(),
            endpoint: storage_endpoint(&request.surl),
            space_token: None,
        }
    }

    /// Start a group from its first request, resolving the proxy.
    pub async fn new(
        first: &DeletionRequest,
        provider: &dyn CredentialProvider,
    ) -> credentials::Result<Self> {
        let base = JobContext::new(
            &first.user_dn,
            &first.vo_name,
            &first.delegation_id,
            provider,
        )
        .await?;
        let mut ctx = Self { base };
        ctx.add(first);
        Ok(ctx)
    }

    /// Add a request.
    pub fn add(&mut self, request: &DeletionRequest) {
        self.base
            .add(&request.job_id, request.file_id, &request.surl);
    }
}

impl Deref for DeletionContext {
    type Target = JobContext;

    fn deref(&self) -> &JobContext {
        &self.base
    }
}

impl DerefMut for DeletionContext {
    fn deref_mut(&mut self) -> &mut JobContext {
        &mut self.base
    }
}
