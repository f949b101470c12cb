// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Aggregation of file requests into batchable groups.
//!
//! A [`JobContext`] collects every file of one fetch pass that shares the
//! owner, the VO and the storage endpoint. One remote call serves the whole
//! group, and its per-URL result is fanned back out to every `(job, file)`
//! pair waiting on that URL.

pub mod deletion;
pub mod staging;

pub use deletion::DeletionContext;
pub use staging::StagingContext;

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::credentials::{self, CredentialProvider};

/// Grouping key of a context.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    /// Virtual organization.
    pub vo_name: String,
    /// Owner distinguished name.
    pub user_dn: String,
    /// Storage endpoint host.
    pub endpoint: String,
    /// Space token, staging only.
    pub space_token: Option<String>,
}

/// Storage endpoint a surl belongs to.
///
/// Falls back to the raw string when the surl cannot be parsed, so a
/// malformed URL forms its own group instead of failing the pass.
pub fn storage_endpoint(surl: &str) -> String {
    url::Url::parse(surl)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| surl.to_string())
}

/// Files sharing one owner, VO and endpoint, plus the proxy to act with.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    user_dn: String,
    vo_name: String,
    delegation_id: String,
    proxy: String,
    jobs: BTreeMap<String, BTreeMap<String, Vec<i64>>>,
    url_index: BTreeMap<String, Vec<(String, i64)>>,
}

impl JobContext {
    /// Create an empty context, resolving the proxy of the delegation.
    ///
    /// The proxy is resolved here and only here.
    pub async fn new(
        user_dn: &str,
        vo_name: &str,
        delegation_id: &str,
        provider: &dyn CredentialProvider,
    ) -> credentials::Result<Self> {
        let proxy = credentials::obtain_proxy(provider, user_dn, delegation_id, vo_name).await?;
        Ok(Self::with_proxy(user_dn, vo_name, delegation_id, proxy))
    }

    /// Create an empty context with an already resolved proxy.
    pub fn with_proxy(
        user_dn: &str,
        vo_name: &str,
        delegation_id: &str,
        proxy: impl Into<String>,
    ) -> Self {
        Self {
            user_dn: user_dn.to_string(),
            vo_name: vo_name.to_string(),
            delegation_id: delegation_id.to_string(),
            proxy: proxy.into(),
            jobs: BTreeMap::new(),
            url_index: BTreeMap::new(),
        }
    }

    /// Record that `file_id` of `job_id` waits on `surl`.
    pub fn add(&mut self, job_id: &str, file_id: i64, surl: &str) {
        self.jobs
            .entry(job_id.to_string())
            .or_default()
            .entry(surl.to_string())
            .or_default()
            .push(file_id);
        self.url_index
            .entry(surl.to_string())
            .or_default()
            .push((job_id.to_string(), file_id));
    }

    /// Deduplicated URLs, in a stable order.
    pub fn unique_urls(&self) -> Vec<String> {
        self.url_index.keys().cloned().collect()
    }

    /// Every `(job_id, file_id)` waiting on `surl`.
    pub fn ids_for_url(&self, surl: &str) -> &[(String, i64)] {
        self.url_index.get(surl).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every `(job_id, file_id)` in the context.
    pub fn all_ids(&self) -> Vec<(String, i64)> {
        self.url_index.values().flatten().cloned().collect()
    }

    /// Whether `surl` is still aggregated.
    pub fn contains_url(&self, surl: &str) -> bool {
        self.url_index.contains_key(surl)
    }

    /// Drop a URL once its outcome is final.
    pub fn remove_url(&mut self, surl: &str) {
        self.url_index.remove(surl);
        for urls in self.jobs.values_mut() {
            urls.remove(surl);
        }
        self.jobs.retain(|_, urls| !urls.is_empty());
    }

    /// Whether no URL is left.
    pub fn is_empty(&self) -> bool {
        self.url_index.is_empty()
    }

    /// Number of distinct URLs.
    pub fn url_count(&self) -> usize {
        self.url_index.len()
    }

    /// Proxy file the group acts with.
    pub fn proxy(&self) -> &str {
        &self.proxy
    }

    /// Owner distinguished name.
    pub fn user_dn(&self) -> &str {
        &self.user_dn
    }

    /// Virtual organization.
    pub fn vo_name(&self) -> &str {
        &self.vo_name
    }

    /// Delegation identifier.
    pub fn delegation_id(&self) -> &str {
        &self.delegation_id
    }

    /// `job_id file,file; job_id file` summary for logs.
    pub fn log_summary(&self) -> String {
        let mut out = String::new();
        for (job_id, urls) in &self.jobs {
            if !out.is_empty() {
                out.push_str("; ");
            }
            let _ = write!(out, "{job_id}");
            let ids: Vec<String> = urls.values().flatten().map(|f| f.to_string()).collect();
            let _ = write!(out, " {}", ids.join(","));
        }
        out
    }
}
