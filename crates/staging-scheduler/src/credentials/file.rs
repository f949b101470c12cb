// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Proxy files materialized from the delegation table.
//!
//! Proxies are written to `<proxy_dir>/x509up_h<sha256(dn, delegation)>`
//! with mode `0600`. The expiry of every proxy written by this process is
//! remembered. A proxy file found on disk without a remembered expiry (left
//! over from a previous run) is reported invalid, which forces regeneration.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{CredentialError, CredentialProvider, ProxyValidity, Result};
use crate::store::JobStateStore;

/// Credential provider backed by the delegation table and the local filesystem.
pub struct FileCredentialProvider {
    store: Arc<dyn JobStateStore>,
    proxy_dir: PathBuf,
    min_validity: Duration,
    expiries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl FileCredentialProvider {
    /// Create a provider writing proxies under `proxy_dir`.
    pub fn new(
        store: Arc<dyn JobStateStore>,
        proxy_dir: impl Into<PathBuf>,
        min_validity: Duration,
    ) -> Self {
        Self {
            store,
            proxy_dir: proxy_dir.into(),
            min_validity,
            expiries: Mutex::new(HashMap::new()),
        }
    }

    /// Path of the proxy for a delegation.
    pub fn proxy_path(&self, user_dn: &str, delegation_id: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(user_dn.as_bytes());
        hasher.update([0u8]);
        hasher.update(delegation_id.as_bytes());
        self.proxy_dir
            .join(format!("x509up_h{:x}", hasher.finalize()))
    }

    fn remembered_expiry(&self, proxy_path: &str) -> Option<DateTime<Utc>> {
        self.expiries
            .lock()
            .ok()
            .and_then(|m| m.get(proxy_path).copied())
    }

    fn remember_expiry(&self, proxy_path: &str, expiry: DateTime<Utc>) {
        if let Ok(mut m) = self.expiries.lock() {
            m.insert(proxy_path.to_string(), expiry);
        }
    }
}

#[async_trait]
impl CredentialProvider for FileCredentialProvider {
    async fn is_valid(&self, proxy_path: &str) -> ProxyValidity {
        let metadata = match tokio::fs::metadata(proxy_path).await {
            Ok(m) => m,
            Err(e) => return ProxyValidity::invalid(format!("proxy not readable: {e}")),
        };

        if metadata.uid() != nix::unistd::getuid().as_raw() {
            return ProxyValidity::invalid("proxy is not owned by the service user");
        }

        let Some(expiry) = self.remembered_expiry(proxy_path) else {
            return ProxyValidity::invalid("proxy lifetime unknown");
        };

        let remaining = expiry - Utc::now();
        let min = chrono::Duration::from_std(self.min_validity).unwrap_or(chrono::Duration::zero());
        if remaining <= chrono::Duration::zero() {
            return ProxyValidity::invalid(format!("proxy expired at {expiry}"));
        }
        if remaining < min {
            return ProxyValidity::invalid(format!(
                "proxy expired soon: {} seconds left",
                remaining.num_seconds()
            ));
        }
        ProxyValidity::valid()
    }

    async fn resolve(&self, user_dn: &str, delegation_id: &str) -> Result<String> {
        Ok(self
            .proxy_path(user_dn, delegation_id)
            .to_string_lossy()
            .into_owned())
    }

    async fn generate_fresh(
        &self,
        user_dn: &str,
        delegation_id: &str,
        vo: &str,
    ) -> Result<String> {
        let credential = self
            .store
            .get_delegated_credential(user_dn, delegation_id)
            .await?
            .ok_or_else(|| CredentialError::NotFound {
                user_dn: user_dn.to_string(),
                delegation_id: delegation_id.to_string(),
            })?;

        if credential.termination_time <= Utc::now() {
            return Err(CredentialError::Expired {
                user_dn: user_dn.to_string(),
                delegation_id: delegation_id.to_string(),
            });
        }

        let path = self.proxy_path(user_dn, delegation_id);
        let tmp = path.with_extension(format!("tmp{}", uuid::Uuid::new_v4().simple()));

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&tmp)
            .await?;
        file.write_all(credential.proxy.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        let path = path.to_string_lossy().into_owned();
        self.remember_expiry(&path, credential.termination_time);

        info!(
            user_dn = %user_dn,
            delegation_id = %delegation_id,
            vo = %vo,
            expires = %credential.termination_time,
            "Generated proxy"
        );
        debug!(path = %path, "Proxy written");

        Ok(path)
    }
}
