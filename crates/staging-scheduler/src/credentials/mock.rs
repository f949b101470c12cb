// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock credential provider for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;

/// Mock credential provider.
///
/// Every proxy is valid unless marked otherwise.
#[derive(Default)]
pub struct MockCredentialProvider {
    invalid: Mutex<HashMap<String, String>>,
    fail_generate: Mutex<Option<String>>,
    resolve_calls: AtomicUsize,
    generate_calls: AtomicUsize,
}

impl MockCredentialProvider {
    /// Create a provider where every proxy is valid.
    pub fn new() -> Self {
        Self::default()
    }

    /// Path `resolve` returns for a delegation.
    pub fn cached_path(user_dn: &str, delegation_id: &str) -> String {
        format!("/tmp/x509up_{}_{}", user_dn.replace('/', "_"), delegation_id)
    }

    /// Path `generate_fresh` returns for a delegation.
    pub fn fresh_path(user_dn: &str, delegation_id: &str) -> String {
        format!("{}.fresh", Self::cached_path(user_dn, delegation_id))
    }

    /// Report the proxy at `path` as invalid with `message`.
    pub fn invalidate(&self, path: &str, message: &str) {
        if let Ok(mut invalid) = self.invalid.lock() {
            invalid.insert(path.to_string(), message.to_string());
        }
    }

    /// Make `generate_fresh` fail.
    pub fn fail_generation(&self, message: &str) {
        if let Ok(mut fail) = self.fail_generate.lock() {
            *fail = Some(message.to_string());
        }
    }

    /// Number of `resolve` calls.
    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    /// Number of `generate_fresh` calls.
    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for MockCredentialProvider {
    async fn is_valid(&self, proxy_path: &str) -> ProxyValidity {
        let invalid = self
            .invalid
            .lock()
            .map(|m| m.get(proxy_path).cloned())
            .unwrap_or(None);
        match invalid {
            Some(message) => ProxyValidity::invalid(message),
            None => ProxyValidity::valid(),
        }
    }

    async fn resolve(&self, user_dn: &str, delegation_id: &str) -> Result<String> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::cached_path(user_dn, delegation_id))
    }

    async fn generate_fresh(
        &self,
        user_dn: &str,
        delegation_id: &str,
        _vo: &str,
    ) -> Result<String> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self.fail_generate.lock().map(|f| f.clone()).unwrap_or(None);
        if let Some(message) = failure {
            return Err(CredentialError::Other(message));
        }
        Ok(Self::fresh_path(user_dn, delegation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_obtain_proxy_reuses_valid_cache() {
        let provider = MockCredentialProvider::new();

        let path = obtain_proxy(&provider, "/CN=user", "dlg", "dteam")
            .await
            .unwrap();

        assert_eq!(path, MockCredentialProvider::cached_path("/CN=user", "dlg"));
        assert_eq!(provider.generate_calls(), 0);
    }

    #[tokio::test]
    async fn test_obtain_proxy_regenerates_invalid_cache() {
        let provider = MockCredentialProvider::new();
        provider.invalidate(
            &MockCredentialProvider::cached_path("/CN=user", "dlg"),
            "proxy expired",
        );

        let path = obtain_proxy(&provider, "/CN=user", "dlg", "dteam")
            .await
            .unwrap();

        assert_eq!(path, MockCredentialProvider::fresh_path("/CN=user", "dlg"));
        assert_eq!(provider.generate_calls(), 1);
    }
}
