// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delegated proxy resolution and validity checks.

pub mod file;
pub mod mock;

pub use file::FileCredentialProvider;
pub use mock::MockCredentialProvider;

use async_trait::async_trait;
use thiserror::Error;

/// Credential errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CredentialError {
    /// No delegated proxy exists for the user.
    #[error("No delegated credential for {user_dn} ({delegation_id})")]
    NotFound {
        /// Owner distinguished name.
        user_dn: String,
        /// Delegation identifier.
        delegation_id: String,
    },

    /// The delegated proxy is already expired.
    #[error("Delegated credential for {user_dn} ({delegation_id}) has expired")]
    Expired {
        /// Owner distinguished name.
        user_dn: String,
        /// Delegation identifier.
        delegation_id: String,
    },

    /// Looking up the delegation failed.
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// Writing the proxy file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type for credential operations.
pub type Result<T> = std::result::Result<T, CredentialError>;

/// Outcome of a validity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyValidity {
    /// Whether the proxy can be used.
    pub valid: bool,
    /// Why it cannot, empty when valid.
    pub message: String,
}

impl ProxyValidity {
    /// A usable proxy.
    pub fn valid() -> Self {
        Self {
            valid: true,
            message: String::new(),
        }
    }

    /// An unusable proxy.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: message.into(),
        }
    }
}

/// Source of proxy files for a user delegation.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Check whether the proxy at `proxy_path` can still be used.
    async fn is_valid(&self, proxy_path: &str) -> ProxyValidity;

    /// Path of the cached proxy for a delegation. The file may not exist.
    async fn resolve(&self, user_dn: &str, delegation_id: &str) -> Result<String>;

    /// Materialize a fresh proxy for a delegation and return its path.
    async fn generate_fresh(&self, user_dn: &str, delegation_id: &str, vo: &str)
    -> Result<String>;
}

/// Resolve a usable proxy for a delegation, regenerating it when the cache is stale.
pub async fn obtain_proxy(
    provider: &dyn CredentialProvider,
    user_dn: &str,
    delegation_id: &str,
    vo: &str,
) -> Result<String> {
    let cached = provider.resolve(user_dn, delegation_id).await?;
    if provider.is_valid(&cached).await.valid {
        return Ok(cached);
    }
    provider.generate_fresh(user_dn, delegation_id, vo).await
}
