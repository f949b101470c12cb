// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of live bring-online operations.
//!
//! Polling tasks and the cancellation fetcher both mutate this registry.
//! A URL present under a token is live. A URL that disappeared was either
//! completed by its poll task or canceled, and the owning poll task aborts it
//! on its next run.
//!
//! All state sits behind a single lock, held only for in-memory work.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Inner {
    tokens: HashMap<String, HashSet<String>>,
    // refcounted, two groups may stage the same surl before a token exists
    pending: HashMap<String, usize>,
}

/// What a poll task should do with its URLs before polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelCheck {
    /// Every URL is still live.
    Active,
    /// These URLs were canceled, the rest are live.
    Partial(Vec<String>),
    /// The whole token was canceled.
    Canceled,
}

/// Process-wide set of live tokens and URLs.
#[derive(Debug, Default)]
pub struct ActiveTokenRegistry {
    inner: Mutex<Inner>,
}

impl ActiveTokenRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register URLs whose bring-online has not produced a token yet.
    pub fn register_pending(&self, surls: &[String]) {
        let mut inner = self.lock();
        for surl in surls {
            *inner.pending.entry(surl.clone()).or_default() += 1;
        }
    }

    /// Release URLs registered with [`register_pending`](Self::register_pending).
    pub fn release_pending(&self, surls: &[String]) {
        let mut inner = self.lock();
        for surl in surls {
            if let Some(count) = inner.pending.get_mut(surl) {
                *count -= 1;
                if *count == 0 {
                    inner.pending.remove(surl);
                }
            }
        }
    }

    /// Move pending URLs under a freshly issued token.
    ///
    /// URLs canceled while the bring-online was in flight are left out, so the
    /// first poll of the token aborts them.
    pub fn promote(&self, token: &str, surls: &[String]) {
        let mut inner = self.lock();
        let mut live = HashSet::new();
        for surl in surls {
            if let Some(count) = inner.pending.get_mut(surl) {
                *count -= 1;
                if *count == 0 {
                    inner.pending.remove(surl);
                }
                live.insert(surl.clone());
            }
        }
        if !live.is_empty() {
            inner
                .tokens
                .entry(token.to_string())
                .or_default()
                .extend(live);
        }
    }

    /// Register every URL under `token`.
    pub fn register_token(&self, token: &str, surls: &[String]) {
        self.lock()
            .tokens
            .entry(token.to_string())
            .or_default()
            .extend(surls.iter().cloned());
    }

    /// Compare a poll task's URLs with what is still registered.
    pub fn check(&self, token: &str, surls: &[String]) -> CancelCheck {
        let inner = self.lock();
        let Some(live) = inner.tokens.get(token) else {
            return CancelCheck::Canceled;
        };
        let missing: Vec<String> = surls
            .iter()
            .filter(|s| !live.contains(*s))
            .cloned()
            .collect();
        if missing.is_empty() {
            CancelCheck::Active
        } else {
            CancelCheck::Partial(missing)
        }
    }

    /// Drop URLs that reached a final state. An emptied token is removed.
    pub fn remove_urls(&self, token: &str, surls: &[String]) {
        let mut inner = self.lock();
        if let Some(live) = inner.tokens.get_mut(token) {
            for surl in surls {
                live.remove(surl);
            }
            if live.is_empty() {
                inner.tokens.remove(token);
            }
        }
    }

    /// Forget a token entirely.
    pub fn remove_token(&self, token: &str) {
        self.lock().tokens.remove(token);
    }

    /// Apply a batch of cancellations grouped by token.
    ///
    /// `None` groups URLs whose bring-online had no token yet. A URL grouped
    /// under a token that is not registered yet is dropped from the pending
    /// set, so the later [`promote`](Self::promote) leaves it out. Returns the
    /// number of URLs that were live and are now canceled.
    pub fn cancel(&self, groups: &HashMap<Option<String>, Vec<String>>) -> usize {
        let mut inner = self.lock();
        let mut removed = 0;
        for (token, surls) in groups {
            match token {
                Some(token) => {
                    for surl in surls {
                        let was_live = inner
                            .tokens
                            .get_mut(token)
                            .is_some_and(|live| live.remove(surl));
                        // token already stored but not promoted yet
                        if was_live || inner.pending.remove(surl).is_some() {
                            removed += 1;
                        }
                    }
                    if inner.tokens.get(token).is_some_and(|live| live.is_empty()) {
                        inner.tokens.remove(token);
                    }
                }
                None => {
                    for surl in surls {
                        if inner.pending.remove(surl).is_some() {
                            removed += 1;
                        }
                    }
                }
            }
        }
        removed
    }

    /// Whether `surl` is live under `token`.
    pub fn contains(&self, token: &str, surl: &str) -> bool {
        self.lock()
            .tokens
            .get(token)
            .is_some_and(|live| live.contains(surl))
    }

    /// Whether `surl` is waiting for a token.
    pub fn is_pending(&self, surl: &str) -> bool {
        self.lock().pending.contains_key(surl)
    }

    /// Live URLs under `token`, sorted. `None` if the token is unknown.
    pub fn urls(&self, token: &str) -> Option<BTreeSet<String>> {
        self.lock()
            .tokens
            .get(token)
            .map(|live| live.iter().cloned().collect())
    }

    /// Number of live tokens.
    pub fn token_count(&self) -> usize {
        self.lock().tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_check_active_partial_canceled() {
        let registry = ActiveTokenRegistry::new();
        registry.register_token("tok", &urls(&["a", "b", "c"]));

        assert_eq!(registry.check("tok", &urls(&["a", "b"])), CancelCheck::Active);

        let mut groups = HashMap::new();
        groups.insert(Some("tok".to_string()), urls(&["b"]));
        assert_eq!(registry.cancel(&groups), 1);
        assert_eq!(
            registry.check("tok", &urls(&["a", "b", "c"])),
            CancelCheck::Partial(urls(&["b"]))
        );

        groups.insert(Some("tok".to_string()), urls(&["a", "c"]));
        assert_eq!(registry.cancel(&groups), 2);
        assert_eq!(registry.check("tok", &urls(&["a"])), CancelCheck::Canceled);
        assert_eq!(registry.token_count(), 0);
    }

    #[test]
    fn test_pending_is_refcounted() {
        let registry = ActiveTokenRegistry::new();
        registry.register_pending(&urls(&["a"]));
        registry.register_pending(&urls(&["a"]));

        registry.release_pending(&urls(&["a"]));
        assert!(registry.is_pending("a"));

        registry.release_pending(&urls(&["a"]));
        assert!(!registry.is_pending("a"));
    }

    #[test]
    fn test_promote_skips_canceled_pending() {
        let registry = ActiveTokenRegistry::new();
        registry.register_pending(&urls(&["a", "b"]));

        let mut groups = HashMap::new();
        groups.insert(None, urls(&["b"]));
        assert_eq!(registry.cancel(&groups), 1);

        registry.promote("tok", &urls(&["a", "b"]));

        assert!(registry.contains("tok", "a"));
        assert!(!registry.contains("tok", "b"));
        assert!(!registry.is_pending("a"));
    }

    #[test]
    fn test_cancel_with_token_before_promote() {
        let registry = ActiveTokenRegistry::new();
        registry.register_pending(&urls(&["a", "b"]));

        let mut groups = HashMap::new();
        groups.insert(Some("tok-1".to_string()), urls(&["a"]));
        assert_eq!(registry.cancel(&groups), 1);
        assert!(!registry.is_pending("a"));

        registry.promote("tok-1", &urls(&["a", "b"]));

        assert!(!registry.contains("tok-1", "a"));
        assert!(registry.contains("tok-1", "b"));
        assert_eq!(
            registry.check("tok-1", &urls(&["a", "b"])),
            CancelCheck::Partial(urls(&["a"]))
        );
    }

    #[test]
    fn test_remove_urls_drops_empty_token() {
        let registry = ActiveTokenRegistry::new();
        registry.register_token("tok", &urls(&["a", "b"]));

        registry.remove_urls("tok", &urls(&["a"]));
        assert_eq!(
            registry.urls("tok"),
            Some(BTreeSet::from(["b".to_string()]))
        );

        registry.remove_urls("tok", &urls(&["b"]));
        assert_eq!(registry.urls("tok"), None);
    }
}
