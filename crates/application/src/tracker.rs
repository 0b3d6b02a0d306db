//! Run tracking for provisioning workflows.
//!
//! Provides cancellation token management and the at-most-one-run guard.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Tracks active runs with cancellation support.
#[derive(Debug, Default)]
pub struct DownloadTracker {
    tokens: RwLock<HashMap<String, CancellationToken>>,
}

impl DownloadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a run is in progress.
    pub async fn has(&self, name: &str) -> bool {
        self.tokens.read().await.contains_key(name)
    }

    /// Register a new run and return its cancellation token, or `None` when
    /// a run with the same name is already active. Check and insert happen
    /// under one write lock, so two concurrent callers cannot both win.
    pub async fn try_start(&self, name: String) -> Option<CancellationToken> {
        let mut tokens = self.tokens.write().await;
        if tokens.contains_key(&name) {
            return None;
        }
        let token = CancellationToken::new();
        tokens.insert(name, token.clone());
        Some(token)
    }

    /// Cancel a run if it exists.
    ///
    /// Returns true if the run was found and cancelled.
    pub async fn cancel(&self, name: &str) -> bool {
        let tokens = self.tokens.read().await;
        if let Some(token) = tokens.get(name) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Mark a run as finished (removes the token).
    pub async fn finish(&self, name: &str) {
        let mut tokens = self.tokens.write().await;
        tokens.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_has_returns_false_initially() {
        let tracker = DownloadTracker::new();
        assert!(!tracker.has("phi-3-mini").await);
    }

    #[tokio::test]
    async fn test_try_start_registers_run() {
        let tracker = DownloadTracker::new();
        let token = tracker.try_start("phi-3-mini".to_string()).await;
        assert!(token.is_some());
        assert!(tracker.has("phi-3-mini").await);
    }

    #[tokio::test]
    async fn test_try_start_rejects_duplicate() {
        let tracker = DownloadTracker::new();
        let first = tracker.try_start("phi-3-mini".to_string()).await;
        assert!(first.is_some());

        let second = tracker.try_start("phi-3-mini".to_string()).await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_finish_allows_restart() {
        let tracker = DownloadTracker::new();
        let _token = tracker.try_start("phi-3-mini".to_string()).await;
        tracker.finish("phi-3-mini").await;
        assert!(!tracker.has("phi-3-mini").await);

        let again = tracker.try_start("phi-3-mini".to_string()).await;
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn test_cancel_returns_true_for_active_run() {
        let tracker = DownloadTracker::new();
        let token = tracker.try_start("phi-3-mini".to_string()).await.unwrap();
        assert!(!token.is_cancelled());

        let cancelled = tracker.cancel("phi-3-mini").await;
        assert!(cancelled);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_returns_false_for_unknown_run() {
        let tracker = DownloadTracker::new();
        let cancelled = tracker.cancel("unknown-model").await;
        assert!(!cancelled);
    }
}
