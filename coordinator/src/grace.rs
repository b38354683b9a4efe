//! The loading-grace protocol (spec.md §4.H).
//!
//! Disconnect handlers are destructive by default; a client blocked on a
//! heavy client-side init (WASM compile) can miss enough heartbeats to get
//! disconnected mid-initialization. This tracker lets the disconnect path
//! recognize "still loading" and swallow the disconnect instead of tearing
//! the session down.

use chrono::{DateTime, Utc};
use protocol::SubjectId;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct GraceTracker {
    loading: RwLock<HashMap<SubjectId, DateTime<Utc>>>,
}

impl GraceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start_loading(&self, subject: SubjectId) {
        self.loading.write().await.insert(subject, Utc::now());
    }

    /// Removes the grace entry and logs how long it lasted, if one existed.
    pub async fn complete_loading(&self, subject: &SubjectId) {
        if let Some(started) = self.loading.write().await.remove(subject) {
            let elapsed = Utc::now() - started;
            tracing::info!(subject = %subject, elapsed_ms = elapsed.num_milliseconds(), "loading grace completed");
        }
    }

    /// The disconnect handler MUST call this before any other cleanup
    /// (§4.H). Entries older than `timeout` are treated as expired, not in
    /// grace — they are the safety-timeout fallback, swept out separately.
    pub async fn is_in_grace(&self, subject: &SubjectId, timeout: chrono::Duration) -> bool {
        match self.loading.read().await.get(subject) {
            Some(started) => Utc::now() - *started < timeout,
            None => false,
        }
    }

    /// Safety-timeout sweep: entries older than `timeout` are ignored and
    /// removed (§4.H).
    pub async fn sweep_expired(&self, timeout: chrono::Duration) {
        let now = Utc::now();
        let mut loading = self.loading.write().await;
        let before = loading.len();
        loading.retain(|_, started| now - *started < timeout);
        let swept = before - loading.len();
        if swept > 0 {
            tracing::info!(count = swept, "swept expired loading-grace entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_entry_is_in_grace() {
        let tracker = GraceTracker::new();
        let subject = SubjectId::from("a");
        tracker.start_loading(subject.clone()).await;
        assert!(tracker.is_in_grace(&subject, chrono::Duration::seconds(60)).await);
    }

    #[tokio::test]
    async fn completing_removes_the_entry() {
        let tracker = GraceTracker::new();
        let subject = SubjectId::from("a");
        tracker.start_loading(subject.clone()).await;
        tracker.complete_loading(&subject).await;
        assert!(!tracker.is_in_grace(&subject, chrono::Duration::seconds(60)).await);
    }

    #[tokio::test]
    async fn no_entry_means_not_in_grace() {
        let tracker = GraceTracker::new();
        assert!(!tracker.is_in_grace(&SubjectId::from("a"), chrono::Duration::seconds(60)).await);
    }
}
