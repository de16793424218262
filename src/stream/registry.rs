//! Desired subscription set, independent of connection state.
//!
//! Supervisors restore the registry's contents after every reconnect, in
//! insertion order, so restoration is deterministic. Watching the version
//! lets a connected supervisor pick up additions and removals live.

use tokio::sync::{watch, RwLock};
use tracing::debug;

use crate::domain::Subscription;

/// The set of streaming channels the engine wants, from the moment each is
/// requested until it is explicitly removed.
pub struct SubscriptionRegistry {
    entries: RwLock<Vec<Subscription>>,
    version: watch::Sender<u64>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            entries: RwLock::new(Vec::new()),
            version,
        }
    }

    /// Add a subscription. Returns false if it was already present.
    pub async fn add(&self, subscription: Subscription) -> bool {
        let mut entries = self.entries.write().await;
        if entries.contains(&subscription) {
            return false;
        }
        debug!(%subscription, "subscription added");
        entries.push(subscription);
        self.bump();
        true
    }

    /// Remove a subscription. Returns false if it was not present.
    pub async fn remove(&self, subscription: &Subscription) -> bool {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|s| s != subscription);
        let removed = entries.len() != before;
        if removed {
            debug!(%subscription, "subscription removed");
            self.bump();
        }
        removed
    }

    /// Current contents in insertion order.
    pub async fn snapshot(&self) -> Vec<Subscription> {
        self.entries.read().await.clone()
    }

    pub async fn contains(&self, subscription: &Subscription) -> bool {
        self.entries.read().await.contains(subscription)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Receiver that observes a version bump on every change.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StreamChannel;

    #[tokio::test]
    async fn test_add_deduplicates() {
        let registry = SubscriptionRegistry::new();
        let sub = Subscription::new(StreamChannel::Trades, "ENAUSDT");

        assert!(registry.add(sub.clone()).await);
        assert!(!registry.add(sub.clone()).await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_preserves_insertion_order() {
        let registry = SubscriptionRegistry::new();
        let subs = vec![
            Subscription::new(StreamChannel::OrderBook, "ENAUSDT"),
            Subscription::new(StreamChannel::Trades, "SOLUSDT"),
            Subscription::new(StreamChannel::Funding, "ENAUSDT"),
        ];
        for sub in &subs {
            registry.add(sub.clone()).await;
        }
        assert_eq!(registry.snapshot().await, subs);
    }

    #[tokio::test]
    async fn test_remove_and_version() {
        let registry = SubscriptionRegistry::new();
        let mut version = registry.watch();
        let sub = Subscription::new(StreamChannel::Funding, "ENAUSDT");

        registry.add(sub.clone()).await;
        assert!(version.has_changed().unwrap());
        version.mark_unchanged();

        assert!(registry.remove(&sub).await);
        assert!(version.has_changed().unwrap());
        assert!(!registry.remove(&sub).await);
        assert!(registry.is_empty().await);
    }
}
