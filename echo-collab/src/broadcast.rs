//! Fan-out of commit notifications to every session of a space.
//!
//! Uses tokio broadcast channels: one send reaches all subscribers, and each
//! session gets an independent receiver buffering up to `capacity`
//! notifications. A lagging receiver loses notifications, not changes: the
//! session re-reads the change log on the next wake-up anyway.
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use echo_core::{CommitNotice, SpaceId};
use tokio::sync::{broadcast, RwLock};

/// Statistics for monitoring feed health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub published: u64,
    pub subscribers: usize,
}

/// Commit feed of a single space.
pub struct ChangeFeed {
    sender: broadcast::Sender<CommitNotice>,
    capacity: usize,
    published: AtomicU64,
}

impl ChangeFeed {
    /// `capacity` bounds how many notifications a slow session may lag behind.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            published: AtomicU64::new(0),
        }
    }

    /// Publishes a commit. Returns the number of sessions that will see it.
    ///
    /// Never blocks; safe to call from inside a space callback.
    pub fn publish(&self, notice: CommitNotice) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.sender.send(notice).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CommitNotice> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            published: self.published.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

/// Maps space ids to their feeds.
pub struct FeedRegistry {
    feeds: RwLock<HashMap<SpaceId, Arc<ChangeFeed>>>,
    default_capacity: usize,
}

impl FeedRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            feeds: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the feed of a space.
    pub async fn get_or_create(&self, space: SpaceId) -> Arc<ChangeFeed> {
        // Fast path: read lock
        {
            let feeds = self.feeds.read().await;
            if let Some(feed) = feeds.get(&space) {
                return feed.clone();
            }
        }

        let mut feeds = self.feeds.write().await;
        feeds
            .entry(space)
            .or_insert_with(|| Arc::new(ChangeFeed::new(self.default_capacity)))
            .clone()
    }

    pub async fn get(&self, space: &SpaceId) -> Option<Arc<ChangeFeed>> {
        self.feeds.read().await.get(space).cloned()
    }

    pub async fn remove(&self, space: &SpaceId) -> Option<Arc<ChangeFeed>> {
        self.feeds.write().await.remove(space)
    }

    pub async fn feed_count(&self) -> usize {
        self.feeds.read().await.len()
    }

    pub async fn spaces(&self) -> Vec<SpaceId> {
        self.feeds.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echo_core::{ChangeHash, Identity};

    fn notice(space: SpaceId, seq: u64) -> CommitNotice {
        CommitNotice {
            space,
            actor: Identity::from_seed([1; 32]).actor(),
            seq,
            hash: ChangeHash([seq as u8; 32]),
            local: true,
        }
    }

    #[tokio::test]
    async fn test_feed_fan_out() {
        let feed = ChangeFeed::new(16);
        let space = SpaceId::new();
        let mut rx1 = feed.subscribe();
        let mut rx2 = feed.subscribe();
        let mut rx3 = feed.subscribe();

        assert_eq!(feed.publish(notice(space, 1)), 3);
        assert_eq!(rx1.recv().await.unwrap().seq, 1);
        assert_eq!(rx2.recv().await.unwrap().seq, 1);
        assert_eq!(rx3.recv().await.unwrap().seq, 1);
        assert_eq!(feed.stats(), FeedStats { published: 1, subscribers: 3 });
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let feed = ChangeFeed::new(4);
        assert_eq!(feed.publish(notice(SpaceId::new(), 1)), 0);
        assert_eq!(feed.stats().published, 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let feed = ChangeFeed::new(2);
        let space = SpaceId::new();
        let mut rx = feed.subscribe();
        for seq in 1..=5 {
            feed.publish(notice(space, seq));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert_eq!(rx.recv().await.unwrap().seq, 4);
    }

    #[tokio::test]
    async fn test_registry_reuses_feeds() {
        let registry = FeedRegistry::new(8);
        let space = SpaceId::new();
        let a = registry.get_or_create(space).await;
        let b = registry.get_or_create(space).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.feed_count().await, 1);
        assert_eq!(registry.spaces().await, vec![space]);

        registry.remove(&space).await;
        assert!(registry.get(&space).await.is_none());
    }
}
