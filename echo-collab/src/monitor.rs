//! Diagnostics: network data monitor and sync state board.
//!
//! Counters are plain atomics so the hot send/receive paths never take a
//! lock; readers get a consistent-enough copy through [`SyncMonitor::snapshot`].
//! The [`SyncStateBoard`] keeps the latest [`SyncSnapshot`] of every live
//! session and forwards changes to subscribers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::session::SyncSnapshot;

/// Point-in-time copy of the monitor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_failures: u64,
    pub changes_sent: u64,
    pub changes_received: u64,
    pub changes_rejected: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
}

impl MonitorStats {
    pub fn open_connections(&self) -> u64 {
        self.connections_opened.saturating_sub(self.connections_closed)
    }
}

/// Process-wide traffic counters shared by every session.
#[derive(Debug, Default)]
pub struct SyncMonitor {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    send_failures: AtomicU64,
    changes_sent: AtomicU64,
    changes_received: AtomicU64,
    changes_rejected: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
}

impl SyncMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds per-session change counts, typically the delta since the last report.
    pub fn record_changes(&self, sent: u64, received: u64, rejected: u64) {
        self.changes_sent.fetch_add(sent, Ordering::Relaxed);
        self.changes_received.fetch_add(received, Ordering::Relaxed);
        self.changes_rejected.fetch_add(rejected, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MonitorStats {
        MonitorStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            changes_sent: self.changes_sent.load(Ordering::Relaxed),
            changes_received: self.changes_received.load(Ordering::Relaxed),
            changes_rejected: self.changes_rejected.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
        }
    }
}

// ─── Sync state board ────────────────────────────────────────────────────────

/// Handle returned by [`SyncStateBoard::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateSubscription(u64);

pub type SyncStateCallback = Box<dyn Fn(&SyncSnapshot) + Send + Sync>;

/// Latest sync snapshot per session, plus listeners.
///
/// Callbacks run on the publishing task while the subscriber list is
/// locked; they must not subscribe or unsubscribe themselves.
#[derive(Default)]
pub struct SyncStateBoard {
    latest: Mutex<BTreeMap<u64, SyncSnapshot>>,
    subscribers: Mutex<Vec<(StateSubscription, SyncStateCallback)>>,
    next_subscription: AtomicU64,
}

impl SyncStateBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the snapshot of `session`; listeners hear only about changes.
    pub fn publish(&self, session: u64, snapshot: SyncSnapshot) {
        {
            let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
            if latest.get(&session) == Some(&snapshot) {
                return;
            }
            latest.insert(session, snapshot.clone());
        }
        let subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, callback) in subscribers.iter() {
            callback(&snapshot);
        }
    }

    pub fn remove(&self, session: u64) -> Option<SyncSnapshot> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session)
    }

    /// Snapshots of every live session, oldest session first.
    pub fn states(&self) -> Vec<SyncSnapshot> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn subscribe(&self, callback: SyncStateCallback) -> StateSubscription {
        let id = StateSubscription(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));
        id
    }

    pub fn unsubscribe(&self, id: StateSubscription) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(s, _)| *s != id);
        subscribers.len() != before
    }
}

impl std::fmt::Debug for SyncStateBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStateBoard")
            .field("sessions", &self.states().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use echo_core::SpaceId;
    use std::sync::Arc;
    use uuid::Uuid;

    fn snapshot(space: SpaceId, missing: u64) -> SyncSnapshot {
        SyncSnapshot {
            peer_id: Uuid::nil(),
            space,
            state: SessionState::Streaming,
            missing_on_remote: missing,
            missing_on_local: 0,
            different_documents: 1,
        }
    }

    #[test]
    fn test_counters_accumulate() {
        let monitor = SyncMonitor::new();
        monitor.record_sent(100);
        monitor.record_sent(20);
        monitor.record_received(7);
        monitor.record_send_failure();
        monitor.record_changes(3, 2, 1);

        let stats = monitor.snapshot();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.bytes_sent, 120);
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.bytes_received, 7);
        assert_eq!(stats.send_failures, 1);
        assert_eq!((stats.changes_sent, stats.changes_received, stats.changes_rejected), (3, 2, 1));
    }

    #[test]
    fn test_open_connections() {
        let monitor = SyncMonitor::new();
        monitor.connection_opened();
        monitor.connection_opened();
        monitor.connection_closed();
        assert_eq!(monitor.snapshot().open_connections(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_updates() {
        let monitor = Arc::new(SyncMonitor::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = monitor.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    m.record_sent(1);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(monitor.snapshot().messages_sent, 8000);
        assert_eq!(monitor.snapshot().bytes_sent, 8000);
    }

    #[test]
    fn test_board_notifies_only_on_change() {
        let board = SyncStateBoard::new();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        let id = board.subscribe(Box::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        let space = SpaceId::new();
        board.publish(1, snapshot(space, 3));
        board.publish(1, snapshot(space, 3));
        board.publish(1, snapshot(space, 2));
        board.publish(2, snapshot(space, 0));
        assert_eq!(seen.load(Ordering::Relaxed), 3);
        assert_eq!(board.states().len(), 2);
        assert_eq!(board.states()[0].missing_on_remote, 2);

        assert!(board.unsubscribe(id));
        assert!(!board.unsubscribe(id));
        board.remove(1);
        board.publish(2, snapshot(space, 5));
        assert_eq!(seen.load(Ordering::Relaxed), 3);
        assert_eq!(board.states().len(), 1);
    }
}
