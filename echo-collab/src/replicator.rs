//! Replicator: owns the replicated spaces of this process and one sync
//! session per connected peer per space.
//!
//! ```text
//!                     ┌──────────────────── Replicator ───────────────────┐
//!  local writes ──►   │  spaces: SpaceId ─► Arc<Mutex<Space>>             │
//!                     │        │ commit callback                          │
//!                     │        ▼                                          │
//!                     │  FeedRegistry ─► broadcast ─┬─► session task 1 ◄──┼──► peer A
//!                     │                             └─► session task 2 ◄──┼──► peer B
//!                     │  SyncStateBoard ◄── snapshots ──────┘             │
//!                     └───────────────────────────────────────────────────┘
//! ```
//!
//! Sessions are independent tasks; a failing peer only ends its own task.
//! Reconnection is the caller's business ([`crate::client::SyncClient`]
//! does it with [`Backoff`]).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use echo_core::{Space, SpaceId, SubscriptionId};
use rand::Rng;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::FeedRegistry;
use crate::monitor::{StateSubscription, SyncMonitor, SyncStateBoard, SyncStateCallback};
use crate::peer::{run_session, PeerContext, SharedSpace};
use crate::session::{SyncConfig, SyncSession, SyncSnapshot};
use crate::transport::PeerChannel;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Reconnect delays.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    /// Upper bound of the random delay added to every attempt
    pub jitter: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(5),
            jitter: Duration::from_millis(250),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    pub fn for_testing() -> Self {
        Self {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(200),
            jitter: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt; grows until `max`, then stays there.
    pub fn next_delay(&mut self) -> Duration {
        let factor = self.config.multiplier.max(1.0).powi(self.attempt.min(32) as i32);
        let scaled = (self.config.initial.as_millis() as f64 * factor).round();
        let base = Duration::from_millis(scaled.min(u64::MAX as f64) as u64).min(self.config.max);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_ms = self.config.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Call after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    pub sync: SyncConfig,
    pub backoff: BackoffConfig,
    /// Outgoing/incoming frame queue per connection
    pub channel_capacity: usize,
    /// Commit notifications a session may lag behind
    pub feed_capacity: usize,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            backoff: BackoffConfig::default(),
            channel_capacity: 256,
            feed_capacity: 1024,
        }
    }
}

impl ReplicatorConfig {
    pub fn for_testing() -> Self {
        Self {
            sync: SyncConfig::for_testing(),
            backoff: BackoffConfig::for_testing(),
            channel_capacity: 64,
            feed_capacity: 64,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplicatorError {
    #[error("space {0} is not replicated here")]
    UnknownSpace(SpaceId),
    #[error("space {0} is already replicated")]
    SpaceExists(SpaceId),
    #[error("replicator is shut down")]
    ShutDown,
}

// ─── Sessions ────────────────────────────────────────────────────────────────

/// Caller-side handle of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u64,
    space: SpaceId,
    connection: Uuid,
    closed: watch::Receiver<bool>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// Id of the [`PeerChannel`] the session runs on.
    pub fn connection(&self) -> Uuid {
        self.connection
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the session task has finished.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        // An error means the sender is gone, which also means finished.
        let _ = closed.wait_for(|done| *done).await;
    }
}

struct SpaceEntry {
    space: SharedSpace,
    subscription: SubscriptionId,
}

struct SessionEntry {
    space: SpaceId,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

// ─── Replicator ──────────────────────────────────────────────────────────────

pub struct Replicator {
    peer_id: Uuid,
    config: ReplicatorConfig,
    spaces: RwLock<HashMap<SpaceId, SpaceEntry>>,
    feeds: FeedRegistry,
    sessions: Arc<Mutex<HashMap<u64, SessionEntry>>>,
    board: Arc<SyncStateBoard>,
    monitor: Arc<SyncMonitor>,
    next_session: AtomicU64,
    shut_down: AtomicBool,
}

impl Replicator {
    pub fn new(config: ReplicatorConfig) -> Self {
        let feeds = FeedRegistry::new(config.feed_capacity);
        Self {
            peer_id: Uuid::new_v4(),
            config,
            spaces: RwLock::new(HashMap::new()),
            feeds,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            board: Arc::new(SyncStateBoard::new()),
            monitor: Arc::new(SyncMonitor::new()),
            next_session: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Identifies this process on the wire.
    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    /// Starts replicating `space`. Every later commit wakes its sessions.
    pub async fn add_space(&self, mut space: Space) -> Result<SharedSpace, ReplicatorError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ReplicatorError::ShutDown);
        }
        let id = space.id();
        let mut spaces = self.spaces.write().await;
        if spaces.contains_key(&id) {
            return Err(ReplicatorError::SpaceExists(id));
        }

        let feed = self.feeds.get_or_create(id).await;
        let subscription = space.subscribe_commits(move |notice| {
            feed.publish(*notice);
        });
        let shared = Arc::new(Mutex::new(space));
        spaces.insert(
            id,
            SpaceEntry {
                space: shared.clone(),
                subscription,
            },
        );
        log::info!("Replicating space {id}");
        Ok(shared)
    }

    pub async fn space(&self, id: &SpaceId) -> Option<SharedSpace> {
        self.spaces.read().await.get(id).map(|entry| entry.space.clone())
    }

    pub async fn spaces(&self) -> Vec<SpaceId> {
        self.spaces.read().await.keys().copied().collect()
    }

    /// Stops replicating `id`, ending its sessions. The space itself is
    /// handed back to whoever still holds it.
    pub async fn remove_space(&self, id: &SpaceId) -> Result<SharedSpace, ReplicatorError> {
        let entry = self
            .spaces
            .write()
            .await
            .remove(id)
            .ok_or(ReplicatorError::UnknownSpace(*id))?;

        let ended: Vec<SessionEntry> = {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<u64> = sessions
                .iter()
                .filter(|(_, s)| s.space == *id)
                .map(|(sid, _)| *sid)
                .collect();
            ids.into_iter().filter_map(|sid| sessions.remove(&sid)).collect()
        };
        for session in ended {
            stop_session(session).await;
        }

        entry.space.lock().await.unsubscribe(entry.subscription);
        self.feeds.remove(id).await;
        log::info!("Stopped replicating space {id}");
        Ok(entry.space)
    }

    /// Starts a sync session for `space` over `channel`.
    pub async fn on_peer_connected(
        &self,
        space: SpaceId,
        channel: PeerChannel,
    ) -> Result<SessionHandle, ReplicatorError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ReplicatorError::ShutDown);
        }
        let shared = self.space(&space).await.ok_or(ReplicatorError::UnknownSpace(space))?;
        let feed = self
            .feeds
            .get(&space)
            .await
            .ok_or(ReplicatorError::UnknownSpace(space))?;

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let connection = channel.id();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);

        let ctx = PeerContext {
            session_id: id,
            space: shared,
            channel,
            // Subscribe before the session starts so no commit slips between
            // its first announcement and its first wake-up.
            feed: feed.subscribe(),
            monitor: self.monitor.clone(),
            board: self.board.clone(),
            cancel: cancel_rx,
        };
        let session = SyncSession::new(self.peer_id, space, self.config.sync.clone());

        // Holding the map lock while spawning keeps the task from removing
        // its entry before it was inserted.
        let mut sessions = self.sessions.lock().await;
        let registry = self.sessions.clone();
        let task = tokio::spawn(async move {
            let _ = run_session(session, ctx).await;
            registry.lock().await.remove(&id);
            let _ = closed_tx.send(true);
        });
        sessions.insert(
            id,
            SessionEntry {
                space,
                cancel: cancel_tx,
                task,
            },
        );
        log::info!("Session {id} started for space {space} on connection {connection}");

        Ok(SessionHandle {
            id,
            space,
            connection,
            closed: closed_rx,
        })
    }

    /// Ends a session. Its ephemeral sync state is discarded.
    pub async fn on_peer_disconnected(&self, handle: &SessionHandle) {
        let entry = self.sessions.lock().await.remove(&handle.id);
        match entry {
            Some(entry) => stop_session(entry).await,
            None => log::debug!("Session {} already ended", handle.id),
        }
        self.board.remove(handle.id);
    }

    /// Latest snapshot of every live session.
    pub fn sync_states(&self) -> Vec<SyncSnapshot> {
        self.board.states()
    }

    /// Registers a listener for sync state changes of any session.
    pub fn subscribe_sync_state(&self, callback: SyncStateCallback) -> StateSubscription {
        self.board.subscribe(callback)
    }

    pub fn unsubscribe_sync_state(&self, id: StateSubscription) -> bool {
        self.board.unsubscribe(id)
    }

    pub fn monitor(&self) -> &SyncMonitor {
        &self.monitor
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Ends every session and refuses new ones. Spaces stay readable.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let ended: Vec<SessionEntry> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        let count = ended.len();
        for session in ended {
            stop_session(session).await;
        }
        log::info!("Replicator {} shut down, {count} sessions ended", self.peer_id);
    }
}

async fn stop_session(entry: SessionEntry) {
    let _ = entry.cancel.send(true);
    if let Err(e) = entry.task.await {
        log::warn!("Session task for space {} failed: {e}", entry.space);
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("peer_id", &self.peer_id)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echo_core::{Identity, SpaceBuilder};

    fn space(n: u8) -> Space {
        SpaceBuilder::new(Identity::from_seed([n; 32])).create().unwrap()
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
            jitter: Duration::ZERO,
            multiplier: 2.0,
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.attempt(), 4);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_jitter_is_bounded() {
        let config = BackoffConfig::default();
        let mut backoff = Backoff::new(config.clone());
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= config.initial);
            assert!(delay <= config.max + config.jitter);
        }
    }

    #[tokio::test]
    async fn test_add_and_remove_space() {
        let replicator = Replicator::new(ReplicatorConfig::for_testing());
        let s = space(1);
        let id = s.id();
        replicator.add_space(s).await.unwrap();
        assert_eq!(replicator.spaces().await, vec![id]);

        let again = SpaceBuilder::new(Identity::from_seed([1; 32])).join(id, Identity::from_seed([1; 32]).actor());
        assert_eq!(
            replicator.add_space(again.unwrap()).await.err(),
            Some(ReplicatorError::SpaceExists(id))
        );

        replicator.remove_space(&id).await.unwrap();
        assert!(replicator.space(&id).await.is_none());
        assert_eq!(
            replicator.remove_space(&id).await.err(),
            Some(ReplicatorError::UnknownSpace(id))
        );
    }

    #[tokio::test]
    async fn test_unknown_space_refused() {
        let replicator = Replicator::new(ReplicatorConfig::for_testing());
        let (channel, _other) = PeerChannel::pair(4);
        let missing = SpaceId::new();
        assert_eq!(
            replicator.on_peer_connected(missing, channel).await.err(),
            Some(ReplicatorError::UnknownSpace(missing))
        );
    }

    #[tokio::test]
    async fn test_disconnect_ends_session() {
        let replicator = Replicator::new(ReplicatorConfig::for_testing());
        let s = space(1);
        let id = s.id();
        replicator.add_space(s).await.unwrap();

        let (channel, _other) = PeerChannel::pair(16);
        let handle = replicator.on_peer_connected(id, channel).await.unwrap();
        assert_eq!(handle.space(), id);
        assert_eq!(replicator.session_count().await, 1);

        replicator.on_peer_disconnected(&handle).await;
        handle.closed().await;
        assert!(handle.is_closed());
        assert_eq!(replicator.session_count().await, 0);
        assert!(replicator.sync_states().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_sessions() {
        let replicator = Replicator::new(ReplicatorConfig::for_testing());
        let s = space(1);
        let id = s.id();
        replicator.add_space(s).await.unwrap();
        let (channel, _other) = PeerChannel::pair(16);
        let handle = replicator.on_peer_connected(id, channel).await.unwrap();

        replicator.shutdown().await;
        handle.closed().await;
        assert_eq!(replicator.session_count().await, 0);

        let (channel, _other) = PeerChannel::pair(16);
        assert_eq!(
            replicator.on_peer_connected(id, channel).await.err(),
            Some(ReplicatorError::ShutDown)
        );
        assert!(replicator.space(&id).await.is_some());
    }
}
