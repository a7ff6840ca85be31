//! Async driver for one [`SyncSession`].
//!
//! ```text
//!   PeerChannel.recv ──┐
//!   ChangeFeed.recv ───┼──► select! ──► lock Space ──► SyncSession ──► PeerChannel.send
//!   interval.tick ─────┤
//!   cancel.changed ────┘
//! ```
//!
//! The space lock is held only while the session computes; encoding and
//! sending happen after it is released, so a slow peer never blocks local
//! writers or other sessions of the same space.

use std::sync::Arc;
use std::time::Instant;

use echo_core::{CommitNotice, Space};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::MissedTickBehavior;

use crate::monitor::{SyncMonitor, SyncStateBoard};
use crate::protocol::SyncMessage;
use crate::session::{SessionError, SessionState, SessionStats, SyncSession};
use crate::transport::PeerChannel;

/// A space shared between local writers and its sync sessions.
pub type SharedSpace = Arc<Mutex<Space>>;

/// Everything a session task needs besides the session itself.
pub struct PeerContext {
    pub session_id: u64,
    pub space: SharedSpace,
    pub channel: PeerChannel,
    pub feed: broadcast::Receiver<CommitNotice>,
    pub monitor: Arc<SyncMonitor>,
    pub board: Arc<SyncStateBoard>,
    /// Flips to `true` when the session should stop.
    pub cancel: watch::Receiver<bool>,
}

/// Runs a session until the peer disconnects, the session is refused or
/// cancelled, or a fatal error occurs. The session always ends `Closed`.
pub async fn run_session(mut session: SyncSession, mut ctx: PeerContext) -> Result<SessionStats, SessionError> {
    ctx.monitor.connection_opened();
    let result = drive(&mut session, &mut ctx).await;

    session.close();
    ctx.monitor.connection_closed();
    ctx.board.remove(ctx.session_id);
    let stats = session.stats();
    match result {
        Ok(()) => {
            log::info!(
                "Session {} on space {} ended: {} changes sent, {} received",
                ctx.session_id,
                session.space_id(),
                stats.changes_sent,
                stats.changes_received
            );
            Ok(stats)
        }
        Err(e) => {
            log::warn!("Session {} on space {} failed: {e}", ctx.session_id, session.space_id());
            Err(e)
        }
    }
}

async fn drive(session: &mut SyncSession, ctx: &mut PeerContext) -> Result<(), SessionError> {
    let out = {
        let space = ctx.space.lock().await;
        session.start(&space, Instant::now())?
    };
    send_all(&ctx.channel, &ctx.monitor, out).await?;

    let mut ticker = tokio::time::interval(session.config().tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reported = SessionStats::default();

    loop {
        let out = tokio::select! {
            frame = ctx.channel.recv() => {
                let Some(frame) = frame else {
                    log::info!("Peer {:?} disconnected from space {}", session.remote_peer(), session.space_id());
                    return Ok(());
                };
                ctx.monitor.record_received(frame.len());
                let msg = match SyncMessage::decode(&frame) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("Dropping malformed frame on session {}: {e}", ctx.session_id);
                        continue;
                    }
                };
                let mut space = ctx.space.lock().await;
                session.handle(&mut space, msg, Instant::now())?
            }
            notice = ctx.feed.recv() => {
                match notice {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        let space = ctx.space.lock().await;
                        session.on_local_change(&space, Instant::now())?
                    }
                    Err(RecvError::Closed) => {
                        log::debug!("Feed of space {} closed", session.space_id());
                        return Ok(());
                    }
                }
            }
            _ = ticker.tick() => {
                let space = ctx.space.lock().await;
                session.tick(&space, Instant::now())?
            }
            changed = ctx.cancel.changed() => {
                if changed.is_err() || *ctx.cancel.borrow() {
                    return Ok(());
                }
                continue;
            }
        };

        send_all(&ctx.channel, &ctx.monitor, out).await?;

        let stats = session.stats();
        ctx.monitor.record_changes(
            stats.changes_sent - reported.changes_sent,
            stats.changes_received - reported.changes_received,
            stats.changes_rejected - reported.changes_rejected,
        );
        reported = stats;

        let snapshot = {
            let space = ctx.space.lock().await;
            session.snapshot(&space)
        };
        ctx.board.publish(ctx.session_id, snapshot);

        if session.state() == SessionState::Closed {
            return Ok(());
        }
    }
}

async fn send_all(channel: &PeerChannel, monitor: &SyncMonitor, messages: Vec<SyncMessage>) -> Result<(), SessionError> {
    for msg in messages {
        let frame = msg.encode()?;
        let len = frame.len();
        if let Err(e) = channel.send(frame).await {
            monitor.record_send_failure();
            return Err(e.into());
        }
        monitor.record_sent(len);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ChangeFeed;
    use crate::session::SyncConfig;
    use echo_core::{path, Capability, Identity, SpaceBuilder};
    use std::time::Duration;
    use uuid::Uuid;

    fn identity(n: u8) -> Identity {
        Identity::from_seed([n; 32])
    }

    struct Harness {
        space: SharedSpace,
        feed: Arc<ChangeFeed>,
        board: Arc<SyncStateBoard>,
        monitor: Arc<SyncMonitor>,
    }

    impl Harness {
        async fn new(mut space: Space) -> Self {
            let feed = Arc::new(ChangeFeed::new(64));
            let publisher = feed.clone();
            space.subscribe_commits(move |n| {
                publisher.publish(*n);
            });
            Self {
                space: Arc::new(Mutex::new(space)),
                feed,
                board: Arc::new(SyncStateBoard::new()),
                monitor: Arc::new(SyncMonitor::new()),
            }
        }

        fn spawn(
            &self,
            id: u64,
            channel: PeerChannel,
        ) -> (watch::Sender<bool>, tokio::task::JoinHandle<Result<SessionStats, SessionError>>) {
            let config = SyncConfig::for_testing();
            let (cancel_tx, cancel) = watch::channel(false);
            let ctx = PeerContext {
                session_id: id,
                space: self.space.clone(),
                channel,
                feed: self.feed.subscribe(),
                monitor: self.monitor.clone(),
                board: self.board.clone(),
                cancel,
            };
            let space = self.space.clone();
            let task = tokio::spawn(async move {
                let space_id = space.lock().await.id();
                let session = SyncSession::new(Uuid::new_v4(), space_id, config);
                run_session(session, ctx).await
            });
            (cancel_tx, task)
        }
    }

    async fn wait_for_frontiers(a: &SharedSpace, b: &SharedSpace) {
        for _ in 0..200 {
            if a.lock().await.frontier() == b.lock().await.frontier() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("replicas did not converge");
    }

    #[tokio::test]
    async fn test_sessions_sync_live_edits() {
        let mut owner = SpaceBuilder::new(identity(1)).create().unwrap();
        owner.admit_member(identity(2).actor(), Capability::Write).unwrap();
        let doc = owner.create_document(None).unwrap().document;
        let replica = SpaceBuilder::new(identity(2)).join(owner.id(), owner.owner()).unwrap();

        let a = Harness::new(owner).await;
        let b = Harness::new(replica).await;
        let (ch_a, ch_b) = PeerChannel::pair(64);
        let (_cancel_a, _task_a) = a.spawn(1, ch_a);
        let (_cancel_b, _task_b) = b.spawn(1, ch_b);
        wait_for_frontiers(&a.space, &b.space).await;

        // A later edit travels through the change feed.
        b.space.lock().await.local_mutate(doc, &path!["title"], "live").unwrap();
        wait_for_frontiers(&a.space, &b.space).await;
        let title = a.space.lock().await.document(doc).unwrap().get(&path!["title"]);
        assert_eq!(title, Some(echo_core::Value::from("live")));
        assert!(a.monitor.snapshot().changes_received >= 1);
        assert!(!a.board.states().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_session() {
        let owner = SpaceBuilder::new(identity(1)).create().unwrap();
        let a = Harness::new(owner).await;
        let (ch_a, _ch_b) = PeerChannel::pair(8);
        let (cancel, task) = a.spawn(7, ch_a);

        cancel.send(true).unwrap();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.changes_sent, 0);
        assert!(a.board.states().is_empty());
        assert_eq!(a.monitor.snapshot().open_connections(), 0);
    }

    #[tokio::test]
    async fn test_peer_disconnect_ends_session() {
        let owner = SpaceBuilder::new(identity(1)).create().unwrap();
        let a = Harness::new(owner).await;
        let (ch_a, ch_b) = PeerChannel::pair(8);
        let (_cancel, task) = a.spawn(3, ch_a);
        drop(ch_b);
        assert!(task.await.unwrap().is_ok());
    }
}
