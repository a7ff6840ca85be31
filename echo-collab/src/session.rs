//! Sans-IO sync session: one per connected peer per space.
//!
//! ```text
//!          start()           Announce in          batches out
//!   Idle ───────────► Announcing ────────► Reconciling ────────► Streaming
//!    ▲                    ▲                      │                   │
//!    │   reannounce tick  │                      │ nothing to send   │ all acked
//!    ├────────────────────┘                      ▼                   ▼
//!    └─────────────────────────────────── Done sent ◄────────────────┘
//!
//!   any ── close() / Reject ──► Closed
//! ```
//!
//! The session never touches a socket. The driver feeds it decoded
//! messages, commit notifications and clock ticks, and writes whatever
//! messages it returns. Everything a session knows about its peer is
//! ephemeral; after a reconnect the durable change log frontier is the
//! only ground truth and the handshake starts over.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use echo_core::{
    Access, ActorId, AppendError, AppendOutcome, Change, DocumentId, Frontier, Space, SpaceError, SpaceId,
};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{
    Ack, Announce, Batch, Done, Hello, MessageType, ProtocolError, SyncMessage, PROTOCOL_VERSION,
};
use crate::transport::TransportError;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum changes per batch
    pub batch_max_changes: usize,
    /// Soft byte limit per batch (a single oversized change still ships alone)
    pub batch_max_bytes: usize,
    /// Unacknowledged batches allowed before streaming pauses
    pub ack_window: usize,
    /// Idle time after which the frontier is announced again
    pub reannounce_interval: Duration,
    /// Time an unacknowledged batch may stay outstanding
    pub ack_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_max_changes: 256,
            batch_max_bytes: 1024 * 1024, // 1MB
            ack_window: 4,
            reannounce_interval: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(20),
        }
    }
}

impl SyncConfig {
    /// Small batches and short timers.
    pub fn for_testing() -> Self {
        Self {
            batch_max_changes: 2,
            batch_max_bytes: 64 * 1024,
            ack_window: 2,
            reannounce_interval: Duration::from_millis(200),
            ack_timeout: Duration::from_secs(2),
        }
    }

    /// How often a driver should call [`SyncSession::tick`].
    pub fn tick_interval(&self) -> Duration {
        (self.reannounce_interval.min(self.ack_timeout) / 4).max(Duration::from_millis(5))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Announcing,
    Reconciling,
    Streaming,
    Closed,
}

/// What a session believes about both ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    pub their_frontier: Frontier,
    pub our_frontier: Frontier,
    pub last_exchange: Option<Instant>,
}

/// Diagnostic view of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub peer_id: Uuid,
    pub space: SpaceId,
    pub state: SessionState,
    /// Changes we hold that the peer has not acknowledged
    pub missing_on_remote: u64,
    /// Changes the peer announced that we have not integrated
    pub missing_on_local: u64,
    /// Documents whose digests differ between the two sides
    pub different_documents: usize,
}

/// Per-session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub batches_sent: u64,
    pub changes_sent: u64,
    pub changes_received: u64,
    pub changes_rejected: u64,
    pub duplicates_received: u64,
    /// Streaming rounds finished with a `Done`
    pub rounds: u64,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("peer rejected the session: {0}")]
    Rejected(String),
    #[error("batch {batch_id} not acknowledged in time")]
    AckTimeout { batch_id: u64 },
    #[error("space failure: {0}")]
    Space(SpaceError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("session is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    batch_id: u64,
    sent_at: Instant,
}

pub struct SyncSession {
    local_peer: Uuid,
    space_id: SpaceId,
    config: SyncConfig,
    state: SessionState,
    sync: SyncState,
    remote_peer: Option<Uuid>,
    remote_actor: Option<ActorId>,
    /// Their frontier has been received at least once.
    announced: bool,
    their_documents: BTreeMap<DocumentId, [u8; 32]>,
    /// Everything streamed on this connection, acknowledged or not.
    sent: Frontier,
    in_flight: VecDeque<InFlight>,
    next_batch_id: u64,
    last_received: Option<Instant>,
    ping_outstanding: bool,
    stats: SessionStats,
}

impl SyncSession {
    pub fn new(local_peer: Uuid, space_id: SpaceId, config: SyncConfig) -> Self {
        Self {
            local_peer,
            space_id,
            config,
            state: SessionState::Idle,
            sync: SyncState::default(),
            remote_peer: None,
            remote_actor: None,
            announced: false,
            their_documents: BTreeMap::new(),
            sent: Frontier::new(),
            in_flight: VecDeque::new(),
            next_batch_id: 1,
            last_received: None,
            ping_outstanding: false,
            stats: SessionStats::default(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn sync_state(&self) -> &SyncState {
        &self.sync
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn space_id(&self) -> SpaceId {
        self.space_id
    }

    pub fn remote_peer(&self) -> Option<Uuid> {
        self.remote_peer
    }

    pub fn remote_actor(&self) -> Option<ActorId> {
        self.remote_actor
    }

    /// Batches sent and not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Opens the session: `Hello` followed by our frontier.
    pub fn start(&mut self, space: &Space, now: Instant) -> Result<Vec<SyncMessage>, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let hello = Hello {
            version: PROTOCOL_VERSION,
            actor: space.local_actor(),
            space: self.space_id,
        };
        let out = vec![
            SyncMessage::hello(self.local_peer, &hello)?,
            self.announce_message(space, false)?,
        ];
        self.sync.last_exchange = Some(now);
        self.transition(SessionState::Announcing);
        Ok(out)
    }

    /// Processes one message from the peer.
    pub fn handle(
        &mut self,
        space: &mut Space,
        msg: SyncMessage,
        now: Instant,
    ) -> Result<Vec<SyncMessage>, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if msg.space_id != self.space_id {
            return self.refuse(format!("expected space {}, got {}", self.space_id, msg.space_id));
        }
        self.remote_peer = Some(msg.peer_id);
        self.last_received = Some(now);
        self.ping_outstanding = false;

        match msg.msg_type {
            MessageType::Hello => {
                let hello = msg.hello_payload()?;
                if hello.version != PROTOCOL_VERSION {
                    return self.refuse(format!(
                        "protocol version {} unsupported, expected {PROTOCOL_VERSION}",
                        hello.version
                    ));
                }
                log::debug!("Peer {} is actor {} in space {}", msg.peer_id, hello.actor, self.space_id);
                self.remote_actor = Some(hello.actor);
                Ok(Vec::new())
            }
            MessageType::Announce => {
                let announce = msg.announce_payload()?;
                self.on_announce(space, announce, now)
            }
            MessageType::Batch => {
                let batch = msg.batch_payload()?;
                self.on_batch(space, batch, now)
            }
            MessageType::Ack => {
                let ack = msg.ack_payload()?;
                self.on_ack(space, ack, now)
            }
            MessageType::Done => {
                let done = msg.done_payload()?;
                self.sync.their_frontier.merge(&done.frontier);
                self.sync.last_exchange = Some(now);
                self.pump(space, now)
            }
            MessageType::Ping => Ok(vec![SyncMessage::pong(self.local_peer, self.space_id)]),
            MessageType::Pong => Ok(Vec::new()),
            MessageType::Reject => {
                let reason = msg.reject_payload()?.reason;
                log::warn!("Peer {} rejected session for space {}: {reason}", msg.peer_id, self.space_id);
                self.close();
                Err(SessionError::Rejected(reason))
            }
        }
    }

    /// New changes were committed to the space.
    pub fn on_local_change(&mut self, space: &Space, now: Instant) -> Result<Vec<SyncMessage>, SessionError> {
        if matches!(self.state, SessionState::Closed | SessionState::Announcing) {
            return Ok(Vec::new());
        }
        self.pump(space, now)
    }

    /// Timers: ack timeout, liveness pings and periodic re-announcement.
    pub fn tick(&mut self, space: &Space, now: Instant) -> Result<Vec<SyncMessage>, SessionError> {
        if self.state == SessionState::Closed {
            return Ok(Vec::new());
        }
        if let Some(oldest) = self.in_flight.front() {
            if now.saturating_duration_since(oldest.sent_at) >= self.config.ack_timeout {
                return Err(SessionError::AckTimeout {
                    batch_id: oldest.batch_id,
                });
            }
            let quiet = self
                .last_received
                .map_or(true, |t| now.saturating_duration_since(t) >= self.config.ack_timeout / 2);
            if quiet && !self.ping_outstanding {
                self.ping_outstanding = true;
                return Ok(vec![SyncMessage::ping(self.local_peer, self.space_id)]);
            }
            return Ok(Vec::new());
        }

        let due = self
            .sync
            .last_exchange
            .map_or(true, |t| now.saturating_duration_since(t) >= self.config.reannounce_interval);
        if self.state == SessionState::Idle && self.announced && due {
            log::trace!("Re-announcing space {} to {:?}", self.space_id, self.remote_peer);
            let msg = self.announce_message(space, false)?;
            self.sync.last_exchange = Some(now);
            self.transition(SessionState::Announcing);
            return Ok(vec![msg]);
        }
        Ok(Vec::new())
    }

    /// Tears the session down and forgets everything learned about the peer.
    pub fn close(&mut self) {
        self.transition(SessionState::Closed);
        self.sync = SyncState::default();
        self.sent = Frontier::new();
        self.in_flight.clear();
        self.their_documents.clear();
        self.announced = false;
    }

    pub fn snapshot(&self, space: &Space) -> SyncSnapshot {
        let ours = space.frontier();
        let theirs = &self.sync.their_frontier;
        let different_documents = if self.announced {
            let digests = space.document_digests();
            let ids: BTreeSet<&DocumentId> = digests.keys().chain(self.their_documents.keys()).collect();
            ids.into_iter()
                .filter(|id| digests.get(*id) != self.their_documents.get(*id))
                .count()
        } else {
            0
        };
        SyncSnapshot {
            peer_id: self.remote_peer.unwrap_or_else(Uuid::nil),
            space: self.space_id,
            state: self.state,
            missing_on_remote: if self.announced { ours.total_missing(theirs) } else { 0 },
            missing_on_local: theirs.total_missing(ours),
            different_documents,
        }
    }

    // ─── Handlers ────────────────────────────────────────────────────────

    fn on_announce(
        &mut self,
        space: &Space,
        announce: Announce,
        now: Instant,
    ) -> Result<Vec<SyncMessage>, SessionError> {
        // Our own announcement is already on the wire; answering would loop.
        let reply = self.state != SessionState::Announcing;
        self.announced = true;
        if announce.resync {
            log::debug!(
                "Peer {:?} requested resync of space {} from {}",
                self.remote_peer,
                self.space_id,
                announce.frontier
            );
            self.sent = announce.frontier.clone();
        }
        self.sync.their_frontier.merge(&announce.frontier);
        self.their_documents = announce.documents;
        self.sync.last_exchange = Some(now);
        self.transition(SessionState::Reconciling);

        let mut out = Vec::new();
        if reply {
            out.push(self.announce_message(space, false)?);
        }
        out.extend(self.pump(space, now)?);
        Ok(out)
    }

    fn on_batch(&mut self, space: &mut Space, batch: Batch, now: Instant) -> Result<Vec<SyncMessage>, SessionError> {
        let mut resync = false;
        for (index, decoded) in batch.decode_changes().enumerate() {
            let change = match decoded {
                Ok(change) => change,
                Err(e) => {
                    log::warn!(
                        "Skipping undecodable change {index} of batch {} in space {}: {e}",
                        batch.batch_id,
                        self.space_id
                    );
                    self.stats.changes_rejected += 1;
                    continue;
                }
            };
            let (actor, seq) = (change.actor, change.seq);
            self.sync.their_frontier.advance(actor, seq);
            match space.apply_remote(change) {
                Ok(report) => {
                    self.stats.changes_received += 1;
                    if report.outcome == AppendOutcome::Duplicate {
                        self.stats.duplicates_received += 1;
                    }
                    for rejected in &report.rejected {
                        log::warn!("Dropped buffered change in space {}: {rejected}", self.space_id);
                        self.stats.changes_rejected += 1;
                    }
                }
                Err(SpaceError::Append(AppendError::PendingBufferExhausted { actor, limit })) => {
                    log::warn!(
                        "Pending buffer for {actor} full ({limit}) in space {}, requesting resync",
                        self.space_id
                    );
                    space.clear_pending(&actor);
                    resync = true;
                }
                Err(e @ (SpaceError::Storage(_) | SpaceError::Poisoned)) => {
                    return Err(SessionError::Space(e));
                }
                Err(e) => {
                    log::warn!("Skipping change {actor}:{seq} in space {}: {e}", self.space_id);
                    self.stats.changes_rejected += 1;
                }
            }
        }

        self.sync.our_frontier = space.frontier().clone();
        self.sync.last_exchange = Some(now);
        let ack = Ack {
            batch_id: batch.batch_id,
            frontier: self.sync.our_frontier.clone(),
        };
        let mut out = vec![SyncMessage::ack(self.local_peer, self.space_id, &ack)?];
        if resync {
            out.push(self.announce_message(space, true)?);
        }
        Ok(out)
    }

    fn on_ack(&mut self, space: &Space, ack: Ack, now: Instant) -> Result<Vec<SyncMessage>, SessionError> {
        match self.in_flight.iter().position(|b| b.batch_id == ack.batch_id) {
            Some(index) => {
                self.in_flight.remove(index);
            }
            None => log::debug!("Ack for unknown batch {} in space {}", ack.batch_id, self.space_id),
        }
        self.sync.their_frontier.merge(&ack.frontier);
        self.sync.last_exchange = Some(now);
        self.pump(space, now)
    }

    // ─── Streaming ───────────────────────────────────────────────────────

    /// Sends whatever the peer lacks, within the ack window.
    fn pump(&mut self, space: &Space, now: Instant) -> Result<Vec<SyncMessage>, SessionError> {
        if !self.announced || self.state == SessionState::Closed {
            return Ok(Vec::new());
        }
        self.sync.our_frontier = space.frontier().clone();

        let mut out = Vec::new();
        let readable = self
            .remote_actor
            .is_some_and(|actor| space.check_capability(&actor, Access::Read));
        if readable {
            while self.in_flight.len() < self.config.ack_window {
                let run = self.next_batch(space)?;
                if run.is_empty() {
                    break;
                }
                let mut changes = Vec::with_capacity(run.len());
                for (change, bytes) in run {
                    self.sent.advance(change.actor, change.seq);
                    changes.push(bytes);
                }
                let batch = Batch {
                    batch_id: self.next_batch_id,
                    changes,
                };
                self.next_batch_id += 1;
                self.stats.batches_sent += 1;
                self.stats.changes_sent += batch.changes.len() as u64;
                self.in_flight.push_back(InFlight {
                    batch_id: batch.batch_id,
                    sent_at: now,
                });
                out.push(SyncMessage::batch(self.local_peer, self.space_id, &batch)?);
            }
        } else if let Some(actor) = self.remote_actor {
            log::debug!("Withholding space {} from {actor}: no read access", self.space_id);
        }

        if !out.is_empty() {
            self.transition(SessionState::Streaming);
        } else if self.in_flight.is_empty()
            && matches!(self.state, SessionState::Reconciling | SessionState::Streaming)
        {
            let done = Done {
                frontier: self.sync.our_frontier.clone(),
            };
            out.push(SyncMessage::done(self.local_peer, self.space_id, &done)?);
            self.stats.rounds += 1;
            self.sync.last_exchange = Some(now);
            self.transition(SessionState::Idle);
        }
        Ok(out)
    }

    /// Next run of changes the peer neither has nor was sent, dependencies first.
    fn next_batch<'a>(&self, space: &'a Space) -> Result<Vec<(&'a Change, Vec<u8>)>, SessionError> {
        let mut known = self.sync.their_frontier.clone();
        known.merge(&self.sent);

        let mut changes = Vec::new();
        let mut bytes = 0usize;
        for change in space.changes_since(&known) {
            if changes.len() >= self.config.batch_max_changes {
                break;
            }
            let encoded = change
                .encode()
                .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
            if !changes.is_empty() && bytes + encoded.len() > self.config.batch_max_bytes {
                break;
            }
            bytes += encoded.len();
            changes.push((change, encoded));
        }
        Ok(changes)
    }

    fn announce_message(&self, space: &Space, resync: bool) -> Result<SyncMessage, SessionError> {
        let announce = Announce {
            frontier: space.frontier().clone(),
            documents: space.document_digests(),
            resync,
        };
        Ok(SyncMessage::announce(self.local_peer, self.space_id, &announce)?)
    }

    /// Closes the session with a farewell the driver still delivers.
    fn refuse(&mut self, reason: String) -> Result<Vec<SyncMessage>, SessionError> {
        log::warn!("Refusing peer {:?} on space {}: {reason}", self.remote_peer, self.space_id);
        let msg = SyncMessage::reject(self.local_peer, self.space_id, reason)?;
        self.close();
        Ok(vec![msg])
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            log::debug!(
                "Session {} with {:?} on space {}: {:?} -> {next:?}",
                self.local_peer,
                self.remote_peer,
                self.space_id,
                self.state
            );
            self.state = next;
        }
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("local_peer", &self.local_peer)
            .field("remote_peer", &self.remote_peer)
            .field("space_id", &self.space_id)
            .field("state", &self.state)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}
