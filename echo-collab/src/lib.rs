//! # echo-collab — Peer-to-peer replication of echo spaces
//!
//! Moves signed changes between replicas of a space until their change
//! logs are equal, over in-memory channels or WebSockets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (dialer)    │     Binary Proto    │ (listener)  │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Replicator  │                     │ Replicator  │
//! │ SyncSession │                     │ SyncSession │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Space       │                     │ Space       │
//! │ RocksStore  │                     │ RocksStore  │
//! └─────────────┘                     └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`session`] — Sans-IO sync state machine, one per peer per space
//! - [`peer`] — Async driver of a session
//! - [`replicator`] — Spaces, sessions and reconnect backoff
//! - [`broadcast`] — Commit fan-out to sessions
//! - [`monitor`] — Traffic counters and sync state board
//! - [`transport`] — In-memory and WebSocket peer channels
//! - [`server`] / [`client`] — Listening and dialing sides
//! - [`storage`] — RocksDB change store

pub mod broadcast;
pub mod client;
pub mod monitor;
pub mod peer;
pub mod protocol;
pub mod replicator;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{ChangeFeed, FeedRegistry, FeedStats};
pub use client::{ConnectionState, SyncClient};
pub use monitor::{MonitorStats, StateSubscription, SyncMonitor, SyncStateBoard, SyncStateCallback};
pub use peer::{run_session, PeerContext, SharedSpace};
pub use protocol::{
    Ack, Announce, Batch, Done, Hello, MessageType, ProtocolError, Reject, SyncMessage, MAX_BATCH_PAYLOAD,
    PROTOCOL_VERSION,
};
pub use replicator::{
    Backoff, BackoffConfig, Replicator, ReplicatorConfig, ReplicatorError, SessionHandle,
};
pub use server::{ServerConfig, SyncServer};
pub use session::{
    SessionError, SessionState, SessionStats, SyncConfig, SyncSession, SyncSnapshot, SyncState,
};
pub use storage::{RocksStore, SpaceMetadata, StoreConfig, StoreError};
pub use transport::{accept_websocket, bridge, connect_websocket, PeerChannel, TransportError};
