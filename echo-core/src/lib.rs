//! # echo-core — CRDT documents, causal change log and spaces
//!
//! Everything here is synchronous and transport-agnostic; `echo-collab`
//! moves changes between replicas.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────── Space ─────────────────────────────┐
//! │                                                                │
//! │  mutate ──► Document (local ops) ──► Change (signed, chained)  │
//! │                                            │                   │
//! │  apply_remote ─────────────────────────────┤                   │
//! │                                            ▼                   │
//! │                    ChangeLog ── pending buffer ── ChangeStore  │
//! │                        │                                       │
//! │                        ▼                                       │
//! │           Membership (causal capabilities) + Documents         │
//! │                        │                                       │
//! │                        ▼                                       │
//! │                   Observers (deltas)                           │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`] — Self-describing binary value encoding with lazy reads
//! - [`document`] — LWW registers, RGA lists and text, counters
//! - [`change`] / [`changelog`] — Signed changes and causal delivery
//! - [`space`] — Documents, membership and persistence of one space

pub mod capability;
pub mod change;
pub mod changelog;
pub mod codec;
pub mod document;
pub mod frontier;
pub mod ids;
pub mod membership;
pub mod observe;
pub mod op;
pub mod registry;
pub mod space;
pub mod store;
pub mod value;

// Re-exports for convenience
pub use capability::{Access, Capability, CapabilityProvider, DenyListProvider, Forbidden, KeyDerivedProvider};
pub use change::{Change, ChangeBuilder, ChangeError};
pub use changelog::{AppendError, AppendOutcome, AppendReport, ChangeLog, ChangesSince, Integrator, LogConfig};
pub use codec::{decode, encode, DecodeError, DecodeErrorKind, ValueReader};
pub use document::{Delta, Document, DocumentError};
pub use frontier::{Frontier, SeqRange};
pub use ids::{ActorId, ChangeHash, DocumentId, Identity, OpId, SpaceId};
pub use membership::Membership;
pub use observe::{CommitNotice, SubscriptionId};
pub use op::{Action, ActorClock, ObjKind, Operation};
pub use registry::{Schema, SchemaError, SchemaRegistry};
pub use space::{
    AdmitError, DocumentHandle, Space, SpaceBuilder, SpaceConfig, SpaceError, TombstonePolicy, Transaction,
};
pub use store::{ChangeStore, MemoryStore, StorageError};
pub use value::{PathSegment, Reference, Value, ValueKind};
