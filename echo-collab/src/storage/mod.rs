//! Durable storage for replicated spaces.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   append_change   ┌──────────────┐
//! │ Space       │ ────────────────► │ RocksStore   │
//! │ (ChangeLog) │   save_snapshot   │ (RocksDB)    │
//! └──────┬──────┘                   └──────┬───────┘
//!        │                                 │
//!        │ on open: snapshot + replay      │ column families
//!        ▼                                 ▼
//! ┌─────────────┐     ┌────────────────────────────────────┐
//! │ Documents   │     │ CF "changes"   — signed changes     │
//! │ (restored)  │     │ CF "snapshots" — space snapshots    │
//! └─────────────┘     │ CF "metadata"  — counters, times    │
//!                     └────────────────────────────────────┘
//! ```
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod rocks;

pub use rocks::{RocksStore, SpaceMetadata, StoreConfig, StoreError};
