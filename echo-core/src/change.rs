//! Signed, hash-chained changes.
//!
//! ```text
//!   actor A:  C1 ◄─prev── C2 ◄─prev── C3
//!                          ▲
//!   actor B:  D1 ──deps────┘           (D2 depends on A:2)
//! ```
//!
//! A change bundles the operations of one local transaction. It links to the
//! author's previous change by hash and records the frontier the author had
//! seen, which is its causal context. The signature covers everything but
//! itself.

use crate::frontier::Frontier;
use crate::ids::{ActorId, ChangeHash, Identity};
use crate::op::Operation;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChangeError {
    #[error("change encoding failed: {0}")]
    Encode(String),
    #[error("change decoding failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub actor: ActorId,
    /// Position in the author's chain, starting at 1.
    pub seq: u64,
    /// Hash of the author's change `seq - 1`; `None` only for `seq == 1`.
    pub prev: Option<ChangeHash>,
    /// Frontier the author had incorporated when creating this change.
    pub deps: Frontier,
    /// Wall clock of the author, milliseconds. Informational only.
    pub timestamp: u64,
    pub ops: Vec<Operation>,
    pub signature: Vec<u8>,
}

/// Borrowed view of the signed fields.
#[derive(Serialize)]
struct Signed<'a> {
    actor: &'a ActorId,
    seq: u64,
    prev: &'a Option<ChangeHash>,
    deps: &'a Frontier,
    timestamp: u64,
    ops: &'a [Operation],
}

impl Change {
    pub fn signing_bytes(&self) -> Result<Vec<u8>, ChangeError> {
        let signed = Signed {
            actor: &self.actor,
            seq: self.seq,
            prev: &self.prev,
            deps: &self.deps,
            timestamp: self.timestamp,
            ops: &self.ops,
        };
        bincode::serde::encode_to_vec(&signed, bincode::config::standard())
            .map_err(|e| ChangeError::Encode(e.to_string()))
    }

    pub fn hash(&self) -> Result<ChangeHash, ChangeError> {
        Ok(ChangeHash(*blake3::hash(&self.signing_bytes()?).as_bytes()))
    }

    /// `Ok(false)` for a malformed or foreign signature.
    pub fn verify(&self, key: &VerifyingKey) -> Result<bool, ChangeError> {
        let Ok(signature) = Signature::from_slice(&self.signature) else {
            return Ok(false);
        };
        Ok(key.verify(&self.signing_bytes()?, &signature).is_ok())
    }

    /// Causal context: everything the author had seen, including its own chain.
    pub fn context(&self) -> Frontier {
        let mut context = self.deps.clone();
        context.advance(self.actor, self.seq.saturating_sub(1));
        context
    }

    pub fn encode(&self) -> Result<Vec<u8>, ChangeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ChangeError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ChangeError> {
        let (change, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ChangeError::Decode(e.to_string()))?;
        Ok(change)
    }
}

/// Assembles and signs a [`Change`].
#[derive(Debug, Clone)]
pub struct ChangeBuilder {
    seq: u64,
    prev: Option<ChangeHash>,
    deps: Frontier,
    timestamp: Option<u64>,
    ops: Vec<Operation>,
}

impl ChangeBuilder {
    pub fn new(seq: u64) -> Self {
        Self {
            seq,
            prev: None,
            deps: Frontier::new(),
            timestamp: None,
            ops: Vec::new(),
        }
    }

    pub fn prev(mut self, prev: Option<ChangeHash>) -> Self {
        self.prev = prev;
        self
    }

    pub fn deps(mut self, deps: Frontier) -> Self {
        self.deps = deps;
        self
    }

    pub fn timestamp(mut self, millis: u64) -> Self {
        self.timestamp = Some(millis);
        self
    }

    pub fn op(mut self, op: Operation) -> Self {
        self.ops.push(op);
        self
    }

    pub fn ops(mut self, ops: impl IntoIterator<Item = Operation>) -> Self {
        self.ops.extend(ops);
        self
    }

    pub fn sign(self, identity: &Identity) -> Result<Change, ChangeError> {
        let timestamp = self.timestamp.unwrap_or_else(now_millis);
        let mut change = Change {
            actor: identity.actor(),
            seq: self.seq,
            prev: self.prev,
            deps: self.deps,
            timestamp,
            ops: self.ops,
            signature: Vec::new(),
        };
        change.signature = identity.sign(&change.signing_bytes()?);
        Ok(change)
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
