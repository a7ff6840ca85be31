//! Operations: the atomic, immutable mutations a document is built from.

use crate::ids::{ActorId, DocumentId, OpId};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Address of a container inside a document.
///
/// Every container except the root is named by the operation that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjId {
    Root,
    Op(OpId),
}

/// A list or text element. Text splices create several elements from one
/// operation, told apart by `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElemId {
    pub op: OpId,
    pub offset: u32,
}

impl ElemId {
    pub fn new(op: OpId, offset: u32) -> Self {
        Self { op, offset }
    }
}

/// Insertion anchor: the list head or an existing element (possibly deleted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElemRef {
    Head,
    Elem(ElemId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjKind {
    Map,
    List,
    Text,
    Counter,
}

impl fmt::Display for ObjKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjKind::Map => "map",
            ObjKind::List => "list",
            ObjKind::Text => "text",
            ObjKind::Counter => "counter",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    CreateDocument { schema: Option<String> },
    DeleteDocument,
    /// Write a scalar register in a map.
    Put { obj: ObjId, key: String, value: Value },
    /// Write a nested container into a map register.
    MakeObject { obj: ObjId, key: String, kind: ObjKind },
    /// Tombstone a map register.
    Delete { obj: ObjId, key: String },
    Insert { obj: ObjId, after: ElemRef, value: Value },
    InsertObject { obj: ObjId, after: ElemRef, kind: ObjKind },
    /// Insert a run of characters into a text object. Character `i` is
    /// element `(op, i)` and sits after character `i - 1`.
    Splice { obj: ObjId, after: ElemRef, text: String },
    /// Tombstone list or text elements.
    Remove { obj: ObjId, elems: Vec<ElemId> },
    Increment { obj: ObjId, delta: i64 },
}

impl Action {
    /// Container this action writes into, if any.
    pub fn target(&self) -> Option<ObjId> {
        match self {
            Action::CreateDocument { .. } | Action::DeleteDocument => None,
            Action::Put { obj, .. }
            | Action::MakeObject { obj, .. }
            | Action::Delete { obj, .. }
            | Action::Insert { obj, .. }
            | Action::InsertObject { obj, .. }
            | Action::Splice { obj, .. }
            | Action::Remove { obj, .. }
            | Action::Increment { obj, .. } => Some(*obj),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::CreateDocument { .. } => "create_document",
            Action::DeleteDocument => "delete_document",
            Action::Put { .. } => "put",
            Action::MakeObject { .. } => "make_object",
            Action::Delete { .. } => "delete",
            Action::Insert { .. } => "insert",
            Action::InsertObject { .. } => "insert_object",
            Action::Splice { .. } => "splice",
            Action::Remove { .. } => "remove",
            Action::Increment { .. } => "increment",
        }
    }
}

/// Content hash of an operation.
pub type OpHash = [u8; 32];

/// An atomic mutation of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    /// Lamport timestamp: one more than the largest timestamp the author had seen.
    pub lamport: u64,
    /// Operations this one causally depends on.
    pub deps: BTreeSet<OpId>,
    pub document: DocumentId,
    pub action: Action,
}

impl Operation {
    pub fn actor(&self) -> ActorId {
        self.id.actor
    }

    pub fn seq(&self) -> u64 {
        self.id.seq
    }

    /// BLAKE3 over the canonical bincode encoding.
    pub fn hash(&self) -> Result<OpHash, bincode::error::EncodeError> {
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())?;
        Ok(*blake3::hash(&bytes).as_bytes())
    }
}

/// Hands out operation sequence numbers for one actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorClock {
    actor: ActorId,
    next_seq: u64,
}

impl ActorClock {
    pub fn new(actor: ActorId) -> Self {
        Self { actor, next_seq: 1 }
    }

    /// Resumes after `last_seq` operations were already issued.
    pub fn resume(actor: ActorId, last_seq: u64) -> Self {
        Self {
            actor,
            next_seq: last_seq + 1,
        }
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    pub fn peek(&self) -> OpId {
        OpId::new(self.actor, self.next_seq)
    }

    pub fn next(&mut self) -> OpId {
        let id = self.peek();
        self.next_seq += 1;
        id
    }

    /// Hands back ids issued after `mark`, e.g. when a transaction is rolled back.
    pub fn rewind(&mut self, mark: OpId) {
        if mark.actor == self.actor && mark.seq < self.next_seq {
            self.next_seq = mark.seq;
        }
    }
}
