//! Document CRDT.
//!
//! A document is a tree of containers rooted at a map:
//!
//! ```text
//!   Root (map) ── "title" ─► Register { (lamport, actor, seq) → value }
//!              ├─ "items" ─► Register → List  [e1, e2, ✝e3, e4]   (✝ = tombstone)
//!              ├─ "body"  ─► Register → Text  [h, e, ✝x, l, l, o]
//!              └─ "votes" ─► Register → Counter(7)
//! ```
//!
//! - Map fields are last-writer-wins registers keyed by `(lamport, actor, seq)`.
//!   A write removes the writes it causally depends on; what remains are the
//!   concurrent heads, and the greatest key is the visible value.
//! - Lists and text use RGA: an element is inserted right after its anchor,
//!   skipping any neighbours whose key is greater than its own. Removal only
//!   sets a tombstone so later inserts can still anchor on it.
//! - Counters sum their increments.
//!
//! All three merges are commutative, associative and idempotent, so replicas
//! that apply the same operations in any causal order end up identical.
//!
//! Reference: Roh et al., "Replicated abstract data types" (RGA), 2011

use crate::codec::{self, DecodeErrorKind};
use crate::ids::{ActorId, DocumentId, OpId};
use crate::op::{Action, ActorClock, ElemId, ElemRef, ObjId, ObjKind, OpHash, Operation};
use crate::value::{PathSegment, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Ordering key of register writes: greatest key wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LwwKey {
    pub lamport: u64,
    pub actor: ActorId,
    pub seq: u64,
}

impl LwwKey {
    pub fn of(op: &Operation) -> Self {
        Self {
            lamport: op.lamport,
            actor: op.id.actor,
            seq: op.id.seq,
        }
    }

    pub fn op_id(&self) -> OpId {
        OpId::new(self.actor, self.seq)
    }
}

/// Ordering key of sequence elements (RGA timestamp).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
struct ElemKey {
    lamport: u64,
    actor: ActorId,
    seq: u64,
    offset: u32,
}

impl ElemKey {
    fn new(op: &Operation, offset: u32) -> Self {
        Self {
            lamport: op.lamport,
            actor: op.id.actor,
            seq: op.id.seq,
            offset,
        }
    }
}

/// Change notification for observers.
///
/// `value` is the new visible value at `path`, `None` when it disappeared.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    pub document: DocumentId,
    pub path: Vec<PathSegment>,
    pub value: Option<Value>,
}

/// An operation that was just applied locally, with the deltas it produced.
#[derive(Debug, Clone)]
pub struct Applied {
    pub op: Operation,
    pub deltas: Vec<Delta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("operation for document {found} applied to {expected}")]
    WrongDocument {
        expected: DocumentId,
        found: DocumentId,
    },
    #[error("operation {0:?} already applied with different content")]
    ConflictingOperation(OpId),
    #[error("unknown object {0:?}")]
    UnknownObject(ObjId),
    #[error("unknown element {0:?}")]
    UnknownElement(ElemId),
    #[error("{action} is not valid on a {kind}")]
    TypeMismatch { action: &'static str, kind: ObjKind },
    #[error("no container at path /{0}")]
    InvalidPath(String),
    #[error("index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("value cannot be replicated: {0}")]
    Unencodable(DecodeErrorKind),
    #[error("operation encoding failed: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Slot {
    Value(Value),
    Object(ObjId),
    Tombstone,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Register {
    /// Writes not yet superseded by a causally later write.
    writes: BTreeMap<LwwKey, Slot>,
}

impl Register {
    fn write(&mut self, key: LwwKey, slot: Slot, deps: &BTreeSet<OpId>) {
        self.writes.retain(|k, _| !deps.contains(&k.op_id()));
        self.writes.insert(key, slot);
    }

    fn winner(&self) -> Option<(&LwwKey, &Slot)> {
        self.writes.last_key_value()
    }

    fn visible(&self) -> Option<&Slot> {
        match self.winner() {
            Some((_, Slot::Tombstone)) | None => None,
            Some((_, slot)) => Some(slot),
        }
    }

    fn heads(&self) -> impl Iterator<Item = OpId> + '_ {
        self.writes.keys().map(LwwKey::op_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Content {
    Value(Value),
    Object(ObjId),
    Char(char),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Element {
    id: ElemId,
    key: ElemKey,
    content: Content,
    /// Smallest removal op, if removed.
    deleted_by: Option<OpId>,
}

impl Element {
    fn is_visible(&self) -> bool {
        self.deleted_by.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Prop {
    Key(String),
    Elem(ElemId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum ObjState {
    Map(BTreeMap<String, Register>),
    List(Vec<Element>),
    Text(Vec<Element>),
    Counter(i64),
}

impl ObjState {
    fn empty(kind: ObjKind) -> Self {
        match kind {
            ObjKind::Map => ObjState::Map(BTreeMap::new()),
            ObjKind::List => ObjState::List(Vec::new()),
            ObjKind::Text => ObjState::Text(Vec::new()),
            ObjKind::Counter => ObjState::Counter(0),
        }
    }

    fn kind(&self) -> ObjKind {
        match self {
            ObjState::Map(_) => ObjKind::Map,
            ObjState::List(_) => ObjKind::List,
            ObjState::Text(_) => ObjKind::Text,
            ObjState::Counter(_) => ObjKind::Counter,
        }
    }

    fn elements(&self) -> Option<&Vec<Element>> {
        match self {
            ObjState::List(e) | ObjState::Text(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ObjEntry {
    parent: Option<(ObjId, Prop)>,
    state: ObjState,
}

/// Where a path resolves to.
enum Target<'a> {
    Value(&'a Value),
    Object(ObjId),
    Char(char),
}

// ─── Sequence helpers ────────────────────────────────────────

fn position_of(elems: &[Element], id: &ElemId) -> Option<usize> {
    elems.iter().position(|e| e.id == *id)
}

fn insert_position(elems: &[Element], after: &ElemRef, key: &ElemKey) -> Result<usize, DocumentError> {
    let mut pos = match after {
        ElemRef::Head => 0,
        ElemRef::Elem(id) => position_of(elems, id).ok_or(DocumentError::UnknownElement(*id))? + 1,
    };
    while pos < elems.len() && elems[pos].key > *key {
        pos += 1;
    }
    Ok(pos)
}

fn visible_index(elems: &[Element], pos: usize) -> usize {
    elems[..pos].iter().filter(|e| e.is_visible()).count()
}

fn nth_visible(elems: &[Element], index: usize) -> Option<usize> {
    elems
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_visible())
        .nth(index)
        .map(|(pos, _)| pos)
}

fn visible_len(elems: &[Element]) -> usize {
    elems.iter().filter(|e| e.is_visible()).count()
}

fn text_of(elems: &[Element]) -> String {
    elems
        .iter()
        .filter(|e| e.is_visible())
        .filter_map(|e| match e.content {
            Content::Char(c) => Some(c),
            _ => None,
        })
        .collect()
}

fn path_string(path: &[PathSegment]) -> String {
    path.iter().map(|s| s.to_string()).collect::<Vec<_>>().join("/")
}

/// A replicated document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    id: DocumentId,
    /// Schema name on create, tombstone on delete.
    lifecycle: Register,
    objects: BTreeMap<ObjId, ObjEntry>,
    applied: BTreeMap<OpId, OpHash>,
    max_lamport: u64,
}

impl Document {
    pub fn new(id: DocumentId) -> Self {
        let mut objects = BTreeMap::new();
        objects.insert(
            ObjId::Root,
            ObjEntry {
                parent: None,
                state: ObjState::Map(BTreeMap::new()),
            },
        );
        Self {
            id,
            lifecycle: Register::default(),
            objects,
            applied: BTreeMap::new(),
            max_lamport: 0,
        }
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    /// Created and not deleted.
    pub fn exists(&self) -> bool {
        self.lifecycle.visible().is_some()
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.lifecycle.winner(), Some((_, Slot::Tombstone)))
    }

    pub fn schema(&self) -> Option<&str> {
        match self.lifecycle.visible() {
            Some(Slot::Value(Value::String(s))) => Some(s),
            _ => None,
        }
    }

    pub fn max_lamport(&self) -> u64 {
        self.max_lamport
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.applied.contains_key(id)
    }

    pub fn op_count(&self) -> usize {
        self.applied.len()
    }

    /// Digest of the applied operation set. Equal digests mean equal state.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.id.as_uuid().as_bytes());
        for (id, hash) in &self.applied {
            hasher.update(id.actor.as_bytes());
            hasher.update(&id.seq.to_le_bytes());
            hasher.update(hash);
        }
        *hasher.finalize().as_bytes()
    }

    // ─── Remote application ──────────────────────────────────

    /// Applies an operation. Re-applying an already applied operation is a no-op.
    ///
    /// Validation happens before any state is touched, so an error leaves
    /// the document unchanged.
    pub fn apply(&mut self, op: &Operation) -> Result<Vec<Delta>, DocumentError> {
        if op.document != self.id {
            return Err(DocumentError::WrongDocument {
                expected: self.id,
                found: op.document,
            });
        }
        let hash = op.hash().map_err(|e| DocumentError::Encoding(e.to_string()))?;
        if let Some(existing) = self.applied.get(&op.id) {
            if *existing == hash {
                return Ok(Vec::new());
            }
            return Err(DocumentError::ConflictingOperation(op.id));
        }

        let deltas = self.integrate(op)?;
        self.applied.insert(op.id, hash);
        self.max_lamport = self.max_lamport.max(op.lamport);
        Ok(deltas)
    }

    fn integrate(&mut self, op: &Operation) -> Result<Vec<Delta>, DocumentError> {
        let key = LwwKey::of(op);
        match &op.action {
            Action::CreateDocument { schema } => {
                let was = self.exists();
                let schema = schema.clone().map(Value::String).unwrap_or(Value::Null);
                self.lifecycle.write(key, Slot::Value(schema), &op.deps);
                Ok(self.lifecycle_delta(was))
            }
            Action::DeleteDocument => {
                let was = self.exists();
                self.lifecycle.write(key, Slot::Tombstone, &op.deps);
                Ok(self.lifecycle_delta(was))
            }
            Action::Put { obj, key: field, value } => {
                self.write_register(*obj, field, key, Slot::Value(value.clone()), op, "put")
            }
            Action::MakeObject { obj, key: field, kind } => {
                self.expect_kind(*obj, ObjKind::Map, "make_object")?;
                let child = ObjId::Op(op.id);
                self.objects.insert(
                    child,
                    ObjEntry {
                        parent: Some((*obj, Prop::Key(field.clone()))),
                        state: ObjState::empty(*kind),
                    },
                );
                self.write_register(*obj, field, key, Slot::Object(child), op, "make_object")
            }
            Action::Delete { obj, key: field } => {
                self.write_register(*obj, field, key, Slot::Tombstone, op, "delete")
            }
            Action::Insert { obj, after, value } => {
                self.expect_kind(*obj, ObjKind::List, "insert")?;
                self.insert_elements(*obj, after, op, vec![Content::Value(value.clone())])
            }
            Action::InsertObject { obj, after, kind } => {
                self.expect_kind(*obj, ObjKind::List, "insert_object")?;
                let child = ObjId::Op(op.id);
                let mut deltas =
                    self.insert_elements(*obj, after, op, vec![Content::Object(child)])?;
                self.objects.insert(
                    child,
                    ObjEntry {
                        parent: Some((*obj, Prop::Elem(ElemId::new(op.id, 0)))),
                        state: ObjState::empty(*kind),
                    },
                );
                let value = self.materialize(child);
                for delta in &mut deltas {
                    delta.value = Some(value.clone());
                }
                Ok(deltas)
            }
            Action::Splice { obj, after, text } => {
                self.expect_kind(*obj, ObjKind::Text, "splice")?;
                self.insert_elements(*obj, after, op, text.chars().map(Content::Char).collect())
            }
            Action::Remove { obj, elems } => self.remove_elements(*obj, elems, op),
            Action::Increment { obj, delta } => {
                self.expect_kind(*obj, ObjKind::Counter, "increment")?;
                let path = self.path_of(*obj);
                let Some(ObjEntry {
                    state: ObjState::Counter(total),
                    ..
                }) = self.objects.get_mut(obj)
                else {
                    return Err(DocumentError::UnknownObject(*obj));
                };
                *total = total.wrapping_add(*delta);
                let value = Value::Int(*total);
                Ok(path
                    .filter(|_| *delta != 0)
                    .map(|path| self.delta(path, Some(value)))
                    .into_iter()
                    .collect())
            }
        }
    }

    fn lifecycle_delta(&self, was_visible: bool) -> Vec<Delta> {
        match (was_visible, self.exists()) {
            (false, true) => vec![self.delta(Vec::new(), Some(self.value()))],
            (true, false) => vec![self.delta(Vec::new(), None)],
            _ => Vec::new(),
        }
    }

    fn delta(&self, path: Vec<PathSegment>, value: Option<Value>) -> Delta {
        Delta {
            document: self.id,
            path,
            value,
        }
    }

    fn kind_of(&self, obj: ObjId) -> Result<ObjKind, DocumentError> {
        self.objects
            .get(&obj)
            .map(|e| e.state.kind())
            .ok_or(DocumentError::UnknownObject(obj))
    }

    fn expect_kind(&self, obj: ObjId, kind: ObjKind, action: &'static str) -> Result<(), DocumentError> {
        let actual = self.kind_of(obj)?;
        if actual != kind {
            return Err(DocumentError::TypeMismatch { action, kind: actual });
        }
        Ok(())
    }

    fn register(&self, obj: ObjId, field: &str) -> Option<&Register> {
        match &self.objects.get(&obj)?.state {
            ObjState::Map(fields) => fields.get(field),
            _ => None,
        }
    }

    fn field_value(&self, obj: ObjId, field: &str) -> Option<Value> {
        self.register(obj, field)
            .and_then(Register::visible)
            .map(|slot| self.materialize_slot(slot))
    }

    fn write_register(
        &mut self,
        obj: ObjId,
        field: &str,
        key: LwwKey,
        slot: Slot,
        op: &Operation,
        action: &'static str,
    ) -> Result<Vec<Delta>, DocumentError> {
        self.expect_kind(obj, ObjKind::Map, action)?;
        let path = self.path_of(obj);
        let before = path.as_ref().and_then(|_| self.field_value(obj, field));

        if let Some(ObjEntry {
            state: ObjState::Map(fields),
            ..
        }) = self.objects.get_mut(&obj)
        {
            fields.entry(field.to_string()).or_default().write(key, slot, &op.deps);
        }

        let Some(mut path) = path else {
            return Ok(Vec::new());
        };
        let after = self.field_value(obj, field);
        if before == after {
            return Ok(Vec::new());
        }
        path.push(PathSegment::Key(field.to_string()));
        Ok(vec![self.delta(path, after)])
    }

    fn insert_elements(
        &mut self,
        obj: ObjId,
        after: &ElemRef,
        op: &Operation,
        contents: Vec<Content>,
    ) -> Result<Vec<Delta>, DocumentError> {
        let path = self.path_of(obj);
        let entry = self.objects.get_mut(&obj).ok_or(DocumentError::UnknownObject(obj))?;
        let (elems, is_text) = match &mut entry.state {
            ObjState::List(e) => (e, false),
            ObjState::Text(e) => (e, true),
            other => {
                return Err(DocumentError::TypeMismatch {
                    action: op.action.name(),
                    kind: other.kind(),
                })
            }
        };
        if let ElemRef::Elem(anchor) = after {
            if position_of(elems, anchor).is_none() {
                return Err(DocumentError::UnknownElement(*anchor));
            }
        }

        let mut anchor = *after;
        let mut inserted = Vec::with_capacity(contents.len());
        for (offset, content) in contents.into_iter().enumerate() {
            let offset = offset as u32;
            let key = ElemKey::new(op, offset);
            let pos = insert_position(elems, &anchor, &key)?;
            let id = ElemId::new(op.id, offset);
            let value = match &content {
                Content::Value(v) => Some(v.clone()),
                _ => None,
            };
            elems.insert(
                pos,
                Element {
                    id,
                    key,
                    content,
                    deleted_by: None,
                },
            );
            inserted.push((visible_index(elems, pos), value));
            anchor = ElemRef::Elem(id);
        }

        let Some(path) = path else {
            return Ok(Vec::new());
        };
        if is_text {
            let text = text_of(elems);
            return Ok(vec![self.delta(path, Some(Value::String(text)))]);
        }
        Ok(inserted
            .into_iter()
            .map(|(index, value)| {
                let mut p = path.clone();
                p.push(PathSegment::Index(index));
                Delta {
                    document: self.id,
                    path: p,
                    value: Some(value.unwrap_or(Value::Null)),
                }
            })
            .collect())
    }

    fn remove_elements(
        &mut self,
        obj: ObjId,
        targets: &[ElemId],
        op: &Operation,
    ) -> Result<Vec<Delta>, DocumentError> {
        let path = self.path_of(obj);
        let id = self.id;
        let entry = self.objects.get_mut(&obj).ok_or(DocumentError::UnknownObject(obj))?;
        let (elems, is_text) = match &mut entry.state {
            ObjState::List(e) => (e, false),
            ObjState::Text(e) => (e, true),
            other => {
                return Err(DocumentError::TypeMismatch {
                    action: "remove",
                    kind: other.kind(),
                })
            }
        };
        let mut positions = Vec::with_capacity(targets.len());
        for target in targets {
            positions.push(position_of(elems, target).ok_or(DocumentError::UnknownElement(*target))?);
        }

        let mut removed_at = Vec::new();
        for pos in positions {
            let elem = &mut elems[pos];
            match elem.deleted_by {
                None => {
                    elem.deleted_by = Some(op.id);
                    removed_at.push(pos);
                }
                Some(by) if op.id < by => elem.deleted_by = Some(op.id),
                Some(_) => {}
            }
        }

        let Some(path) = path else {
            return Ok(Vec::new());
        };
        if removed_at.is_empty() {
            return Ok(Vec::new());
        }
        if is_text {
            let text = text_of(elems);
            return Ok(vec![Delta {
                document: id,
                path,
                value: Some(Value::String(text)),
            }]);
        }
        // Report from the back so earlier indices stay valid while replaying.
        removed_at.sort_unstable();
        Ok(removed_at
            .into_iter()
            .rev()
            .map(|pos| {
                let mut p = path.clone();
                p.push(PathSegment::Index(visible_index(elems, pos)));
                Delta {
                    document: id,
                    path: p,
                    value: None,
                }
            })
            .collect())
    }

    /// Visible path to a container, `None` if it is not reachable from the root.
    fn path_of(&self, obj: ObjId) -> Option<Vec<PathSegment>> {
        let mut segments = Vec::new();
        let mut current = obj;
        while current != ObjId::Root {
            let entry = self.objects.get(&current)?;
            let (parent, prop) = entry.parent.as_ref()?;
            match prop {
                Prop::Key(k) => {
                    match self.register(*parent, k).and_then(Register::visible) {
                        Some(Slot::Object(id)) if *id == current => {}
                        _ => return None,
                    }
                    segments.push(PathSegment::Key(k.clone()));
                }
                Prop::Elem(elem) => {
                    let elems = self.objects.get(parent)?.state.elements()?;
                    let pos = position_of(elems, elem)?;
                    if !elems[pos].is_visible() {
                        return None;
                    }
                    segments.push(PathSegment::Index(visible_index(elems, pos)));
                }
            }
            current = *parent;
        }
        segments.reverse();
        Some(segments)
    }

    // ─── Materialization ─────────────────────────────────────

    /// The whole visible document as a value.
    pub fn value(&self) -> Value {
        self.materialize(ObjId::Root)
    }

    /// Visible value at `path`.
    pub fn get(&self, path: &[PathSegment]) -> Option<Value> {
        Some(match self.resolve(path)? {
            Target::Value(v) => v.clone(),
            Target::Object(id) => self.materialize(id),
            Target::Char(c) => Value::String(c.to_string()),
        })
    }

    /// All concurrent values of a map field, winner first.
    pub fn conflicts(&self, path: &[PathSegment]) -> Vec<Value> {
        let Some((PathSegment::Key(field), parent)) = path.split_last() else {
            return Vec::new();
        };
        let Ok(obj) = self.object_at(parent) else {
            return Vec::new();
        };
        let Some(register) = self.register(obj, field) else {
            return Vec::new();
        };
        register
            .writes
            .values()
            .rev()
            .filter(|slot| !matches!(slot, Slot::Tombstone))
            .map(|slot| self.materialize_slot(slot))
            .collect()
    }

    fn materialize_slot(&self, slot: &Slot) -> Value {
        match slot {
            Slot::Value(v) => v.clone(),
            Slot::Object(id) => self.materialize(*id),
            Slot::Tombstone => Value::Null,
        }
    }

    fn materialize(&self, obj: ObjId) -> Value {
        let Some(entry) = self.objects.get(&obj) else {
            return Value::Null;
        };
        match &entry.state {
            ObjState::Map(fields) => Value::Map(
                fields
                    .iter()
                    .filter_map(|(k, r)| r.visible().map(|slot| (k.clone(), self.materialize_slot(slot))))
                    .collect(),
            ),
            ObjState::List(elems) => Value::List(
                elems
                    .iter()
                    .filter(|e| e.is_visible())
                    .map(|e| match &e.content {
                        Content::Value(v) => v.clone(),
                        Content::Object(id) => self.materialize(*id),
                        Content::Char(c) => Value::String(c.to_string()),
                    })
                    .collect(),
            ),
            ObjState::Text(elems) => Value::String(text_of(elems)),
            ObjState::Counter(total) => Value::Int(*total),
        }
    }

    fn resolve(&self, path: &[PathSegment]) -> Option<Target<'_>> {
        let mut current = ObjId::Root;
        for (i, segment) in path.iter().enumerate() {
            let entry = self.objects.get(&current)?;
            let target = match (segment, &entry.state) {
                (PathSegment::Key(k), ObjState::Map(fields)) => match fields.get(k)?.visible()? {
                    Slot::Value(v) => Target::Value(v),
                    Slot::Object(id) => Target::Object(*id),
                    Slot::Tombstone => return None,
                },
                (PathSegment::Index(idx), ObjState::List(elems) | ObjState::Text(elems)) => {
                    let pos = nth_visible(elems, *idx)?;
                    match &elems[pos].content {
                        Content::Value(v) => Target::Value(v),
                        Content::Object(id) => Target::Object(*id),
                        Content::Char(c) => Target::Char(*c),
                    }
                }
                _ => return None,
            };
            match target {
                Target::Object(id) => current = id,
                other if i + 1 == path.len() => return Some(other),
                _ => return None,
            }
        }
        Some(Target::Object(current))
    }

    fn object_at(&self, path: &[PathSegment]) -> Result<ObjId, DocumentError> {
        match self.resolve(path) {
            Some(Target::Object(id)) => Ok(id),
            _ => Err(DocumentError::InvalidPath(path_string(path))),
        }
    }

    fn elements_of(&self, obj: ObjId) -> Result<&Vec<Element>, DocumentError> {
        let entry = self.objects.get(&obj).ok_or(DocumentError::UnknownObject(obj))?;
        entry.state.elements().ok_or(DocumentError::TypeMismatch {
            action: "index",
            kind: entry.state.kind(),
        })
    }

    // ─── Local mutation ──────────────────────────────────────

    fn base_deps(obj: ObjId) -> BTreeSet<OpId> {
        let mut deps = BTreeSet::new();
        if let ObjId::Op(id) = obj {
            deps.insert(id);
        }
        deps
    }

    fn make_op(&self, clock: &mut ActorClock, deps: BTreeSet<OpId>, action: Action) -> Operation {
        Operation {
            id: clock.next(),
            lamport: self.max_lamport + 1,
            deps,
            document: self.id,
            action,
        }
    }

    fn commit_local(&mut self, op: Operation) -> Result<Applied, DocumentError> {
        let deltas = self.apply(&op)?;
        Ok(Applied { op, deltas })
    }

    /// Marks the document as created, optionally with a schema name.
    pub fn local_create(&mut self, clock: &mut ActorClock, schema: Option<&str>) -> Result<Applied, DocumentError> {
        let deps = self.lifecycle.heads().collect();
        let op = self.make_op(
            clock,
            deps,
            Action::CreateDocument {
                schema: schema.map(str::to_string),
            },
        );
        self.commit_local(op)
    }

    pub fn local_delete_document(&mut self, clock: &mut ActorClock) -> Result<Applied, DocumentError> {
        let deps = self.lifecycle.heads().collect();
        let op = self.make_op(clock, deps, Action::DeleteDocument);
        self.commit_local(op)
    }

    fn field_target(&self, path: &[PathSegment]) -> Result<(ObjId, String), DocumentError> {
        match path.split_last() {
            Some((PathSegment::Key(field), parent)) => {
                let obj = self.object_at(parent)?;
                let kind = self.kind_of(obj)?;
                if kind != ObjKind::Map {
                    return Err(DocumentError::TypeMismatch { action: "put", kind });
                }
                Ok((obj, field.clone()))
            }
            _ => Err(DocumentError::InvalidPath(path_string(path))),
        }
    }

    fn field_deps(&self, obj: ObjId, field: &str) -> BTreeSet<OpId> {
        let mut deps = Self::base_deps(obj);
        if let Some(register) = self.register(obj, field) {
            deps.extend(register.heads());
        }
        deps
    }

    /// Writes a scalar into the map field at `path`.
    pub fn local_put(
        &mut self,
        clock: &mut ActorClock,
        path: &[PathSegment],
        value: Value,
    ) -> Result<Applied, DocumentError> {
        codec::validate(&value).map_err(DocumentError::Unencodable)?;
        let (obj, key) = self.field_target(path)?;
        let deps = self.field_deps(obj, &key);
        let op = self.make_op(clock, deps, Action::Put { obj, key, value });
        self.commit_local(op)
    }

    /// Creates an empty container in the map field at `path`.
    pub fn local_make(
        &mut self,
        clock: &mut ActorClock,
        path: &[PathSegment],
        kind: ObjKind,
    ) -> Result<Applied, DocumentError> {
        let (obj, key) = self.field_target(path)?;
        let deps = self.field_deps(obj, &key);
        let op = self.make_op(clock, deps, Action::MakeObject { obj, key, kind });
        self.commit_local(op)
    }

    /// Deletes a map field, or a list element when the path ends in an index.
    pub fn local_delete(&mut self, clock: &mut ActorClock, path: &[PathSegment]) -> Result<Applied, DocumentError> {
        match path.split_last() {
            Some((PathSegment::Index(index), parent)) => {
                let obj = self.object_at(parent)?;
                let elems = self.elements_of(obj)?;
                let pos = nth_visible(elems, *index).ok_or(DocumentError::IndexOutOfBounds {
                    index: *index,
                    len: visible_len(elems),
                })?;
                let elem = elems[pos].id;
                let mut deps = Self::base_deps(obj);
                deps.insert(elem.op);
                let op = self.make_op(clock, deps, Action::Remove { obj, elems: vec![elem] });
                self.commit_local(op)
            }
            _ => {
                let (obj, key) = self.field_target(path)?;
                let deps = self.field_deps(obj, &key);
                let op = self.make_op(clock, deps, Action::Delete { obj, key });
                self.commit_local(op)
            }
        }
    }

    fn anchor(&self, obj: ObjId, index: usize) -> Result<(ElemRef, BTreeSet<OpId>), DocumentError> {
        let elems = self.elements_of(obj)?;
        let len = visible_len(elems);
        if index > len {
            return Err(DocumentError::IndexOutOfBounds { index, len });
        }
        let mut deps = Self::base_deps(obj);
        if index == 0 {
            return Ok((ElemRef::Head, deps));
        }
        let pos = nth_visible(elems, index - 1).ok_or(DocumentError::IndexOutOfBounds { index, len })?;
        let id = elems[pos].id;
        deps.insert(id.op);
        Ok((ElemRef::Elem(id), deps))
    }

    /// Inserts a scalar into the list at `path` so that it lands at `index`.
    pub fn local_insert(
        &mut self,
        clock: &mut ActorClock,
        path: &[PathSegment],
        index: usize,
        value: Value,
    ) -> Result<Applied, DocumentError> {
        codec::validate(&value).map_err(DocumentError::Unencodable)?;
        let obj = self.object_at(path)?;
        self.expect_kind(obj, ObjKind::List, "insert")?;
        let (after, deps) = self.anchor(obj, index)?;
        let op = self.make_op(clock, deps, Action::Insert { obj, after, value });
        self.commit_local(op)
    }

    pub fn local_insert_object(
        &mut self,
        clock: &mut ActorClock,
        path: &[PathSegment],
        index: usize,
        kind: ObjKind,
    ) -> Result<Applied, DocumentError> {
        let obj = self.object_at(path)?;
        self.expect_kind(obj, ObjKind::List, "insert_object")?;
        let (after, deps) = self.anchor(obj, index)?;
        let op = self.make_op(clock, deps, Action::InsertObject { obj, after, kind });
        self.commit_local(op)
    }

    /// Replaces `delete` characters at `index` with `text`.
    ///
    /// Produces up to two operations: a removal, then an insertion.
    pub fn local_splice_text(
        &mut self,
        clock: &mut ActorClock,
        path: &[PathSegment],
        index: usize,
        delete: usize,
        text: &str,
    ) -> Result<Vec<Applied>, DocumentError> {
        let obj = self.object_at(path)?;
        self.expect_kind(obj, ObjKind::Text, "splice")?;
        let elems = self.elements_of(obj)?;
        let len = visible_len(elems);
        if index + delete > len {
            return Err(DocumentError::IndexOutOfBounds {
                index: index + delete,
                len,
            });
        }
        let (after, insert_deps) = self.anchor(obj, index)?;

        let mut out = Vec::new();
        if delete > 0 {
            let removed: Vec<ElemId> = elems
                .iter()
                .filter(|e| e.is_visible())
                .skip(index)
                .take(delete)
                .map(|e| e.id)
                .collect();
            let mut deps = Self::base_deps(obj);
            deps.extend(removed.iter().map(|e| e.op));
            let op = self.make_op(clock, deps, Action::Remove { obj, elems: removed });
            out.push(self.commit_local(op)?);
        }
        if !text.is_empty() {
            let op = self.make_op(
                clock,
                insert_deps,
                Action::Splice {
                    obj,
                    after,
                    text: text.to_string(),
                },
            );
            out.push(self.commit_local(op)?);
        }
        Ok(out)
    }

    pub fn local_increment(
        &mut self,
        clock: &mut ActorClock,
        path: &[PathSegment],
        delta: i64,
    ) -> Result<Applied, DocumentError> {
        let obj = self.object_at(path)?;
        self.expect_kind(obj, ObjKind::Counter, "increment")?;
        let op = self.make_op(clock, Self::base_deps(obj), Action::Increment { obj, delta });
        self.commit_local(op)
    }

    // ─── Tombstones ──────────────────────────────────────────

    /// Number of tombstoned list/text elements and map fields.
    pub fn tombstone_count(&self) -> usize {
        self.objects
            .values()
            .map(|entry| match &entry.state {
                ObjState::Map(fields) => fields
                    .values()
                    .filter(|r| matches!(r.winner(), Some((_, Slot::Tombstone))))
                    .count(),
                ObjState::List(e) | ObjState::Text(e) => e.iter().filter(|e| !e.is_visible()).count(),
                ObjState::Counter(_) => 0,
            })
            .sum()
    }

    /// Physically drops tombstones whose deleting operation `is_stable`.
    ///
    /// Only safe once every actor has observed the deletion: no operation
    /// still in flight can anchor on a purged element.
    pub fn purge_tombstones(&mut self, is_stable: impl Fn(&OpId) -> bool) -> usize {
        let mut purged = 0;
        for entry in self.objects.values_mut() {
            match &mut entry.state {
                ObjState::Map(fields) => {
                    fields.retain(|_, register| {
                        let drop = register.writes.len() == 1
                            && matches!(
                                register.winner(),
                                Some((key, Slot::Tombstone)) if is_stable(&key.op_id())
                            );
                        purged += usize::from(drop);
                        !drop
                    });
                }
                ObjState::List(elems) | ObjState::Text(elems) => {
                    elems.retain(|e| {
                        let drop = e.deleted_by.as_ref().is_some_and(&is_stable);
                        purged += usize::from(drop);
                        !drop
                    });
                }
                ObjState::Counter(_) => {}
            }
        }
        purged
    }
}
