//! Space: a set of documents plus membership, backed by one change log.
//!
//! ```text
//!   mutate(doc, |tx| ...)          apply_remote(change)
//!        │ local ops                     │
//!        ▼                               ▼
//!   ChangeBuilder::sign ──────────► ChangeLog::append_with
//!                                        │  admit:     causal capability check
//!                                        │  persist:   ChangeStore
//!                                        │  integrate: Document::apply + Membership::record
//!                                        ▼
//!                        observers (deltas) + commit listeners
//!                                        │
//!                          every `snapshot_interval` commits
//!                                        ▼
//!                       LZ4(bincode(frontier, documents, membership))
//! ```
//!
//! A space is single-writer: it is owned by one task and mutated through
//! `&mut self`. A storage failure poisons the space; it must be reopened.

use crate::capability::{Access, Capability, CapabilityProvider, Forbidden, KeyDerivedProvider};
use crate::change::{Change, ChangeBuilder, ChangeError};
use crate::changelog::{AppendError, AppendReport, ChangeLog, ChangesSince, Integrator, LogConfig};
use crate::document::{Applied, Delta, Document, DocumentError};
use crate::frontier::Frontier;
use crate::ids::{ActorId, ChangeHash, DocumentId, Identity, OpId, SpaceId};
use crate::membership::Membership;
use crate::observe::{CommitNotice, Observers, SubscriptionId};
use crate::op::{ActorClock, ObjKind, Operation};
use crate::registry::{SchemaError, SchemaRegistry};
use crate::store::{ChangeStore, MemoryStore, StorageError};
use crate::value::{PathSegment, Reference, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Schema name carried by the membership document.
pub const MEMBERSHIP_SCHEMA: &str = "echo.Membership";

const SNAPSHOT_VERSION: u32 = 1;

// ─── Configuration ───────────────────────────────────────

/// What happens to deletion tombstones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TombstonePolicy {
    /// Keep every tombstone forever.
    #[default]
    Retain,
    /// Purge tombstones once every member has reported seeing the deletion.
    PurgeStable,
}

#[derive(Debug, Clone)]
pub struct SpaceConfig {
    pub log: LogConfig,
    /// Committed changes between automatic snapshots. 0 disables them.
    pub snapshot_interval: u64,
    /// Whether `open` starts from the stored snapshot or replays everything.
    pub use_snapshot: bool,
    pub tombstones: TombstonePolicy,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            snapshot_interval: 256,
            use_snapshot: true,
            tombstones: TombstonePolicy::Retain,
        }
    }
}

impl SpaceConfig {
    pub fn for_testing() -> Self {
        Self {
            log: LogConfig::for_testing(),
            snapshot_interval: 4,
            use_snapshot: true,
            tombstones: TombstonePolicy::Retain,
        }
    }
}

// ─── Errors ──────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SpaceError {
    #[error(transparent)]
    Append(#[from] AppendError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Change(#[from] ChangeError),
    #[error("document {0} not found")]
    DocumentNotFound(DocumentId),
    #[error("{actor} lacks {access:?} access")]
    NotAuthorized { actor: ActorId, access: Access },
    #[error("space storage failed earlier; reopen the space")]
    Poisoned,
    #[error("snapshot error: {0}")]
    Snapshot(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl SpaceError {
    /// The change was refused by a capability check.
    pub fn is_forbidden(&self) -> bool {
        matches!(
            self,
            SpaceError::NotAuthorized { .. } | SpaceError::Append(AppendError::Forbidden(_))
        )
    }
}

#[derive(Debug, Error)]
pub enum AdmitError {
    #[error("{0} is not an admin of this space")]
    NotAuthorized(ActorId),
    #[error("the space owner cannot be revoked")]
    OwnerImmutable,
    #[error(transparent)]
    Space(#[from] SpaceError),
}

// ─── State ───────────────────────────────────────────────

/// Everything derived from the log: exactly what a snapshot holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SpaceState {
    documents: BTreeMap<DocumentId, Document>,
    membership: Membership,
}

impl SpaceState {
    fn new(owner: ActorId) -> Self {
        Self {
            documents: BTreeMap::new(),
            membership: Membership::new(owner),
        }
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    frontier: &'a Frontier,
    state: &'a SpaceState,
}

#[derive(Deserialize)]
struct SnapshotOwned {
    version: u32,
    frontier: Frontier,
    state: SpaceState,
}

/// Applies committed changes to the materialized state.
struct Applier<'a> {
    space: SpaceId,
    state: &'a mut SpaceState,
    provider: &'a dyn CapabilityProvider,
    deltas: Vec<Delta>,
}

impl Integrator for Applier<'_> {
    fn admit(&mut self, change: &Change) -> Result<(), Forbidden> {
        let access = if change.ops.iter().any(|op| op.document.is_membership()) {
            Access::Admit
        } else {
            Access::Write
        };
        let forbidden = |reason: String| Forbidden {
            actor: change.actor,
            seq: change.seq,
            reason,
        };
        let context = change.context();
        match self.state.membership.capability_at(&change.actor, &context) {
            Some(cap) if cap.allows(access) => {}
            found => {
                return Err(forbidden(format!(
                    "{access:?} needed, causal context grants {}",
                    found.map_or("nothing", Capability::as_str)
                )))
            }
        }
        if !self.provider.check_capability(&change.actor, &self.space, access) {
            return Err(forbidden("denied by identity provider".into()));
        }
        Ok(())
    }

    fn integrate(&mut self, change: &Change) {
        for op in &change.ops {
            let doc = self
                .state
                .documents
                .entry(op.document)
                .or_insert_with(|| Document::new(op.document));
            match doc.apply(op) {
                Ok(deltas) => {
                    self.deltas.extend(deltas);
                    self.state.membership.record(change, op);
                }
                Err(e) => log::warn!(
                    "Skipping op {:?} ({}) of change {}:{}: {e}",
                    op.id,
                    op.action.name(),
                    change.actor,
                    change.seq
                ),
            }
        }
    }
}

// ─── Builder ─────────────────────────────────────────────

pub struct SpaceBuilder {
    identity: Identity,
    store: Arc<dyn ChangeStore>,
    provider: Arc<dyn CapabilityProvider>,
    registry: Arc<SchemaRegistry>,
    config: SpaceConfig,
}

impl SpaceBuilder {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            store: Arc::new(MemoryStore::new()),
            provider: Arc::new(KeyDerivedProvider),
            registry: Arc::new(SchemaRegistry::new()),
            config: SpaceConfig::default(),
        }
    }

    pub fn store(mut self, store: Arc<dyn ChangeStore>) -> Self {
        self.store = store;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn CapabilityProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(mut self, config: SpaceConfig) -> Self {
        self.config = config;
        self
    }

    /// Creates a new space owned by this identity.
    pub fn create(self) -> Result<Space, SpaceError> {
        let id = SpaceId::new();
        let owner = self.identity.actor();
        let log = ChangeLog::new(id, self.store.clone(), self.provider.clone(), self.config.log.clone());
        let mut space = self.assemble(id, log, SpaceState::new(owner), 0);

        space
            .state
            .documents
            .insert(DocumentId::MEMBERSHIP, Document::new(DocumentId::MEMBERSHIP));
        space.mutate(DocumentId::MEMBERSHIP, |tx| {
            tx.create(Some(MEMBERSHIP_SCHEMA))?;
            tx.put(&[PathSegment::Key(owner.to_hex())], Capability::Admin.as_str())
        })?;
        log::info!("Created space {id} owned by {owner}");
        Ok(space)
    }

    /// Joins a space created elsewhere. Its content arrives through sync.
    pub fn join(self, space: SpaceId, owner: ActorId) -> Result<Space, SpaceError> {
        log::info!("Joining space {space} owned by {owner}");
        self.open(space, owner)
    }

    /// Opens a space from the store: snapshot first, then later changes.
    pub fn open(self, space: SpaceId, owner: ActorId) -> Result<Space, SpaceError> {
        let log = ChangeLog::load(space, self.store.clone(), self.provider.clone(), self.config.log.clone())?;

        let mut state = SpaceState::new(owner);
        let mut from = Frontier::new();
        if self.config.use_snapshot {
            match load_snapshot(self.store.as_ref(), space) {
                Ok(Some(snap)) if log.frontier().dominates(&snap.frontier) && snap.state.membership.owner() == owner => {
                    state = snap.state;
                    from = snap.frontier;
                }
                Ok(Some(_)) => log::warn!("Ignoring snapshot of space {space} that does not match its log"),
                Ok(None) => {}
                Err(e) => log::warn!("Ignoring unreadable snapshot of space {space}: {e}"),
            }
        }

        let mut replayed = 0u64;
        {
            let mut applier = Applier {
                space,
                state: &mut state,
                provider: self.provider.as_ref(),
                deltas: Vec::new(),
            };
            for change in log.changes_since(&from) {
                applier.integrate(change);
                replayed += 1;
            }
        }
        log::info!(
            "Opened space {space}: {} documents, {} changes ({replayed} replayed)",
            state.documents.len(),
            log.len()
        );
        Ok(self.assemble(space, log, state, replayed))
    }

    fn assemble(self, id: SpaceId, log: ChangeLog, state: SpaceState, since_snapshot: u64) -> Space {
        let actor = self.identity.actor();
        Space {
            id,
            clock: ActorClock::resume(actor, last_op_seq(&log, &actor)),
            identity: self.identity,
            log,
            state,
            store: self.store,
            provider: self.provider,
            registry: self.registry,
            observers: Observers::new(),
            config: self.config,
            since_snapshot,
            poisoned: false,
        }
    }
}

fn load_snapshot(store: &dyn ChangeStore, space: SpaceId) -> Result<Option<SnapshotOwned>, SpaceError> {
    let Some(bytes) = store.load_snapshot(space)? else {
        return Ok(None);
    };
    let raw = lz4_flex::decompress_size_prepended(&bytes).map_err(|e| SpaceError::Snapshot(e.to_string()))?;
    let (snap, _): (SnapshotOwned, usize) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| SpaceError::Snapshot(e.to_string()))?;
    if snap.version != SNAPSHOT_VERSION {
        return Err(SpaceError::Snapshot(format!("unsupported version {}", snap.version)));
    }
    Ok(Some(snap))
}

/// Highest operation counter used by `actor` in its committed changes.
fn last_op_seq(log: &ChangeLog, actor: &ActorId) -> u64 {
    let head = log.head(actor).map_or(0, |(seq, _)| seq);
    log.range(actor, 1, head)
        .iter()
        .rev()
        .find_map(|c| c.ops.last().map(|op| op.id.seq))
        .unwrap_or(0)
}

/// Sequence of the change that carried operation `op`.
fn change_of(log: &ChangeLog, op: &OpId) -> Option<u64> {
    let head = log.head(&op.actor)?.0;
    log.range(&op.actor, 1, head)
        .iter()
        .find(|c| c.ops.iter().any(|o| o.id == *op))
        .map(|c| c.seq)
}

// ─── Handles ─────────────────────────────────────────────

/// A document created in a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentHandle {
    pub space: SpaceId,
    pub document: DocumentId,
}

impl DocumentHandle {
    /// Reference to this document as seen from another space.
    pub fn reference(&self) -> Reference {
        Reference {
            space: Some(self.space),
            document: self.document,
        }
    }
}

/// Local edits to one document, committed as a single change.
pub struct Transaction<'a> {
    doc: &'a mut Document,
    clock: &'a mut ActorClock,
    ops: Vec<Operation>,
    deltas: Vec<Delta>,
}

impl Transaction<'_> {
    fn record(&mut self, applied: Applied) -> Operation {
        self.deltas.extend(applied.deltas);
        self.ops.push(applied.op.clone());
        applied.op
    }

    pub fn document(&self) -> &Document {
        self.doc
    }

    pub fn get(&self, path: &[PathSegment]) -> Option<Value> {
        self.doc.get(path)
    }

    pub fn create(&mut self, schema: Option<&str>) -> Result<Operation, DocumentError> {
        let applied = self.doc.local_create(self.clock, schema)?;
        Ok(self.record(applied))
    }

    pub fn delete_document(&mut self) -> Result<Operation, DocumentError> {
        let applied = self.doc.local_delete_document(self.clock)?;
        Ok(self.record(applied))
    }

    pub fn put(&mut self, path: &[PathSegment], value: impl Into<Value>) -> Result<Operation, DocumentError> {
        let applied = self.doc.local_put(self.clock, path, value.into())?;
        Ok(self.record(applied))
    }

    pub fn make(&mut self, path: &[PathSegment], kind: ObjKind) -> Result<Operation, DocumentError> {
        let applied = self.doc.local_make(self.clock, path, kind)?;
        Ok(self.record(applied))
    }

    pub fn delete(&mut self, path: &[PathSegment]) -> Result<Operation, DocumentError> {
        let applied = self.doc.local_delete(self.clock, path)?;
        Ok(self.record(applied))
    }

    pub fn insert(
        &mut self,
        path: &[PathSegment],
        index: usize,
        value: impl Into<Value>,
    ) -> Result<Operation, DocumentError> {
        let applied = self.doc.local_insert(self.clock, path, index, value.into())?;
        Ok(self.record(applied))
    }

    pub fn insert_object(
        &mut self,
        path: &[PathSegment],
        index: usize,
        kind: ObjKind,
    ) -> Result<Operation, DocumentError> {
        let applied = self.doc.local_insert_object(self.clock, path, index, kind)?;
        Ok(self.record(applied))
    }

    pub fn splice_text(
        &mut self,
        path: &[PathSegment],
        index: usize,
        delete: usize,
        text: &str,
    ) -> Result<Vec<Operation>, DocumentError> {
        let applied = self.doc.local_splice_text(self.clock, path, index, delete, text)?;
        Ok(applied.into_iter().map(|a| self.record(a)).collect())
    }

    pub fn increment(&mut self, path: &[PathSegment], delta: i64) -> Result<Operation, DocumentError> {
        let applied = self.doc.local_increment(self.clock, path, delta)?;
        Ok(self.record(applied))
    }
}

// ─── Space ───────────────────────────────────────────────

pub struct Space {
    id: SpaceId,
    identity: Identity,
    clock: ActorClock,
    log: ChangeLog,
    state: SpaceState,
    store: Arc<dyn ChangeStore>,
    provider: Arc<dyn CapabilityProvider>,
    registry: Arc<SchemaRegistry>,
    observers: Observers,
    config: SpaceConfig,
    since_snapshot: u64,
    poisoned: bool,
}

impl Space {
    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn owner(&self) -> ActorId {
        self.state.membership.owner()
    }

    pub fn local_actor(&self) -> ActorId {
        self.identity.actor()
    }

    pub fn config(&self) -> &SpaceConfig {
        &self.config
    }

    pub fn frontier(&self) -> &Frontier {
        self.log.frontier()
    }

    pub fn log(&self) -> &ChangeLog {
        &self.log
    }

    pub fn membership(&self) -> &Membership {
        &self.state.membership
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn document(&self, id: DocumentId) -> Option<&Document> {
        self.state.documents.get(&id)
    }

    /// Ids of documents that exist and are not deleted, membership excluded.
    pub fn document_ids(&self) -> Vec<DocumentId> {
        self.state
            .documents
            .values()
            .filter(|d| d.exists() && !d.id().is_membership())
            .map(Document::id)
            .collect()
    }

    // ─── Documents ───────────────────────────────────────

    pub fn create_document(&mut self, schema: Option<&str>) -> Result<DocumentHandle, SpaceError> {
        self.create_document_with(schema, BTreeMap::new())
    }

    /// Creates a document and fills its root fields in the same change.
    pub fn create_document_with(
        &mut self,
        schema: Option<&str>,
        initial: BTreeMap<String, Value>,
    ) -> Result<DocumentHandle, SpaceError> {
        let document = DocumentId::new();
        self.state.documents.insert(document, Document::new(document));
        let result = self.mutate(document, |tx| {
            tx.create(schema)?;
            for (field, value) in initial {
                tx.put(&[PathSegment::Key(field)], value)?;
            }
            Ok(())
        });
        if let Err(e) = result {
            self.state.documents.remove(&document);
            return Err(e);
        }
        log::debug!("Created document {document} in space {}", self.id);
        Ok(DocumentHandle { space: self.id, document })
    }

    pub fn delete_document(&mut self, document: DocumentId) -> Result<(), SpaceError> {
        self.mutate(document, |tx| tx.delete_document().map(|_| ()))
    }

    /// Runs `edit` against `document` and commits its operations as one change.
    ///
    /// If `edit` fails or the change cannot be committed, the document is
    /// left exactly as it was.
    pub fn mutate<R>(
        &mut self,
        document: DocumentId,
        edit: impl FnOnce(&mut Transaction<'_>) -> Result<R, DocumentError>,
    ) -> Result<R, SpaceError> {
        if self.poisoned {
            return Err(SpaceError::Poisoned);
        }
        let actor = self.identity.actor();
        let access = if document.is_membership() {
            Access::Admit
        } else {
            Access::Write
        };
        if !self.check_capability(&actor, access) {
            return Err(SpaceError::NotAuthorized { actor, access });
        }

        let mark = self.clock.peek();
        let doc = self
            .state
            .documents
            .get_mut(&document)
            .ok_or(SpaceError::DocumentNotFound(document))?;
        let backup = doc.clone();
        let mut tx = Transaction {
            doc,
            clock: &mut self.clock,
            ops: Vec::new(),
            deltas: Vec::new(),
        };
        let result = edit(&mut tx);
        let Transaction { ops, deltas, .. } = tx;

        let committed = match result {
            Ok(value) if ops.is_empty() => return Ok(value),
            Ok(value) => self.commit_local(ops).map(|_| value),
            Err(e) => Err(e.into()),
        };
        match committed {
            Ok(value) => {
                self.observers.dispatch(&deltas);
                Ok(value)
            }
            Err(e) => {
                self.state.documents.insert(document, backup);
                self.clock.rewind(mark);
                Err(e)
            }
        }
    }

    /// Writes one scalar field as its own change.
    pub fn local_mutate(
        &mut self,
        document: DocumentId,
        path: &[PathSegment],
        value: impl Into<Value>,
    ) -> Result<Operation, SpaceError> {
        self.mutate(document, |tx| tx.put(path, value))
    }

    fn commit_local(&mut self, ops: Vec<Operation>) -> Result<ChangeHash, SpaceError> {
        let actor = self.identity.actor();
        let (seq, prev) = match self.log.head(&actor) {
            Some((seq, hash)) => (seq + 1, Some(hash)),
            None => (1, None),
        };
        let change = ChangeBuilder::new(seq)
            .prev(prev)
            .deps(self.log.frontier().clone())
            .ops(ops)
            .sign(&self.identity)?;
        let hash = change.hash()?;
        self.append(change, Some(hash))?;
        log::trace!("Committed local change {actor}:{seq} in space {}", self.id);
        Ok(hash)
    }

    /// Integrates a change received from a peer.
    pub fn apply_remote(&mut self, change: Change) -> Result<AppendReport, SpaceError> {
        self.append(change, None)
    }

    fn append(&mut self, change: Change, local: Option<ChangeHash>) -> Result<AppendReport, SpaceError> {
        if self.poisoned {
            return Err(SpaceError::Poisoned);
        }
        let mut applier = Applier {
            space: self.id,
            state: &mut self.state,
            provider: self.provider.as_ref(),
            deltas: Vec::new(),
        };
        let result = self.log.append_with(change, &mut applier);
        let deltas = applier.deltas;
        self.observers.dispatch(&deltas);

        match result {
            Ok(report) => {
                for hash in &report.committed {
                    let Some(change) = self.log.get_by_hash(hash) else {
                        continue;
                    };
                    let notice = CommitNotice {
                        space: self.id,
                        actor: change.actor,
                        seq: change.seq,
                        hash: *hash,
                        local: local == Some(*hash),
                    };
                    self.observers.notify_commit(&notice);
                }
                self.after_commit(report.committed.len() as u64);
                Ok(report)
            }
            Err(AppendError::Storage(e)) => {
                log::error!("Space {} poisoned by storage failure: {e}", self.id);
                self.poisoned = true;
                Err(SpaceError::Storage(e))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn after_commit(&mut self, committed: u64) {
        self.since_snapshot += committed;
        let interval = self.config.snapshot_interval;
        if interval > 0 && self.since_snapshot >= interval {
            // The log stays authoritative; a failed snapshot is retried later.
            if let Err(e) = self.snapshot() {
                log::error!("Snapshot of space {} failed: {e}", self.id);
            }
        }
    }

    /// Changes not covered by `frontier`, dependencies first.
    pub fn changes_since(&self, frontier: &Frontier) -> ChangesSince<'_> {
        self.log.changes_since(frontier)
    }

    /// Drops held out-of-order changes of `actor` ahead of a resync.
    pub fn clear_pending(&mut self, actor: &ActorId) -> usize {
        self.log.clear_pending(actor)
    }

    // ─── Membership ──────────────────────────────────────

    /// Whether `actor` currently holds `access`, per membership and provider.
    pub fn check_capability(&self, actor: &ActorId, access: Access) -> bool {
        self.state
            .membership
            .current(actor)
            .is_some_and(|cap| cap.allows(access))
            && self.provider.check_capability(actor, &self.id, access)
    }

    pub fn admit_member(&mut self, member: ActorId, capability: Capability) -> Result<(), AdmitError> {
        self.write_grant(member, Some(capability))?;
        log::info!("Admitted {member} to space {} as {capability}", self.id);
        Ok(())
    }

    pub fn revoke_member(&mut self, member: ActorId) -> Result<(), AdmitError> {
        if member == self.owner() {
            return Err(AdmitError::OwnerImmutable);
        }
        self.write_grant(member, None)?;
        log::info!("Revoked {member} from space {}", self.id);
        Ok(())
    }

    fn write_grant(&mut self, member: ActorId, capability: Option<Capability>) -> Result<(), AdmitError> {
        let actor = self.identity.actor();
        if !self.check_capability(&actor, Access::Admit) {
            return Err(AdmitError::NotAuthorized(actor));
        }
        self.state
            .documents
            .entry(DocumentId::MEMBERSHIP)
            .or_insert_with(|| Document::new(DocumentId::MEMBERSHIP));
        let path = [PathSegment::Key(member.to_hex())];
        self.mutate(DocumentId::MEMBERSHIP, |tx| match capability {
            Some(cap) => tx.put(&path, cap.as_str()),
            None => tx.delete(&path),
        })?;
        Ok(())
    }

    // ─── Observation ─────────────────────────────────────

    pub fn subscribe(
        &mut self,
        document: DocumentId,
        callback: impl FnMut(&Delta) + Send + 'static,
    ) -> SubscriptionId {
        self.observers.subscribe(document, Box::new(callback))
    }

    pub fn subscribe_commits(&mut self, callback: impl FnMut(&CommitNotice) + Send + 'static) -> SubscriptionId {
        self.observers.subscribe_commits(Box::new(callback))
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    // ─── Persistence ─────────────────────────────────────

    /// Writes a snapshot of the materialized state at the current frontier.
    pub fn snapshot(&mut self) -> Result<(), SpaceError> {
        let snap = SnapshotRef {
            version: SNAPSHOT_VERSION,
            frontier: self.log.frontier(),
            state: &self.state,
        };
        let encoded = bincode::serde::encode_to_vec(&snap, bincode::config::standard())
            .map_err(|e| SpaceError::Snapshot(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);
        self.store.save_snapshot(self.id, &compressed)?;
        log::debug!(
            "Snapshot of space {} at {}: {} bytes ({} raw)",
            self.id,
            self.log.frontier(),
            compressed.len(),
            encoded.len()
        );
        self.since_snapshot = 0;
        Ok(())
    }

    /// Forgets the space locally. Peers are unaffected.
    pub fn destroy(self) -> Result<(), SpaceError> {
        self.store.delete_space(self.id)?;
        log::info!("Destroyed local copy of space {}", self.id);
        Ok(())
    }

    // ─── Inspection ──────────────────────────────────────

    /// Content digest of every known document.
    pub fn document_digests(&self) -> BTreeMap<DocumentId, [u8; 32]> {
        self.state.documents.iter().map(|(id, d)| (*id, d.digest())).collect()
    }

    /// Looks up the document a reference points to, if it lives in this space.
    pub fn resolve(&self, reference: &Reference) -> Option<&Document> {
        if reference.space.is_some_and(|s| s != self.id) {
            return None;
        }
        self.state.documents.get(&reference.document)
    }

    /// Checks a document against its registered schema, if any.
    pub fn validate_document(&self, document: DocumentId) -> Result<(), SpaceError> {
        let doc = self.document(document).ok_or(SpaceError::DocumentNotFound(document))?;
        match doc.schema() {
            Some(schema) if self.registry.contains(schema) => Ok(self.registry.validate(schema, &doc.value())?),
            _ => Ok(()),
        }
    }

    /// Purges tombstones every member has seen, per `TombstonePolicy`.
    ///
    /// `reports` maps members to the frontier their replica last announced.
    /// Nothing is purged unless every member reported and this replica has
    /// caught up with each member's own chain.
    pub fn collect_tombstones(&mut self, reports: &BTreeMap<ActorId, Frontier>) -> usize {
        if self.config.tombstones == TombstonePolicy::Retain {
            return 0;
        }
        let local = self.identity.actor();
        let ours = self.log.frontier();
        let mut stable: Option<Frontier> = None;
        for (member, _) in self.state.membership.members() {
            let report = if member == local {
                ours
            } else {
                match reports.get(&member) {
                    Some(report) => report,
                    None => return 0,
                }
            };
            if ours.get(&member) < report.get(&member) {
                return 0;
            }
            stable = Some(match stable {
                None => report.clone(),
                Some(acc) => acc
                    .iter()
                    .map(|(actor, seq)| (*actor, (*seq).min(report.get(actor))))
                    .filter(|(_, seq)| *seq > 0)
                    .collect(),
            });
        }
        let Some(stable) = stable else {
            return 0;
        };

        let log = &self.log;
        let mut purged = 0;
        for doc in self.state.documents.values_mut() {
            purged += doc.purge_tombstones(|op| change_of(log, op).is_some_and(|seq| stable.includes(&op.actor, seq)));
        }
        if purged > 0 {
            log::info!("Purged {purged} tombstones in space {}", self.id);
        }
        purged
    }
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("id", &self.id)
            .field("actor", &self.identity.actor())
            .field("frontier", self.log.frontier())
            .field("documents", &self.state.documents.len())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}
