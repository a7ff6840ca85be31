//! Causal change log.
//!
//! ```text
//!        append(change)
//!             │
//!   validate + verify signature
//!             │
//!     ┌───────┴────────┐
//!     │ predecessor or │──missing──► pending[(actor, seq) awaited]
//!     │ deps missing?  │                     │
//!     └───────┬────────┘                     │ released when the awaited
//!             │ ready                        │ change commits (cascade)
//!   Integrator::admit  ──Forbidden──► drop   │
//!             │                              │
//!   ChangeStore::append_change (durable) ◄───┘
//!             │
//!   Integrator::integrate (apply ops)
//! ```
//!
//! Per actor, changes commit in strict sequence order and every change
//! commits after the changes its frontier names. The pending buffer is
//! bounded per actor; overflowing it asks the caller for a full resync.
//!
//! Reference: Kleppmann, DDIA, Chapter 5 (causal ordering)

use crate::capability::{CapabilityProvider, Forbidden};
use crate::change::{Change, ChangeError};
use crate::frontier::Frontier;
use crate::ids::{ActorId, ChangeHash, SpaceId};
use crate::store::{ChangeStore, StorageError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Change log tuning.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Out-of-order changes held per authoring actor before giving up.
    pub max_pending_per_actor: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_pending_per_actor: 1024,
        }
    }
}

impl LogConfig {
    pub fn for_testing() -> Self {
        Self {
            max_pending_per_actor: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppendError {
    #[error("change {actor}:{seq} does not extend the chain at head {head}")]
    OutOfOrder { actor: ActorId, seq: u64, head: u64 },
    #[error("signature of change {actor}:{seq} does not verify")]
    SignatureInvalid { actor: ActorId, seq: u64 },
    #[error("actor {actor} published two different changes at seq {seq}")]
    DuplicateSequence { actor: ActorId, seq: u64 },
    #[error("pending buffer for {actor} exhausted ({limit} changes)")]
    PendingBufferExhausted { actor: ActorId, limit: usize },
    #[error("malformed change {actor}:{seq}: {reason}")]
    InvalidChange {
        actor: ActorId,
        seq: u64,
        reason: String,
    },
    #[error(transparent)]
    Forbidden(#[from] Forbidden),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl AppendError {
    /// Storage failures poison the owner; everything else only drops one change.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppendError::Storage(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Committed,
    /// Held until a missing predecessor or dependency arrives.
    Pending,
    /// Already committed with identical content.
    Duplicate,
}

/// What one `append` did, including changes released from the pending buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendReport {
    pub outcome: AppendOutcome,
    /// Every change committed by this call, in commit order.
    pub committed: Vec<ChangeHash>,
    /// Released pending changes that failed validation or admission.
    pub rejected: Vec<AppendError>,
}

impl AppendReport {
    fn new(outcome: AppendOutcome) -> Self {
        Self {
            outcome,
            committed: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

/// Hooks the log calls around committing a change.
pub trait Integrator {
    /// Authorization, evaluated right before the change is persisted.
    fn admit(&mut self, _change: &Change) -> Result<(), Forbidden> {
        Ok(())
    }

    /// Applies a change that was just made durable.
    fn integrate(&mut self, change: &Change);
}

/// Integrator that accepts everything and applies nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIntegrator;

impl Integrator for NoopIntegrator {
    fn integrate(&mut self, _change: &Change) {}
}

enum Readiness {
    Ready,
    Duplicate,
    Missing((ActorId, u64)),
}

#[derive(Debug, Default)]
struct Chain {
    changes: Vec<Change>,
    hashes: Vec<ChangeHash>,
}

impl Chain {
    fn head(&self) -> u64 {
        self.changes.len() as u64
    }
}

/// Append-only, causally ordered store of one space's changes.
pub struct ChangeLog {
    space: SpaceId,
    config: LogConfig,
    store: Arc<dyn ChangeStore>,
    keys: Arc<dyn CapabilityProvider>,
    chains: BTreeMap<ActorId, Chain>,
    by_hash: HashMap<ChangeHash, (ActorId, u64)>,
    frontier: Frontier,
    /// Held changes, keyed by the change they wait for.
    pending: HashMap<(ActorId, u64), Vec<Change>>,
    pending_index: HashMap<(ActorId, u64), ChangeHash>,
    pending_per_actor: HashMap<ActorId, usize>,
}

impl ChangeLog {
    pub fn new(
        space: SpaceId,
        store: Arc<dyn ChangeStore>,
        keys: Arc<dyn CapabilityProvider>,
        config: LogConfig,
    ) -> Self {
        Self {
            space,
            config,
            store,
            keys,
            chains: BTreeMap::new(),
            by_hash: HashMap::new(),
            frontier: Frontier::new(),
            pending: HashMap::new(),
            pending_index: HashMap::new(),
            pending_per_actor: HashMap::new(),
        }
    }

    /// Rebuilds the log from its store. Chains are re-linked and checked,
    /// nothing is integrated.
    pub fn load(
        space: SpaceId,
        store: Arc<dyn ChangeStore>,
        keys: Arc<dyn CapabilityProvider>,
        config: LogConfig,
    ) -> Result<Self, AppendError> {
        let mut log = Self::new(space, store, keys, config);
        let mut changes = log.store.load_changes(space)?;
        changes.sort_by_key(|c| (c.actor, c.seq));
        for change in changes {
            let chain = log.chains.entry(change.actor).or_default();
            let prev = chain.hashes.last().copied();
            if change.seq != chain.head() + 1 || change.prev != prev {
                return Err(StorageError::Corrupt(format!(
                    "chain of {} broken at seq {}",
                    change.actor, change.seq
                ))
                .into());
            }
            let hash = change_hash(&change)?;
            log.index(change, hash);
        }
        log::debug!(
            "Loaded change log for space {}: {} changes from {} actors",
            space,
            log.len(),
            log.chains.len()
        );
        Ok(log)
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }

    pub fn frontier(&self) -> &Frontier {
        &self.frontier
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn actors(&self) -> impl Iterator<Item = &ActorId> {
        self.chains.keys()
    }

    pub fn get(&self, actor: &ActorId, seq: u64) -> Option<&Change> {
        let index = usize::try_from(seq.checked_sub(1)?).ok()?;
        self.chains.get(actor)?.changes.get(index)
    }

    pub fn get_by_hash(&self, hash: &ChangeHash) -> Option<&Change> {
        let (actor, seq) = self.by_hash.get(hash)?;
        self.get(actor, *seq)
    }

    pub fn contains(&self, hash: &ChangeHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Latest sequence and hash of `actor`'s chain.
    pub fn head(&self, actor: &ActorId) -> Option<(u64, ChangeHash)> {
        let chain = self.chains.get(actor)?;
        chain.hashes.last().map(|h| (chain.head(), *h))
    }

    /// `actor`'s changes with `from <= seq <= to`.
    pub fn range(&self, actor: &ActorId, from: u64, to: u64) -> &[Change] {
        let Some(chain) = self.chains.get(actor) else {
            return &[];
        };
        let start = from.max(1) as usize - 1;
        let end = (to as usize).min(chain.changes.len());
        if start >= end {
            return &[];
        }
        &chain.changes[start..end]
    }

    pub fn pending_len(&self) -> usize {
        self.pending_index.len()
    }

    pub fn pending_for(&self, actor: &ActorId) -> usize {
        self.pending_per_actor.get(actor).copied().unwrap_or(0)
    }

    /// Changes the pending buffer is waiting for.
    pub fn awaited(&self) -> Vec<(ActorId, u64)> {
        let mut keys: Vec<_> = self.pending.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Drops every held change authored by `actor`, e.g. before a full resync.
    pub fn clear_pending(&mut self, actor: &ActorId) -> usize {
        let mut dropped = 0;
        for held in self.pending.values_mut() {
            held.retain(|c| {
                let keep = c.actor != *actor;
                dropped += usize::from(!keep);
                keep
            });
        }
        self.pending.retain(|_, held| !held.is_empty());
        self.pending_index.retain(|(a, _), _| a != actor);
        self.pending_per_actor.remove(actor);
        dropped
    }

    /// Changes not covered by `frontier`, dependencies first.
    ///
    /// Lazily yields, at each step, the smallest actor whose next change has
    /// all of its dependencies emitted or covered by `frontier`.
    pub fn changes_since(&self, frontier: &Frontier) -> ChangesSince<'_> {
        ChangesSince {
            log: self,
            emitted: frontier.clone(),
        }
    }

    // ─── Append ──────────────────────────────────────────────

    pub fn append(&mut self, change: Change) -> Result<AppendReport, AppendError> {
        self.append_with(change, &mut NoopIntegrator)
    }

    pub fn append_with(
        &mut self,
        change: Change,
        integrator: &mut dyn Integrator,
    ) -> Result<AppendReport, AppendError> {
        self.validate(&change)?;
        let key = (change.actor, change.seq);

        let mut report = match self.readiness(&change)? {
            Readiness::Duplicate => return Ok(AppendReport::new(AppendOutcome::Duplicate)),
            Readiness::Missing(awaited) => {
                let outcome = self.hold(awaited, change)?;
                return Ok(AppendReport::new(outcome));
            }
            Readiness::Ready => match self.commit(change, integrator) {
                Ok(hash) => {
                    let mut report = AppendReport::new(AppendOutcome::Committed);
                    report.committed.push(hash);
                    report
                }
                Err(e) => {
                    if !e.is_fatal() {
                        self.discard_dependents(key);
                    }
                    return Err(e);
                }
            },
        };

        self.cascade(key, integrator, &mut report)?;
        Ok(report)
    }

    fn cascade(
        &mut self,
        released: (ActorId, u64),
        integrator: &mut dyn Integrator,
        report: &mut AppendReport,
    ) -> Result<(), AppendError> {
        let mut work = vec![released];
        while let Some(key) = work.pop() {
            for child in self.take_pending(&key) {
                let child_key = (child.actor, child.seq);
                match self.readiness(&child) {
                    Ok(Readiness::Ready) => match self.commit(child, integrator) {
                        Ok(hash) => {
                            report.committed.push(hash);
                            work.push(child_key);
                        }
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            log::warn!("Dropping released change {}:{}: {e}", child_key.0, child_key.1);
                            self.discard_dependents(child_key);
                            report.rejected.push(e);
                        }
                    },
                    Ok(Readiness::Duplicate) => {}
                    Ok(Readiness::Missing(awaited)) => {
                        if let Err(e) = self.hold(awaited, child) {
                            report.rejected.push(e);
                        }
                    }
                    Err(e) => {
                        log::warn!("Dropping released change {}:{}: {e}", child_key.0, child_key.1);
                        self.discard_dependents(child_key);
                        report.rejected.push(e);
                    }
                }
            }
        }
        Ok(())
    }

    fn validate(&self, change: &Change) -> Result<(), AppendError> {
        let invalid = |reason: &str| AppendError::InvalidChange {
            actor: change.actor,
            seq: change.seq,
            reason: reason.to_string(),
        };
        if change.seq == 0 {
            return Err(invalid("sequence numbers start at 1"));
        }
        if (change.seq == 1) != change.prev.is_none() {
            return Err(invalid("only the first change may omit its predecessor"));
        }
        if change.deps.get(&change.actor) >= change.seq {
            return Err(invalid("change depends on itself"));
        }
        if change.ops.iter().any(|op| op.id.actor != change.actor) {
            return Err(invalid("operation authored by another actor"));
        }

        let key = self
            .keys
            .signing_key_for(&change.actor)
            .ok_or(AppendError::SignatureInvalid {
                actor: change.actor,
                seq: change.seq,
            })?;
        if !change.verify(&key).map_err(|e| encoding_failed(change, e))? {
            return Err(AppendError::SignatureInvalid {
                actor: change.actor,
                seq: change.seq,
            });
        }
        Ok(())
    }

    fn readiness(&self, change: &Change) -> Result<Readiness, AppendError> {
        let chain = self.chains.get(&change.actor);
        let head = chain.map_or(0, Chain::head);

        if change.seq <= head {
            let existing = chain.and_then(|c| c.hashes.get(change.seq as usize - 1));
            return match existing {
                Some(hash) if *hash == change_hash(change)? => Ok(Readiness::Duplicate),
                _ => Err(AppendError::DuplicateSequence {
                    actor: change.actor,
                    seq: change.seq,
                }),
            };
        }
        if change.seq > head + 1 {
            return Ok(Readiness::Missing((change.actor, change.seq - 1)));
        }
        let head_hash = chain.and_then(|c| c.hashes.last().copied());
        if change.prev != head_hash {
            return Err(AppendError::OutOfOrder {
                actor: change.actor,
                seq: change.seq,
                head,
            });
        }
        for (actor, seq) in change.deps.iter() {
            if *actor != change.actor && self.frontier.get(actor) < *seq {
                return Ok(Readiness::Missing((*actor, *seq)));
            }
        }
        Ok(Readiness::Ready)
    }

    fn hold(&mut self, awaited: (ActorId, u64), change: Change) -> Result<AppendOutcome, AppendError> {
        let key = (change.actor, change.seq);
        let hash = change_hash(&change)?;
        if let Some(existing) = self.pending_index.get(&key) {
            if *existing == hash {
                return Ok(AppendOutcome::Pending);
            }
            return Err(AppendError::DuplicateSequence {
                actor: change.actor,
                seq: change.seq,
            });
        }

        let limit = self.config.max_pending_per_actor;
        let held = self.pending_per_actor.entry(change.actor).or_default();
        if *held >= limit {
            return Err(AppendError::PendingBufferExhausted {
                actor: change.actor,
                limit,
            });
        }
        *held += 1;
        log::trace!(
            "Holding change {}:{} until {}:{} arrives",
            change.actor,
            change.seq,
            awaited.0,
            awaited.1
        );
        self.pending_index.insert(key, hash);
        self.pending.entry(awaited).or_default().push(change);
        Ok(AppendOutcome::Pending)
    }

    fn take_pending(&mut self, awaited: &(ActorId, u64)) -> Vec<Change> {
        let held = self.pending.remove(awaited).unwrap_or_default();
        for change in &held {
            self.pending_index.remove(&(change.actor, change.seq));
            if let Some(count) = self.pending_per_actor.get_mut(&change.actor) {
                *count = count.saturating_sub(1);
            }
        }
        held
    }

    /// Drops held changes that can never commit because `rejected` will not.
    fn discard_dependents(&mut self, rejected: (ActorId, u64)) {
        let mut work = vec![rejected];
        while let Some(key) = work.pop() {
            for child in self.take_pending(&key) {
                log::warn!(
                    "Discarding change {}:{} waiting on rejected {}:{}",
                    child.actor,
                    child.seq,
                    key.0,
                    key.1
                );
                work.push((child.actor, child.seq));
            }
        }
    }

    fn commit(&mut self, change: Change, integrator: &mut dyn Integrator) -> Result<ChangeHash, AppendError> {
        let hash = change_hash(&change)?;
        integrator.admit(&change)?;
        if let Err(e) = self.store.append_change(self.space, &change) {
            log::error!(
                "Failed to persist change {}:{} in space {}: {e}",
                change.actor,
                change.seq,
                self.space
            );
            return Err(e.into());
        }
        integrator.integrate(&change);
        self.index(change, hash);
        Ok(hash)
    }

    fn index(&mut self, change: Change, hash: ChangeHash) {
        self.by_hash.insert(hash, (change.actor, change.seq));
        self.frontier.advance(change.actor, change.seq);
        let chain = self.chains.entry(change.actor).or_default();
        chain.hashes.push(hash);
        chain.changes.push(change);
    }

    /// Re-verifies hashes, links and signatures of `actor`'s whole chain.
    pub fn verify_chain(&self, actor: &ActorId) -> Result<(), AppendError> {
        let Some(chain) = self.chains.get(actor) else {
            return Ok(());
        };
        let key = self
            .keys
            .signing_key_for(actor)
            .ok_or(AppendError::SignatureInvalid { actor: *actor, seq: 1 })?;
        let mut prev = None;
        for (i, change) in chain.changes.iter().enumerate() {
            let seq = i as u64 + 1;
            if change.seq != seq || change.prev != prev {
                return Err(AppendError::OutOfOrder {
                    actor: *actor,
                    seq: change.seq,
                    head: seq - 1,
                });
            }
            if !change.verify(&key).map_err(|e| encoding_failed(change, e))? {
                return Err(AppendError::SignatureInvalid { actor: *actor, seq });
            }
            let hash = change_hash(change)?;
            if chain.hashes[i] != hash {
                return Err(AppendError::DuplicateSequence { actor: *actor, seq });
            }
            prev = Some(hash);
        }
        Ok(())
    }
}

fn encoding_failed(change: &Change, e: ChangeError) -> AppendError {
    AppendError::InvalidChange {
        actor: change.actor,
        seq: change.seq,
        reason: e.to_string(),
    }
}

fn change_hash(change: &Change) -> Result<ChangeHash, AppendError> {
    change.hash().map_err(|e| encoding_failed(change, e))
}

/// Lazy topological walk produced by [`ChangeLog::changes_since`].
pub struct ChangesSince<'a> {
    log: &'a ChangeLog,
    emitted: Frontier,
}

impl<'a> ChangesSince<'a> {
    /// Frontier covering the start point plus everything yielded so far.
    pub fn emitted(&self) -> &Frontier {
        &self.emitted
    }
}

impl<'a> Iterator for ChangesSince<'a> {
    type Item = &'a Change;

    fn next(&mut self) -> Option<&'a Change> {
        for (actor, chain) in &self.log.chains {
            let next = self.emitted.get(actor) + 1;
            let Some(change) = chain.changes.get(next as usize - 1) else {
                continue;
            };
            let ready = change
                .deps
                .iter()
                .all(|(dep, seq)| dep == actor || self.emitted.get(dep) >= *seq);
            if ready {
                self.emitted.advance(*actor, next);
                return Some(change);
            }
        }
        None
    }
}
