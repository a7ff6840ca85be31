//! Explicit observer lists.
//!
//! Callbacks run synchronously on the thread that owns the space, in the
//! order operations were applied.

use crate::document::Delta;
use crate::ids::{ActorId, ChangeHash, DocumentId, SpaceId};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub type DeltaCallback = Box<dyn FnMut(&Delta) + Send>;
pub type CommitCallback = Box<dyn FnMut(&CommitNotice) + Send>;

/// A change was committed to the space's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitNotice {
    pub space: SpaceId,
    pub actor: ActorId,
    pub seq: u64,
    pub hash: ChangeHash,
    /// Authored by this replica.
    pub local: bool,
}

/// Per-document delta subscribers plus space-wide commit listeners.
#[derive(Default)]
pub struct Observers {
    next_id: u64,
    documents: BTreeMap<DocumentId, Vec<(SubscriptionId, DeltaCallback)>>,
    commits: Vec<(SubscriptionId, CommitCallback)>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }

    pub fn subscribe(&mut self, document: DocumentId, callback: DeltaCallback) -> SubscriptionId {
        let id = self.allocate();
        self.documents.entry(document).or_default().push((id, callback));
        id
    }

    pub fn subscribe_commits(&mut self, callback: CommitCallback) -> SubscriptionId {
        let id = self.allocate();
        self.commits.push((id, callback));
        id
    }

    /// Removes a delta or commit subscription. Returns whether it existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.len();
        for subs in self.documents.values_mut() {
            subs.retain(|(sid, _)| *sid != id);
        }
        self.documents.retain(|_, subs| !subs.is_empty());
        self.commits.retain(|(sid, _)| *sid != id);
        self.len() != before
    }

    pub fn dispatch(&mut self, deltas: &[Delta]) {
        for delta in deltas {
            if let Some(subs) = self.documents.get_mut(&delta.document) {
                for (_, callback) in subs.iter_mut() {
                    callback(delta);
                }
            }
        }
    }

    pub fn notify_commit(&mut self, notice: &CommitNotice) {
        for (_, callback) in self.commits.iter_mut() {
            callback(notice);
        }
    }

    pub fn len(&self) -> usize {
        self.documents.values().map(Vec::len).sum::<usize>() + self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("documents", &self.documents.len())
            .field("commits", &self.commits.len())
            .finish()
    }
}
