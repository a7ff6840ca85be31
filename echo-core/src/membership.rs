//! Space membership.
//!
//! Grants live in a replicated document ([`DocumentId::MEMBERSHIP`]) whose
//! root map is keyed by member actor hex: a `Put` of `"read" | "write" |
//! "admin"` grants, a `Delete` revokes. Alongside the document, every grant
//! is indexed by the change that carried it so a capability can be evaluated
//! in the causal context of another change: only grants that change had
//! already seen count.
//!
//! ```text
//!   owner:  o1 ─ o2 (grant B write) ─ o3 (revoke B)
//!   B:                 └─ b1 (deps o2)  ✓ accepted
//!                                      └─ b2 (deps o3)  ✗ Forbidden
//! ```

use crate::capability::Capability;
use crate::change::Change;
use crate::document::LwwKey;
use crate::frontier::Frontier;
use crate::ids::{ActorId, DocumentId};
use crate::op::{Action, ObjId, Operation};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Grant {
    /// `(actor, seq)` of the change carrying the grant.
    change: (ActorId, u64),
    /// `None` for a revocation.
    capability: Option<Capability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    owner: ActorId,
    grants: BTreeMap<ActorId, BTreeMap<LwwKey, Grant>>,
}

impl Membership {
    pub fn new(owner: ActorId) -> Self {
        Self {
            owner,
            grants: BTreeMap::new(),
        }
    }

    /// The space owner, an implicit admin that cannot be revoked.
    pub fn owner(&self) -> ActorId {
        self.owner
    }

    /// Membership document action granting `capability` (or revoking, for `None`).
    pub fn grant_action(member: &ActorId, capability: Option<Capability>) -> Action {
        let key = member.to_hex();
        match capability {
            Some(cap) => Action::Put {
                obj: ObjId::Root,
                key,
                value: Value::from(cap.as_str()),
            },
            None => Action::Delete { obj: ObjId::Root, key },
        }
    }

    /// Indexes a membership-document operation carried by `change`.
    pub fn record(&mut self, change: &Change, op: &Operation) {
        if op.document != DocumentId::MEMBERSHIP {
            return;
        }
        let (key, capability) = match &op.action {
            Action::Put {
                obj: ObjId::Root,
                key,
                value,
            } => match value.as_str().and_then(Capability::parse) {
                Some(cap) => (key, Some(cap)),
                None => {
                    log::warn!("Ignoring membership entry {key} with value {value:?}");
                    return;
                }
            },
            Action::Delete { obj: ObjId::Root, key } => (key, None),
            _ => return,
        };
        let Some(member) = ActorId::from_hex(key) else {
            log::warn!("Ignoring membership entry for malformed actor {key}");
            return;
        };
        self.grants.entry(member).or_default().insert(
            LwwKey::of(op),
            Grant {
                change: (change.actor, change.seq),
                capability,
            },
        );
    }

    /// Capability of `actor` as seen by a change whose causal context is `context`.
    pub fn capability_at(&self, actor: &ActorId, context: &Frontier) -> Option<Capability> {
        if *actor == self.owner {
            return Some(Capability::Admin);
        }
        self.grants
            .get(actor)?
            .values()
            .rev()
            .find(|g| context.includes(&g.change.0, g.change.1))
            .and_then(|g| g.capability)
    }

    /// Capability of `actor` given every grant known locally.
    pub fn current(&self, actor: &ActorId) -> Option<Capability> {
        if *actor == self.owner {
            return Some(Capability::Admin);
        }
        self.grants
            .get(actor)?
            .values()
            .next_back()
            .and_then(|g| g.capability)
    }

    /// Current members, owner included.
    pub fn members(&self) -> Vec<(ActorId, Capability)> {
        let mut members = vec![(self.owner, Capability::Admin)];
        members.extend(
            self.grants
                .keys()
                .filter(|a| **a != self.owner)
                .filter_map(|a| self.current(a).map(|c| (*a, c))),
        );
        members
    }
}
