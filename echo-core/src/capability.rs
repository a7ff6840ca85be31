//! Capabilities and the identity-subsystem seam.

use crate::ids::{ActorId, SpaceId};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::RwLock;
use thiserror::Error;

/// Authorization level of a member. Ordered: `Read < Write < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    Read,
    Write,
    /// May admit and revoke members.
    Admin,
}

/// What an actor is trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    Read,
    Write,
    Admit,
}

impl Capability {
    pub fn allows(self, access: Access) -> bool {
        match access {
            Access::Read => true,
            Access::Write => self >= Capability::Write,
            Access::Admit => self == Capability::Admin,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Read => "read",
            Capability::Write => "write",
            Capability::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Capability::Read),
            "write" => Some(Capability::Write),
            "admin" => Some(Capability::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change was refused by a capability check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("change {actor}:{seq} forbidden: {reason}")]
pub struct Forbidden {
    pub actor: ActorId,
    pub seq: u64,
    pub reason: String,
}

/// Answers identity questions on behalf of the identity subsystem.
pub trait CapabilityProvider: Send + Sync {
    /// External veto on top of the space's own membership rules.
    fn check_capability(&self, actor: &ActorId, space: &SpaceId, access: Access) -> bool;

    /// Public key used to verify `actor`'s signatures.
    fn signing_key_for(&self, actor: &ActorId) -> Option<VerifyingKey>;
}

/// Trusts membership alone; actor ids are their own public keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyDerivedProvider;

impl CapabilityProvider for KeyDerivedProvider {
    fn check_capability(&self, _actor: &ActorId, _space: &SpaceId, _access: Access) -> bool {
        true
    }

    fn signing_key_for(&self, actor: &ActorId) -> Option<VerifyingKey> {
        actor.verifying_key()
    }
}

/// Key-derived provider with a mutable deny list, e.g. for banned devices.
#[derive(Debug, Default)]
pub struct DenyListProvider {
    denied: RwLock<HashSet<ActorId>>,
}

impl DenyListProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, actor: ActorId) {
        if let Ok(mut denied) = self.denied.write() {
            denied.insert(actor);
        }
    }

    pub fn allow(&self, actor: &ActorId) {
        if let Ok(mut denied) = self.denied.write() {
            denied.remove(actor);
        }
    }
}

impl CapabilityProvider for DenyListProvider {
    fn check_capability(&self, actor: &ActorId, _space: &SpaceId, access: Access) -> bool {
        access == Access::Read || self.denied.read().map(|d| !d.contains(actor)).unwrap_or(false)
    }

    fn signing_key_for(&self, actor: &ActorId) -> Option<VerifyingKey> {
        actor.verifying_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Identity;

    #[test]
    fn test_capability_ordering() {
        assert!(Capability::Admin.allows(Access::Admit));
        assert!(Capability::Admin.allows(Access::Write));
        assert!(Capability::Write.allows(Access::Write));
        assert!(!Capability::Write.allows(Access::Admit));
        assert!(!Capability::Read.allows(Access::Write));
        assert!(Capability::Read.allows(Access::Read));
    }

    #[test]
    fn test_capability_parse() {
        for cap in [Capability::Read, Capability::Write, Capability::Admin] {
            assert_eq!(Capability::parse(cap.as_str()), Some(cap));
        }
        assert_eq!(Capability::parse("owner"), None);
    }

    #[test]
    fn test_deny_list() {
        let provider = DenyListProvider::new();
        let actor = Identity::from_seed([2; 32]).actor();
        let space = SpaceId::new();
        assert!(provider.check_capability(&actor, &space, Access::Write));
        provider.deny(actor);
        assert!(!provider.check_capability(&actor, &space, Access::Write));
        assert!(provider.check_capability(&actor, &space, Access::Read));
        provider.allow(&actor);
        assert!(provider.check_capability(&actor, &space, Access::Write));
        assert_eq!(provider.signing_key_for(&actor), actor.verifying_key());
    }
}
