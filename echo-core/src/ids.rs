//! Identifiers shared by every layer of the engine.
//!
//! ```text
//! ActorId    32 bytes   Ed25519 public key of a writer
//! OpId       (actor, seq)  one operation, totally ordered per actor
//! SpaceId    UUID       namespace of documents + membership
//! DocumentId UUID       one document inside a space
//! ChangeHash 32 bytes   BLAKE3 of a signed change
//! ```

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lowercase hex of arbitrary bytes.
pub fn hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}

fn parse_hex32(s: &str) -> Option<[u8; 32]> {
    if s.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[i] = (hi * 16 + lo) as u8;
    }
    Some(out)
}

/// A writer, identified by its Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId([u8; 32]);

impl ActorId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex(&self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        parse_hex32(s).map(Self)
    }

    /// The public key this actor id encodes, if it is a valid curve point.
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0).ok()
    }
}

impl From<VerifyingKey> for ActorId {
    fn from(key: VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..12])
    }
}

/// Identity of a single operation: the authoring actor and its per-actor sequence.
///
/// Ordered by `(actor, seq)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub actor: ActorId,
    pub seq: u64,
}

impl OpId {
    pub fn new(actor: ActorId, seq: u64) -> Self {
        Self { actor, seq }
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.seq, self.actor)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

uuid_id!(
    /// Namespace of documents and members.
    SpaceId
);
uuid_id!(
    /// A document inside a space.
    DocumentId
);

impl DocumentId {
    /// The replicated membership document every space carries.
    pub const MEMBERSHIP: DocumentId = DocumentId(Uuid::nil());

    pub fn is_membership(&self) -> bool {
        *self == Self::MEMBERSHIP
    }
}

/// BLAKE3 digest of a signed change.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangeHash(pub [u8; 32]);

impl ChangeHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ChangeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeHash({})", &hex(&self.0)[..12])
    }
}

impl fmt::Display for ChangeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex(&self.0))
    }
}

/// Local signing identity. The public half is the [`ActorId`].
#[derive(Clone)]
pub struct Identity {
    key: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    /// Deterministic identity, mostly for tests and fixtures.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn actor(&self) -> ActorId {
        ActorId::from(self.key.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key.sign(message).to_bytes().to_vec()
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.key
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity").field("actor", &self.actor()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_hex_roundtrip() {
        let actor = Identity::from_seed([7; 32]).actor();
        let parsed = ActorId::from_hex(&actor.to_hex()).unwrap();
        assert_eq!(parsed, actor);
        assert!(ActorId::from_hex("zz").is_none());
    }

    #[test]
    fn test_actor_is_verifying_key() {
        let id = Identity::from_seed([1; 32]);
        let key = id.actor().verifying_key().unwrap();
        assert_eq!(key, id.signing_key().verifying_key());
    }

    #[test]
    fn test_op_id_ordering() {
        let a = ActorId::from_bytes([1; 32]);
        let b = ActorId::from_bytes([2; 32]);
        assert!(OpId::new(a, 9) < OpId::new(b, 1));
        assert!(OpId::new(a, 1) < OpId::new(a, 2));
    }

    #[test]
    fn test_membership_document_is_nil() {
        assert!(DocumentId::MEMBERSHIP.is_membership());
        assert!(!DocumentId::new().is_membership());
    }

    #[test]
    fn test_hex_encoding() {
        assert_eq!(hex(&[0x00, 0xab, 0xff]), "00abff");
    }
}
