//! Tagged document values.
//!
//! Application payloads are schema-flexible, so every field holds a
//! [`Value`]. Schema checks run on top of converged values
//! (see [`crate::registry`]), never inside the merge logic.

use crate::codec;
use crate::ids::{DocumentId, SpaceId};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// A document value.
///
/// Equality compares floats by bit pattern, matching the codec bytes that
/// replicas converge on: `NaN == NaN` and `0.0 != -0.0`.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Typed pointer to another document, resolved through the owning space.
    Ref(Reference),
    /// Payload with an extension tag this build does not understand.
    /// Kept verbatim so it survives re-encoding.
    Unknown { tag: u64, data: Vec<u8> },
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a == b,
            (Value::Unknown { tag: ta, data: da }, Value::Unknown { tag: tb, data: db }) => ta == tb && da == db,
            _ => false,
        }
    }
}

/// Discriminant of a [`Value`], used by readers and schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    String,
    Bytes,
    List,
    Map,
    Ref,
    Unknown,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
            Value::Ref(_) => ValueKind::Ref,
            Value::Unknown { .. } => ValueKind::Unknown,
        }
    }

    pub fn map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Map field lookup. `None` for missing keys and non-map values.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Follows a path of keys and indices.
    pub fn at(&self, path: &[PathSegment]) -> Option<&Value> {
        let mut current = self;
        for segment in path {
            current = match (segment, current) {
                (PathSegment::Key(k), Value::Map(m)) => m.get(k)?,
                (PathSegment::Index(i), Value::List(l)) => l.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Converts from JSON. Integers that fit `i64` stay integers.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => match Reference::parse(s) {
                Some(r) => Value::Ref(r),
                None => Value::String(s.clone()),
            },
            serde_json::Value::Array(a) => Value::List(a.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(o) => Value::Map(
                o.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts to JSON. Bytes become arrays of numbers, references their DXN string.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::from(b.clone()),
            Value::List(l) => serde_json::Value::Array(l.iter().map(Value::to_json).collect()),
            Value::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Ref(r) => serde_json::Value::String(r.to_dxn()),
            Value::Unknown { .. } => serde_json::Value::Null,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

impl From<Reference> for Value {
    fn from(v: Reference) -> Self {
        Value::Ref(v)
    }
}

// Values travel inside bincode-encoded operations and snapshots as codec bytes,
// so the binary layout is owned by one place.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&codec::encode(self))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CodecVisitor;

        impl<'de> Visitor<'de> for CodecVisitor {
            type Value = Value;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("codec-encoded value bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Value, E> {
                codec::decode(v).map_err(E::custom)
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Value, E> {
                self.visit_bytes(&v)
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
                let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    bytes.push(b);
                }
                codec::decode(&bytes).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_byte_buf(CodecVisitor)
    }
}

/// DXN-like opaque key of a document: `dxn:echo:<space|@>:<document>`.
///
/// `@` means "the space holding the reference".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    pub space: Option<SpaceId>,
    pub document: DocumentId,
}

impl Reference {
    pub const PREFIX: &'static str = "dxn:echo:";

    pub fn local(document: DocumentId) -> Self {
        Self { space: None, document }
    }

    pub fn remote(space: SpaceId, document: DocumentId) -> Self {
        Self {
            space: Some(space),
            document,
        }
    }

    pub fn to_dxn(&self) -> String {
        match self.space {
            Some(space) => format!("{}{}:{}", Self::PREFIX, space, self.document),
            None => format!("{}@:{}", Self::PREFIX, self.document),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix(Self::PREFIX)?;
        let (space, document) = rest.split_once(':')?;
        let document = DocumentId::parse(document)?;
        let space = match space {
            "@" => None,
            other => Some(SpaceId::parse(other)?),
        };
        Some(Self { space, document })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_dxn())
    }
}

/// One step of a path into a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(k: &str) -> Self {
        PathSegment::Key(k.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(k: String) -> Self {
        PathSegment::Key(k)
    }
}

impl From<usize> for PathSegment {
    fn from(i: usize) -> Self {
        PathSegment::Index(i)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => f.write_str(k),
            PathSegment::Index(i) => write!(f, "{i}"),
        }
    }
}

/// Builds a `Vec<PathSegment>` from keys and indices.
///
/// ```
/// use echo_core::path;
/// let p = path!["items", 0usize, "title"];
/// assert_eq!(p.len(), 3);
/// ```
#[macro_export]
macro_rules! path {
    () => { Vec::<$crate::value::PathSegment>::new() };
    ($($seg:expr),+ $(,)?) => {
        vec![$($crate::value::PathSegment::from($seg)),+]
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_dxn_roundtrip() {
        let local = Reference::local(DocumentId::new());
        assert_eq!(Reference::parse(&local.to_dxn()), Some(local));

        let remote = Reference::remote(SpaceId::new(), DocumentId::new());
        assert_eq!(Reference::parse(&remote.to_dxn()), Some(remote));

        assert!(Reference::parse("dxn:type:foo").is_none());
        assert!(Reference::parse("dxn:echo:@:not-a-uuid").is_none());
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        let nan = Value::Float(f64::NAN);
        assert_eq!(nan, nan.clone());
        assert_eq!(Value::List(vec![nan.clone()]), Value::List(vec![Value::Float(f64::NAN)]));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_ne!(Value::Float(1.0), Value::Int(1));

        let decoded = codec::decode(&codec::encode(&nan)).unwrap();
        assert_eq!(decoded, nan);
    }

    #[test]
    fn test_json_conversion() {
        let json = serde_json::json!({
            "title": "draft",
            "count": 3,
            "ratio": 0.5,
            "tags": ["a", "b"],
            "done": false,
            "parent": null
        });
        let value = Value::from_json(&json);
        assert_eq!(value.get("title"), Some(&Value::from("draft")));
        assert_eq!(value.get("count"), Some(&Value::Int(3)));
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn test_at_path() {
        let value = Value::from_json(&serde_json::json!({"items": [{"title": "x"}]}));
        let p = path!["items", 0usize, "title"];
        assert_eq!(value.at(&p), Some(&Value::from("x")));
        assert_eq!(value.at(&path!["items", 3usize]), None);
        assert_eq!(value.at(&path![]), Some(&value));
    }

    #[test]
    fn test_serde_through_codec() {
        let value = Value::from_json(&serde_json::json!({"a": [1, 2, {"b": "c"}]}));
        let bytes = bincode::serde::encode_to_vec(&value, bincode::config::standard()).unwrap();
        let (decoded, _): (Value, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_kind() {
        assert_eq!(Value::Null.kind(), ValueKind::Null);
        assert_eq!(Value::from("x").kind(), ValueKind::String);
        assert_eq!(Value::map().kind(), ValueKind::Map);
    }
}
