//! Binary value codec.
//!
//! Layout (one tag byte, then a tag-specific body):
//! ```text
//! 0x00 null           0x05 string  varint len | utf8
//! 0x01 false          0x06 bytes   varint len | raw
//! 0x02 true           0x07 list    varint body_len | varint count | items
//! 0x03 int  zigzag    0x08 map     varint body_len | varint count | (varint klen | key | value)*
//! 0x04 f64  LE        0x09 ref     has_space u8 | [space 16] | document 16
//! 0x7F extension      varint ext_id | varint len | raw
//! ```
//!
//! Containers carry their body length up front so a [`ValueReader`] can step
//! over a sibling without decoding it. Map keys are written in ascending
//! order and the decoder rejects anything else, so every value has exactly
//! one encoding.

use crate::ids::{DocumentId, SpaceId};
use crate::value::{PathSegment, Reference, Value, ValueKind};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

pub const TAG_NULL: u8 = 0x00;
pub const TAG_FALSE: u8 = 0x01;
pub const TAG_TRUE: u8 = 0x02;
pub const TAG_INT: u8 = 0x03;
pub const TAG_FLOAT: u8 = 0x04;
pub const TAG_STRING: u8 = 0x05;
pub const TAG_BYTES: u8 = 0x06;
pub const TAG_LIST: u8 = 0x07;
pub const TAG_MAP: u8 = 0x08;
pub const TAG_REF: u8 = 0x09;
pub const TAG_EXTENSION: u8 = 0x7F;

/// Deepest container nesting the decoder accepts.
pub const MAX_DEPTH: usize = 128;
/// Largest length prefix the decoder accepts (64 MiB).
pub const MAX_LEN: usize = 64 * 1024 * 1024;

/// Malformed input, with the byte offset where decoding stopped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} at byte {offset}")]
pub struct DecodeError {
    pub offset: usize,
    pub kind: DecodeErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeErrorKind {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unknown type tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("invalid utf-8")]
    InvalidUtf8,
    #[error("varint overflow")]
    VarintOverflow,
    #[error("length {0} exceeds limit")]
    LengthLimit(u64),
    #[error("container length does not match its contents")]
    LengthMismatch,
    #[error("nesting deeper than {MAX_DEPTH}")]
    DepthLimit,
    #[error("map keys not strictly ascending")]
    NonCanonicalMap,
    #[error("invalid reference")]
    InvalidReference,
    #[error("trailing bytes after value")]
    TrailingBytes,
}

fn depth_allowed(depth: usize) -> bool {
    depth < MAX_DEPTH
}

fn len_allowed(n: u64) -> bool {
    n <= MAX_LEN as u64
}

// ─── Encoding ────────────────────────────────────────────────

/// Checks that `value` stays within the decoder's depth and length limits.
///
/// [`encode`] itself never fails; anything it produces for a value that
/// passes this check decodes again.
pub fn validate(value: &Value) -> Result<(), DecodeErrorKind> {
    encoded_len(value, 0).map(|_| ())
}

fn varint_len(v: u64) -> u64 {
    let bits = 64 - u64::from(v.leading_zeros());
    bits.max(1).div_ceil(7)
}

fn checked_len(n: usize) -> Result<u64, DecodeErrorKind> {
    let n = n as u64;
    if !len_allowed(n) {
        return Err(DecodeErrorKind::LengthLimit(n));
    }
    Ok(n)
}

/// Encoded size of `value` at nesting `depth`, mirroring the decoder checks.
fn encoded_len(value: &Value, depth: usize) -> Result<u64, DecodeErrorKind> {
    let len = match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Int(i) => 1 + varint_len(zigzag(*i)),
        Value::Float(_) => 9,
        Value::String(s) => {
            let n = checked_len(s.len())?;
            1 + varint_len(n) + n
        }
        Value::Bytes(b) => {
            let n = checked_len(b.len())?;
            1 + varint_len(n) + n
        }
        Value::List(items) => {
            if !depth_allowed(depth) {
                return Err(DecodeErrorKind::DepthLimit);
            }
            let mut body = varint_len(items.len() as u64);
            for item in items {
                body = body.saturating_add(encoded_len(item, depth + 1)?);
            }
            if !len_allowed(body) {
                return Err(DecodeErrorKind::LengthLimit(body));
            }
            1 + varint_len(body) + body
        }
        Value::Map(entries) => {
            if !depth_allowed(depth) {
                return Err(DecodeErrorKind::DepthLimit);
            }
            let mut body = varint_len(entries.len() as u64);
            for (key, item) in entries {
                let k = checked_len(key.len())?;
                body = body
                    .saturating_add(varint_len(k) + k)
                    .saturating_add(encoded_len(item, depth + 1)?);
            }
            if !len_allowed(body) {
                return Err(DecodeErrorKind::LengthLimit(body));
            }
            1 + varint_len(body) + body
        }
        Value::Ref(r) => {
            if r.space.is_some() {
                34
            } else {
                18
            }
        }
        Value::Unknown { tag, data } => {
            let n = checked_len(data.len())?;
            1 + varint_len(*tag) + varint_len(n) + n
        }
    };
    Ok(len)
}

pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

pub fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(false) => out.push(TAG_FALSE),
        Value::Bool(true) => out.push(TAG_TRUE),
        Value::Int(i) => {
            out.push(TAG_INT);
            write_varint(out, zigzag(*i));
        }
        Value::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&f.to_le_bytes());
        }
        Value::String(s) => {
            out.push(TAG_STRING);
            write_varint(out, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            out.push(TAG_BYTES);
            write_varint(out, b.len() as u64);
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            let mut body = Vec::new();
            write_varint(&mut body, items.len() as u64);
            for item in items {
                encode_into(item, &mut body);
            }
            out.push(TAG_LIST);
            write_varint(out, body.len() as u64);
            out.extend_from_slice(&body);
        }
        Value::Map(entries) => {
            let mut body = Vec::new();
            write_varint(&mut body, entries.len() as u64);
            for (key, item) in entries {
                write_varint(&mut body, key.len() as u64);
                body.extend_from_slice(key.as_bytes());
                encode_into(item, &mut body);
            }
            out.push(TAG_MAP);
            write_varint(out, body.len() as u64);
            out.extend_from_slice(&body);
        }
        Value::Ref(r) => {
            out.push(TAG_REF);
            match r.space {
                Some(space) => {
                    out.push(1);
                    out.extend_from_slice(space.as_uuid().as_bytes());
                }
                None => out.push(0),
            }
            out.extend_from_slice(r.document.as_uuid().as_bytes());
        }
        Value::Unknown { tag, data } => {
            out.push(TAG_EXTENSION);
            write_varint(out, *tag);
            write_varint(out, data.len() as u64);
            out.extend_from_slice(data);
        }
    }
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

pub(crate) fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

// ─── Decoding ────────────────────────────────────────────────

/// Decodes exactly one value; trailing input is an error.
pub fn decode(bytes: &[u8]) -> Result<Value, DecodeError> {
    let mut cursor = Cursor::new(bytes, 0);
    let value = cursor.value(0)?;
    cursor.finish()?;
    Ok(value)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    /// Absolute offset of `buf[0]`, for error reporting on sub-slices.
    base: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], base: usize) -> Self {
        Self { buf, pos: 0, base }
    }

    fn err(&self, kind: DecodeErrorKind) -> DecodeError {
        DecodeError {
            offset: self.base + self.pos,
            kind,
        }
    }

    fn finish(&self) -> Result<(), DecodeError> {
        if self.pos != self.buf.len() {
            return Err(self.err(DecodeErrorKind::TrailingBytes));
        }
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn byte(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| self.err(DecodeErrorKind::UnexpectedEof))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(self.err(DecodeErrorKind::UnexpectedEof));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn varint(&mut self) -> Result<u64, DecodeError> {
        let start = self.pos;
        let mut result: u64 = 0;
        for shift in (0..64).step_by(7) {
            let b = self.byte()?;
            if shift == 63 && b > 1 {
                self.pos = start;
                return Err(self.err(DecodeErrorKind::VarintOverflow));
            }
            result |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok(result);
            }
        }
        self.pos = start;
        Err(self.err(DecodeErrorKind::VarintOverflow))
    }

    /// Length prefix, checked against [`MAX_LEN`] and the remaining input.
    fn len(&mut self) -> Result<usize, DecodeError> {
        let start = self.pos;
        let n = self.varint()?;
        if !len_allowed(n) {
            self.pos = start;
            return Err(self.err(DecodeErrorKind::LengthLimit(n)));
        }
        let n = n as usize;
        if n > self.remaining() {
            return Err(self.err(DecodeErrorKind::UnexpectedEof));
        }
        Ok(n)
    }

    fn str(&mut self) -> Result<&'a str, DecodeError> {
        let n = self.len()?;
        let start = self.pos;
        let raw = self.take(n)?;
        std::str::from_utf8(raw).map_err(|e| DecodeError {
            offset: self.base + start + e.valid_up_to(),
            kind: DecodeErrorKind::InvalidUtf8,
        })
    }

    fn uuid(&mut self) -> Result<Uuid, DecodeError> {
        let raw = self.take(16)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(raw);
        Ok(Uuid::from_bytes(bytes))
    }

    /// Splits off a container body as its own cursor.
    fn body(&mut self) -> Result<Cursor<'a>, DecodeError> {
        let n = self.len()?;
        let base = self.base + self.pos;
        let raw = self.take(n)?;
        Ok(Cursor::new(raw, base))
    }

    fn count(&mut self) -> Result<usize, DecodeError> {
        let start = self.pos;
        let n = self.varint()?;
        // Every element takes at least one byte.
        if n > self.remaining() as u64 {
            self.pos = start;
            return Err(self.err(DecodeErrorKind::LengthMismatch));
        }
        Ok(n as usize)
    }

    fn value(&mut self, depth: usize) -> Result<Value, DecodeError> {
        let tag_pos = self.pos;
        let tag = self.byte()?;
        let value = match tag {
            TAG_NULL => Value::Null,
            TAG_FALSE => Value::Bool(false),
            TAG_TRUE => Value::Bool(true),
            TAG_INT => Value::Int(unzigzag(self.varint()?)),
            TAG_FLOAT => {
                let raw = self.take(8)?;
                let mut b = [0u8; 8];
                b.copy_from_slice(raw);
                Value::Float(f64::from_le_bytes(b))
            }
            TAG_STRING => Value::String(self.str()?.to_string()),
            TAG_BYTES => {
                let n = self.len()?;
                Value::Bytes(self.take(n)?.to_vec())
            }
            TAG_LIST => {
                if !depth_allowed(depth) {
                    self.pos = tag_pos;
                    return Err(self.err(DecodeErrorKind::DepthLimit));
                }
                let mut body = self.body()?;
                let count = body.count()?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(body.value(depth + 1)?);
                }
                body.finish()
                    .map_err(|e| DecodeError { kind: DecodeErrorKind::LengthMismatch, ..e })?;
                Value::List(items)
            }
            TAG_MAP => {
                if !depth_allowed(depth) {
                    self.pos = tag_pos;
                    return Err(self.err(DecodeErrorKind::DepthLimit));
                }
                let mut body = self.body()?;
                let count = body.count()?;
                let mut entries = BTreeMap::new();
                let mut last: Option<&str> = None;
                for _ in 0..count {
                    let key_pos = body.pos;
                    let key = body.str()?;
                    if last.is_some_and(|prev| prev >= key) {
                        body.pos = key_pos;
                        return Err(body.err(DecodeErrorKind::NonCanonicalMap));
                    }
                    last = Some(key);
                    let item = body.value(depth + 1)?;
                    entries.insert(key.to_string(), item);
                }
                body.finish()
                    .map_err(|e| DecodeError { kind: DecodeErrorKind::LengthMismatch, ..e })?;
                Value::Map(entries)
            }
            TAG_REF => {
                let flag_pos = self.pos;
                let space = match self.byte()? {
                    0 => None,
                    1 => Some(SpaceId(self.uuid()?)),
                    _ => {
                        self.pos = flag_pos;
                        return Err(self.err(DecodeErrorKind::InvalidReference));
                    }
                };
                let document = DocumentId(self.uuid()?);
                Value::Ref(Reference { space, document })
            }
            TAG_EXTENSION => {
                let ext = self.varint()?;
                let n = self.len()?;
                Value::Unknown {
                    tag: ext,
                    data: self.take(n)?.to_vec(),
                }
            }
            other => {
                self.pos = tag_pos;
                return Err(self.err(DecodeErrorKind::UnknownTag(other)));
            }
        };
        Ok(value)
    }

    /// Steps over one value without materializing it. Returns its tag.
    fn skip(&mut self) -> Result<u8, DecodeError> {
        let tag_pos = self.pos;
        let tag = self.byte()?;
        match tag {
            TAG_NULL | TAG_FALSE | TAG_TRUE => {}
            TAG_INT => {
                self.varint()?;
            }
            TAG_FLOAT => {
                self.take(8)?;
            }
            TAG_STRING | TAG_BYTES | TAG_LIST | TAG_MAP => {
                let n = self.len()?;
                self.take(n)?;
            }
            TAG_REF => {
                let flag_pos = self.pos;
                let rest = match self.byte()? {
                    0 => 16,
                    1 => 32,
                    _ => {
                        self.pos = flag_pos;
                        return Err(self.err(DecodeErrorKind::InvalidReference));
                    }
                };
                self.take(rest)?;
            }
            TAG_EXTENSION => {
                self.varint()?;
                let n = self.len()?;
                self.take(n)?;
            }
            other => {
                self.pos = tag_pos;
                return Err(self.err(DecodeErrorKind::UnknownTag(other)));
            }
        }
        Ok(tag)
    }
}

fn kind_of(tag: u8) -> Option<ValueKind> {
    Some(match tag {
        TAG_NULL => ValueKind::Null,
        TAG_FALSE | TAG_TRUE => ValueKind::Bool,
        TAG_INT => ValueKind::Int,
        TAG_FLOAT => ValueKind::Float,
        TAG_STRING => ValueKind::String,
        TAG_BYTES => ValueKind::Bytes,
        TAG_LIST => ValueKind::List,
        TAG_MAP => ValueKind::Map,
        TAG_REF => ValueKind::Ref,
        TAG_EXTENSION => ValueKind::Unknown,
        _ => return None,
    })
}

// ─── Partial decode ──────────────────────────────────────────

/// Lazy view over one encoded value.
///
/// Navigation only touches the bytes on the requested path; siblings are
/// skipped using their length prefixes. Call [`ValueReader::decode`] to
/// materialize the part you actually need.
#[derive(Debug, Clone, Copy)]
pub struct ValueReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ValueReader<'a> {
    /// Wraps an encoded value, checking only its outer framing.
    pub fn new(bytes: &'a [u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(bytes, 0);
        cursor.skip()?;
        cursor.finish()?;
        Ok(Self { bytes, offset: 0 })
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Absolute offset of this value inside the outermost buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn kind(&self) -> Result<ValueKind, DecodeError> {
        let tag = self.bytes.first().copied().ok_or(DecodeError {
            offset: self.offset,
            kind: DecodeErrorKind::UnexpectedEof,
        })?;
        kind_of(tag).ok_or(DecodeError {
            offset: self.offset,
            kind: DecodeErrorKind::UnknownTag(tag),
        })
    }

    /// Element count for lists and maps, byte length for strings and bytes,
    /// zero for everything else.
    pub fn len(&self) -> Result<usize, DecodeError> {
        let mut cursor = Cursor::new(self.bytes, self.offset);
        match cursor.byte()? {
            TAG_STRING | TAG_BYTES => cursor.len(),
            TAG_LIST | TAG_MAP => cursor.body()?.count(),
            _ => Ok(0),
        }
    }

    pub fn is_empty(&self) -> Result<bool, DecodeError> {
        Ok(self.len()? == 0)
    }

    /// Fully decodes this value.
    pub fn decode(&self) -> Result<Value, DecodeError> {
        let mut cursor = Cursor::new(self.bytes, self.offset);
        let value = cursor.value(0)?;
        cursor.finish()?;
        Ok(value)
    }

    /// Looks up a map field. `Ok(None)` when absent or when this is not a map.
    pub fn get(&self, key: &str) -> Result<Option<ValueReader<'a>>, DecodeError> {
        let mut cursor = Cursor::new(self.bytes, self.offset);
        if cursor.byte()? != TAG_MAP {
            return Ok(None);
        }
        let mut body = cursor.body()?;
        let count = body.count()?;
        for _ in 0..count {
            let k = body.str()?;
            let start = body.pos;
            body.skip()?;
            if k == key {
                return Ok(Some(ValueReader {
                    bytes: &body.buf[start..body.pos],
                    offset: body.base + start,
                }));
            }
            // Keys are sorted, so we can stop early.
            if k > key {
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// Looks up a list element. `Ok(None)` when out of range or not a list.
    pub fn index(&self, index: usize) -> Result<Option<ValueReader<'a>>, DecodeError> {
        let mut cursor = Cursor::new(self.bytes, self.offset);
        if cursor.byte()? != TAG_LIST {
            return Ok(None);
        }
        let mut body = cursor.body()?;
        let count = body.count()?;
        if index >= count {
            return Ok(None);
        }
        for _ in 0..index {
            body.skip()?;
        }
        let start = body.pos;
        body.skip()?;
        Ok(Some(ValueReader {
            bytes: &body.buf[start..body.pos],
            offset: body.base + start,
        }))
    }

    pub fn path(&self, path: &[PathSegment]) -> Result<Option<ValueReader<'a>>, DecodeError> {
        let mut current = *self;
        for segment in path {
            let next = match segment {
                PathSegment::Key(k) => current.get(k)?,
                PathSegment::Index(i) => current.index(*i)?,
            };
            match next {
                Some(reader) => current = reader,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Map keys in order, without decoding values.
    pub fn keys(&self) -> Result<Vec<&'a str>, DecodeError> {
        let mut cursor = Cursor::new(self.bytes, self.offset);
        if cursor.byte()? != TAG_MAP {
            return Ok(Vec::new());
        }
        let mut body = cursor.body()?;
        let count = body.count()?;
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            keys.push(body.str()?);
            body.skip()?;
        }
        Ok(keys)
    }
}
