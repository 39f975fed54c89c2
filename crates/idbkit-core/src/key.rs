//! Order-preserving key codec
//!
//! Every [`Key`] encodes to bytes whose lexicographic order equals the
//! IndexedDB key order, so backends can compare and range-scan raw bytes.
//!
//! Layout per key: one type tag, then the payload.
//! - Number / Date: 8 bytes, IEEE-754 bits with the sign bit flipped for
//!   positives and all bits inverted for negatives (`-0` sorts before `+0`).
//! - String: UTF-16 code units big-endian, binary: raw bytes; both escape
//!   `00` as `00 FF` and end with `00 00`.
//! - Array: each element with its own tag, then a `00` terminator. Tags are
//!   all above `00`, so shorter arrays sort before their extensions.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use crate::error::{Error, Result};
use crate::value::{Binary, Compound, Value};

// ── Type tags (load-bearing: never reorder) ────────────────
pub const TAG_NUMBER: u8 = 0x10;
pub const TAG_DATE: u8 = 0x20;
pub const TAG_STRING: u8 = 0x30;
pub const TAG_BINARY: u8 = 0x40;
pub const TAG_ARRAY: u8 = 0x50;

const ARRAY_END: u8 = 0x00;
const ESCAPE: u8 = 0xFF;

/// A valid IndexedDB key.
#[derive(Debug, Clone)]
pub enum Key {
    Number(f64),
    /// Milliseconds since the Unix epoch.
    Date(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Key>),
}

/// Byte form of a [`Key`]; derived ordering is key ordering.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EncodedKey(Vec<u8>);

impl EncodedKey {
    /// Wrap bytes read back from storage. Validity is checked on decode.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn decode(&self) -> Result<Key> {
        decode_key(&self.0)
    }
}

impl std::borrow::Borrow<[u8]> for EncodedKey {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for EncodedKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for EncodedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match decode_key(&self.0) {
            Ok(key) => write!(f, "EncodedKey({:?})", key),
            Err(_) => write!(f, "EncodedKey({:02x?})", self.0),
        }
    }
}

const fn ordered_f64_bytes(value: f64) -> [u8; 8] {
    let bits = value.to_bits();
    let ordered = if bits & 0x8000_0000_0000_0000 == 0 {
        bits ^ 0x8000_0000_0000_0000
    } else {
        !bits
    };
    ordered.to_be_bytes()
}

const fn f64_from_ordered(bytes: [u8; 8]) -> f64 {
    let ordered = u64::from_be_bytes(bytes);
    let bits = if ordered & 0x8000_0000_0000_0000 != 0 {
        ordered ^ 0x8000_0000_0000_0000
    } else {
        !ordered
    };
    f64::from_bits(bits)
}

fn push_terminated_bytes(out: &mut Vec<u8>, bytes: impl IntoIterator<Item = u8>) {
    for byte in bytes {
        if byte == 0 {
            out.extend_from_slice(&[0, ESCAPE]);
        } else {
            out.push(byte);
        }
    }
    out.extend_from_slice(&[0, 0]);
}

fn encode_into(key: &Key, out: &mut Vec<u8>) {
    match key {
        Key::Number(n) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&ordered_f64_bytes(*n));
        }
        Key::Date(ms) => {
            out.push(TAG_DATE);
            out.extend_from_slice(&ordered_f64_bytes(*ms));
        }
        Key::String(s) => {
            out.push(TAG_STRING);
            push_terminated_bytes(out, s.encode_utf16().flat_map(u16::to_be_bytes));
        }
        Key::Binary(bytes) => {
            out.push(TAG_BINARY);
            push_terminated_bytes(out, bytes.iter().copied());
        }
        Key::Array(items) => {
            out.push(TAG_ARRAY);
            for item in items {
                encode_into(item, out);
            }
            out.push(ARRAY_END);
        }
    }
}

/// Encode a key into its order-preserving byte form.
pub fn encode_key(key: &Key) -> EncodedKey {
    let mut out = Vec::new();
    encode_into(key, &mut out);
    EncodedKey(out)
}

/// Decode bytes produced by [`encode_key`].
pub fn decode_key(bytes: &[u8]) -> Result<Key> {
    let mut reader = KeyReader { bytes, pos: 0 };
    let key = reader.read()?;
    if reader.pos != bytes.len() {
        return Err(Error::Data("trailing bytes after encoded key".into()));
    }
    Ok(key)
}

/// Byte-wise comparison of two encoded keys, which is key-order comparison.
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

struct KeyReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

fn malformed(what: &str) -> Error {
    Error::Data(format!("malformed encoded key: {}", what))
}

impl KeyReader<'_> {
    fn byte(&mut self) -> Result<u8> {
        let byte = *self.bytes.get(self.pos).ok_or_else(|| malformed("truncated"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn f64(&mut self) -> Result<f64> {
        let end = self.pos + 8;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| malformed("truncated number"))?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(slice);
        self.pos = end;
        Ok(f64_from_ordered(buf))
    }

    fn terminated(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            match self.byte()? {
                0 => match self.byte()? {
                    0 => return Ok(out),
                    ESCAPE => out.push(0),
                    _ => return Err(malformed("bad escape sequence")),
                },
                byte => out.push(byte),
            }
        }
    }

    fn read(&mut self) -> Result<Key> {
        match self.byte()? {
            TAG_NUMBER => Ok(Key::Number(self.f64()?)),
            TAG_DATE => Ok(Key::Date(self.f64()?)),
            TAG_STRING => {
                let raw = self.terminated()?;
                if raw.len() % 2 != 0 {
                    return Err(malformed("odd-length string payload"));
                }
                let units: Vec<u16> = raw
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16(&units)
                    .map(Key::String)
                    .map_err(|_| malformed("unpaired surrogate in string"))
            }
            TAG_BINARY => Ok(Key::Binary(self.terminated()?)),
            TAG_ARRAY => {
                let mut items = Vec::new();
                loop {
                    if self.bytes.get(self.pos) == Some(&ARRAY_END) {
                        self.pos += 1;
                        return Ok(Key::Array(items));
                    }
                    items.push(self.read()?);
                }
            }
            other => Err(malformed(&format!("unknown type tag 0x{:02x}", other))),
        }
    }
}

/// Largest time value a Date can hold, in milliseconds from the epoch.
const MAX_DATE_MS: f64 = 8.64e15;

/// Dates outside the representable range (including ±Infinity) are invalid.
fn valid_date(ms: f64) -> bool {
    ms.is_finite() && ms.abs() <= MAX_DATE_MS
}

impl Key {
    fn tag(&self) -> u8 {
        match self {
            Key::Number(_) => TAG_NUMBER,
            Key::Date(_) => TAG_DATE,
            Key::String(_) => TAG_STRING,
            Key::Binary(_) => TAG_BINARY,
            Key::Array(_) => TAG_ARRAY,
        }
    }

    pub fn encode(&self) -> EncodedKey {
        encode_key(self)
    }

    /// Reject keys that could not have come from [`validate_key`]
    /// (NaN numbers, invalid dates), recursively.
    pub fn check(&self) -> Result<()> {
        match self {
            Key::Number(n) if n.is_nan() => Err(Error::Data("NaN is not a valid key".into())),
            Key::Date(ms) if !valid_date(*ms) => {
                Err(Error::Data("invalid Date is not a valid key".into()))
            }
            Key::Array(items) => items.iter().try_for_each(Key::check),
            _ => Ok(()),
        }
    }

    /// Convert back to a value, e.g. to inject a generated key into a record.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(n) => Value::Number(*n),
            Key::Date(ms) => Value::Date(*ms),
            Key::String(s) => Value::String(s.clone()),
            Key::Binary(bytes) => Value::Binary(Binary::array_buffer(bytes.clone())),
            Key::Array(items) => Value::array(items.iter().map(Key::to_value)),
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    /// Logical IndexedDB order, consistent with the byte encoding.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) | (Key::Date(a), Key::Date(b)) => a.total_cmp(b),
            (Key::String(a), Key::String(b)) => a.encode_utf16().cmp(b.encode_utf16()),
            (Key::Binary(a), Key::Binary(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            _ => self.tag().cmp(&other.tag()),
        }
    }
}

impl From<f64> for Key {
    fn from(n: f64) -> Self {
        Key::Number(n)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Number(f64::from(n))
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

impl From<Vec<Key>> for Key {
    fn from(items: Vec<Key>) -> Self {
        Key::Array(items)
    }
}

fn validate_inner(value: &Value, seen: &mut HashSet<usize>) -> Result<Key> {
    match value {
        Value::Number(n) if n.is_nan() => Err(Error::Data("NaN is not a valid key".into())),
        Value::Number(n) => Ok(Key::Number(*n)),
        Value::Date(ms) if !valid_date(*ms) => {
            Err(Error::Data("invalid Date is not a valid key".into()))
        }
        Value::Date(ms) => Ok(Key::Date(*ms)),
        Value::String(s) => Ok(Key::String(s.clone())),
        Value::Binary(binary) => Ok(Key::Binary(binary.bytes.clone())),
        Value::Object(node) => {
            let items = match &*node.read() {
                Compound::Array(items) => items.clone(),
                other => {
                    return Err(Error::Data(format!(
                        "{} is not a valid key",
                        other.kind_name()
                    )))
                }
            };
            if !seen.insert(node.id()) {
                return Err(Error::Data("cyclic array is not a valid key".into()));
            }
            let keys = items
                .iter()
                .map(|item| validate_inner(item, seen))
                .collect::<Result<Vec<_>>>()?;
            seen.remove(&node.id());
            Ok(Key::Array(keys))
        }
        other => Err(Error::Data(format!("{:?} is not a valid key", other))),
    }
}

/// Convert a value into a key, rejecting anything IndexedDB does not accept
/// as a key.
pub fn validate_key(value: &Value) -> Result<Key> {
    validate_inner(value, &mut HashSet::new())
}
