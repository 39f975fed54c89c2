//! Binary structured-clone codec
//!
//! Layout: one format byte, then a tagged value. Compound nodes get an id in
//! first-visit order; a later visit to the same node writes a back-reference
//! to that id instead of the node, which is how shared and cyclic graphs
//! survive the round trip.
//!
//! Both directions recurse once per compound level and refuse graphs nested
//! deeper than [`MAX_DEPTH`], so anything that encodes also decodes.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::value::{Binary, BinaryKind, Compound, ObjectRef, Value};

const FORMAT_VERSION: u8 = 1;

// ── Tags (do not renumber: they are persisted) ─────────────
const TAG_UNDEFINED: u8 = 0x01;
const TAG_NULL: u8 = 0x02;
const TAG_FALSE: u8 = 0x03;
const TAG_TRUE: u8 = 0x04;
const TAG_NUMBER: u8 = 0x05;
const TAG_BIGINT: u8 = 0x06;
const TAG_STRING: u8 = 0x07;
const TAG_DATE: u8 = 0x08;
const TAG_REGEXP: u8 = 0x09;
const TAG_BINARY: u8 = 0x0A;
const TAG_OBJECT: u8 = 0x10;
const TAG_ARRAY: u8 = 0x11;
const TAG_MAP: u8 = 0x12;
const TAG_SET: u8 = 0x13;
const TAG_REFERENCE: u8 = 0x20;

/// Deepest chain of nested objects, arrays, maps and sets a value may hold.
pub const MAX_DEPTH: usize = 256;

fn too_deep() -> Error {
    Error::DataClone(format!("value nesting exceeds {} levels", MAX_DEPTH))
}

/// Serialize a value graph. Fails with `DataCloneError` when the graph is
/// nested deeper than [`MAX_DEPTH`].
pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    let mut encoder = Encoder {
        out: vec![FORMAT_VERSION],
        ids: HashMap::new(),
        depth: 0,
    };
    encoder.write(value)?;
    Ok(encoder.out)
}

/// Rebuild a value graph, restoring shared and cyclic references.
pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    let (&version, rest) = bytes
        .split_first()
        .ok_or_else(|| Error::DataClone("empty value payload".into()))?;
    if version != FORMAT_VERSION {
        return Err(Error::DataClone(format!(
            "unsupported value format version {}",
            version
        )));
    }

    let mut decoder = Decoder {
        input: rest,
        pos: 0,
        refs: Vec::new(),
        depth: 0,
    };
    let value = decoder.read()?;
    if decoder.pos != decoder.input.len() {
        return Err(Error::DataClone("trailing bytes after value".into()));
    }
    Ok(value)
}

struct Encoder {
    out: Vec<u8>,
    ids: HashMap<usize, u64>,
    depth: usize,
}

impl Encoder {
    fn write_len(&mut self, mut n: u64) {
        loop {
            let byte = (n & 0x7F) as u8;
            n >>= 7;
            if n == 0 {
                self.out.push(byte);
                return;
            }
            self.out.push(byte | 0x80);
        }
    }

    fn write_str(&mut self, s: &str) {
        self.write_len(s.len() as u64);
        self.out.extend_from_slice(s.as_bytes());
    }

    fn write(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Undefined => self.out.push(TAG_UNDEFINED),
            Value::Null => self.out.push(TAG_NULL),
            Value::Bool(false) => self.out.push(TAG_FALSE),
            Value::Bool(true) => self.out.push(TAG_TRUE),
            Value::Number(n) => {
                self.out.push(TAG_NUMBER);
                self.out.extend_from_slice(&n.to_le_bytes());
            }
            Value::BigInt(n) => {
                self.out.push(TAG_BIGINT);
                self.out.extend_from_slice(&n.to_le_bytes());
            }
            Value::String(s) => {
                self.out.push(TAG_STRING);
                self.write_str(s);
            }
            Value::Date(ms) => {
                self.out.push(TAG_DATE);
                self.out.extend_from_slice(&ms.to_le_bytes());
            }
            Value::RegExp { source, flags } => {
                self.out.push(TAG_REGEXP);
                self.write_str(source);
                self.write_str(flags);
            }
            Value::Binary(binary) => {
                self.out.push(TAG_BINARY);
                self.out.push(binary.kind.to_u8());
                self.write_len(binary.bytes.len() as u64);
                self.out.extend_from_slice(&binary.bytes);
            }
            Value::Object(node) => return self.write_node(node),
        }
        Ok(())
    }

    fn write_node(&mut self, node: &ObjectRef) -> Result<()> {
        if let Some(&id) = self.ids.get(&node.id()) {
            self.out.push(TAG_REFERENCE);
            self.write_len(id);
            return Ok(());
        }
        if self.depth == MAX_DEPTH {
            return Err(too_deep());
        }
        self.depth += 1;
        let id = self.ids.len() as u64;
        self.ids.insert(node.id(), id);

        // Shallow copy so no lock is held while children are visited.
        let compound = node.read().clone();
        match compound {
            Compound::Object(props) => {
                self.out.push(TAG_OBJECT);
                self.write_len(props.len() as u64);
                for (name, value) in &props {
                    self.write_str(name);
                    self.write(value)?;
                }
            }
            Compound::Array(items) => {
                self.out.push(TAG_ARRAY);
                self.write_len(items.len() as u64);
                for item in &items {
                    self.write(item)?;
                }
            }
            Compound::Map(entries) => {
                self.out.push(TAG_MAP);
                self.write_len(entries.len() as u64);
                for (key, value) in &entries {
                    self.write(key)?;
                    self.write(value)?;
                }
            }
            Compound::Set(items) => {
                self.out.push(TAG_SET);
                self.write_len(items.len() as u64);
                for item in &items {
                    self.write(item)?;
                }
            }
        }
        self.depth -= 1;
        Ok(())
    }
}

struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
    refs: Vec<ObjectRef>,
    depth: usize,
}

fn truncated() -> Error {
    Error::DataClone("truncated value payload".into())
}

impl<'a> Decoder<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let input = self.input;
        let end = self.pos.checked_add(n).ok_or_else(truncated)?;
        let slice = input.get(self.pos..end).ok_or_else(truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn read_len(&mut self) -> Result<u64> {
        let mut n: u64 = 0;
        for shift in (0..64).step_by(7) {
            let byte = self.byte()?;
            n |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(n);
            }
        }
        Err(Error::DataClone("length prefix overflows".into()))
    }

    fn read_count(&mut self) -> Result<usize> {
        let n = usize::try_from(self.read_len()?)
            .map_err(|_| Error::DataClone("length does not fit in memory".into()))?;
        // Every element needs at least one byte, which bounds bogus lengths.
        if n > self.input.len() - self.pos {
            return Err(truncated());
        }
        Ok(n)
    }

    fn read_str(&mut self) -> Result<String> {
        let len = self.read_count()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::DataClone(format!("invalid UTF-8 in string: {}", e)))
    }

    fn read(&mut self) -> Result<Value> {
        let tag = self.byte()?;
        let value = match tag {
            TAG_UNDEFINED => Value::Undefined,
            TAG_NULL => Value::Null,
            TAG_FALSE => Value::Bool(false),
            TAG_TRUE => Value::Bool(true),
            TAG_NUMBER => Value::Number(f64::from_le_bytes(self.array()?)),
            TAG_BIGINT => Value::BigInt(i128::from_le_bytes(self.array()?)),
            TAG_STRING => Value::String(self.read_str()?),
            TAG_DATE => Value::Date(f64::from_le_bytes(self.array()?)),
            TAG_REGEXP => {
                let source = self.read_str()?;
                let flags = self.read_str()?;
                Value::RegExp { source, flags }
            }
            TAG_BINARY => {
                let kind = BinaryKind::from_u8(self.byte()?)
                    .ok_or_else(|| Error::DataClone("unknown binary view kind".into()))?;
                let len = self.read_count()?;
                Value::Binary(Binary::new(kind, self.take(len)?))
            }
            TAG_REFERENCE => {
                let id = self.read_len()?;
                let node = usize::try_from(id)
                    .ok()
                    .and_then(|id| self.refs.get(id))
                    .ok_or_else(|| Error::DataClone(format!("dangling reference {}", id)))?;
                Value::Object(node.clone())
            }
            TAG_OBJECT | TAG_ARRAY | TAG_MAP | TAG_SET => self.read_node(tag)?,
            other => {
                return Err(Error::DataClone(format!("unknown value tag 0x{:02x}", other)));
            }
        };
        Ok(value)
    }

    fn read_node(&mut self, tag: u8) -> Result<Value> {
        if self.depth == MAX_DEPTH {
            return Err(too_deep());
        }
        self.depth += 1;

        // Register before reading children so back-references to it resolve.
        let empty = match tag {
            TAG_OBJECT => Compound::Object(Vec::new()),
            TAG_ARRAY => Compound::Array(Vec::new()),
            TAG_MAP => Compound::Map(Vec::new()),
            _ => Compound::Set(Vec::new()),
        };
        let node = ObjectRef::new(empty);
        self.refs.push(node.clone());

        let count = self.read_count()?;
        let filled = match tag {
            TAG_OBJECT => {
                let mut props = Vec::with_capacity(count);
                for _ in 0..count {
                    let name = self.read_str()?;
                    props.push((name, self.read()?));
                }
                Compound::Object(props)
            }
            TAG_MAP => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = self.read()?;
                    entries.push((key, self.read()?));
                }
                Compound::Map(entries)
            }
            _ => {
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.read()?);
                }
                if tag == TAG_ARRAY {
                    Compound::Array(items)
                } else {
                    Compound::Set(items)
                }
            }
        };
        *node.write() = filled;

        self.depth -= 1;
        Ok(Value::Object(node))
    }
}
