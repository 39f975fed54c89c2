//! Structured-clone value model
//!
//! Record values are trees of primitives and shared compound nodes. Compound
//! nodes (`Object`, `Array`, `Map`, `Set`) live behind an [`ObjectRef`] so a
//! graph can reference the same node twice, or cycle back to an ancestor,
//! exactly like a JavaScript object graph.

mod codec;

use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use codec::{decode_value, encode_value, MAX_DEPTH};

/// A structured-clone compatible value.
#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i128),
    String(String),
    /// Milliseconds since the Unix epoch; NaN marks an invalid date.
    Date(f64),
    RegExp { source: String, flags: String },
    Binary(Binary),
    Object(ObjectRef),
}

/// Which binary view a [`Binary`] value was cloned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryKind {
    ArrayBuffer,
    Int8Array,
    Uint8Array,
    Uint8ClampedArray,
    Int16Array,
    Uint16Array,
    Int32Array,
    Uint32Array,
    Float32Array,
    Float64Array,
    BigInt64Array,
    BigUint64Array,
    DataView,
}

impl BinaryKind {
    const ALL: [BinaryKind; 13] = [
        BinaryKind::ArrayBuffer,
        BinaryKind::Int8Array,
        BinaryKind::Uint8Array,
        BinaryKind::Uint8ClampedArray,
        BinaryKind::Int16Array,
        BinaryKind::Uint16Array,
        BinaryKind::Int32Array,
        BinaryKind::Uint32Array,
        BinaryKind::Float32Array,
        BinaryKind::Float64Array,
        BinaryKind::BigInt64Array,
        BinaryKind::BigUint64Array,
        BinaryKind::DataView,
    ];

    pub(crate) fn to_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(tag: u8) -> Option<Self> {
        Self::ALL.get(usize::from(tag)).copied()
    }
}

/// Raw bytes plus the view they were taken from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binary {
    pub kind: BinaryKind,
    pub bytes: Vec<u8>,
}

impl Binary {
    pub fn new(kind: BinaryKind, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            bytes: bytes.into(),
        }
    }

    pub fn array_buffer(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(BinaryKind::ArrayBuffer, bytes)
    }
}

/// Contents of a compound node.
#[derive(Clone)]
pub enum Compound {
    /// Properties in insertion order.
    Object(Vec<(String, Value)>),
    Array(Vec<Value>),
    /// Entries in insertion order.
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
}

impl Compound {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Compound::Object(_) => "Object",
            Compound::Array(_) => "Array",
            Compound::Map(_) => "Map",
            Compound::Set(_) => "Set",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Compound::Object(props) => props.len(),
            Compound::Array(items) | Compound::Set(items) => items.len(),
            Compound::Map(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared handle to a compound node. Clones alias the same node.
#[derive(Clone)]
pub struct ObjectRef(Arc<RwLock<Compound>>);

impl ObjectRef {
    pub fn new(compound: Compound) -> Self {
        Self(Arc::new(RwLock::new(compound)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Compound> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Compound> {
        self.0.write()
    }

    /// Identity of the node, stable for its lifetime.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Look up an own property of a plain object.
    pub fn get(&self, property: &str) -> Option<Value> {
        match &*self.read() {
            Compound::Object(props) => props
                .iter()
                .find(|(name, _)| name == property)
                .map(|(_, value)| value.clone()),
            _ => None,
        }
    }

    /// Set (or append) a property of a plain object. Returns `false` for
    /// non-object nodes.
    pub fn set(&self, property: &str, value: Value) -> bool {
        match &mut *self.write() {
            Compound::Object(props) => {
                match props.iter_mut().find(|(name, _)| name == property) {
                    Some(slot) => slot.1 = value,
                    None => props.push((property.to_string(), value)),
                }
                true
            }
            _ => false,
        }
    }

    /// Append an element to an array or set node.
    pub fn push(&self, value: Value) -> bool {
        match &mut *self.write() {
            Compound::Array(items) | Compound::Set(items) => {
                items.push(value);
                true
            }
            _ => false,
        }
    }
}

impl Value {
    pub fn object<K: Into<String>>(props: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(ObjectRef::new(Compound::Object(
            props.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        )))
    }

    pub fn array(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Object(ObjectRef::new(Compound::Array(items.into_iter().collect())))
    }

    pub fn map(entries: impl IntoIterator<Item = (Value, Value)>) -> Self {
        Value::Object(ObjectRef::new(Compound::Map(entries.into_iter().collect())))
    }

    pub fn set(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Object(ObjectRef::new(Compound::Set(items.into_iter().collect())))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(node) => Some(node),
            _ => None,
        }
    }

    /// Property lookup on plain objects; `None` for anything else.
    pub fn get(&self, property: &str) -> Option<Value> {
        self.as_object().and_then(|node| node.get(property))
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::BigInt(_) => "bigint",
            Value::String(_) => "string",
            Value::Date(_) => "Date",
            Value::RegExp { .. } => "RegExp",
            Value::Binary(_) => "binary",
            Value::Object(_) => "object",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Binary> for Value {
    fn from(b: Binary) -> Self {
        Value::Binary(b)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::array(items.into_iter().map(Value::from)),
            serde_json::Value::Object(props) => {
                Value::object(props.into_iter().map(|(k, v)| (k, Value::from(v))))
            }
        }
    }
}

fn same_number(a: f64, b: f64) -> bool {
    a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan())
}

// Node pairs already under comparison are assumed equal, so cycles terminate.
fn structurally_equal(a: &Value, b: &Value, visiting: &mut Vec<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) | (Value::Date(x), Value::Date(y)) => {
            same_number(*x, *y)
        }
        (Value::BigInt(x), Value::BigInt(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (
            Value::RegExp { source, flags },
            Value::RegExp {
                source: other_source,
                flags: other_flags,
            },
        ) => source == other_source && flags == other_flags,
        (Value::Binary(x), Value::Binary(y)) => x == y,
        (Value::Object(x), Value::Object(y)) => {
            if x.ptr_eq(y) {
                return true;
            }
            let pair = (x.id(), y.id());
            if visiting.contains(&pair) {
                return true;
            }
            visiting.push(pair);
            let left = x.read().clone();
            let right = y.read().clone();
            let equal = match (&left, &right) {
                (Compound::Object(p), Compound::Object(q)) => {
                    p.len() == q.len()
                        && p.iter().zip(q.iter()).all(|((ka, va), (kb, vb))| {
                            ka == kb && structurally_equal(va, vb, visiting)
                        })
                }
                (Compound::Array(p), Compound::Array(q)) | (Compound::Set(p), Compound::Set(q)) => {
                    p.len() == q.len()
                        && p.iter()
                            .zip(q.iter())
                            .all(|(va, vb)| structurally_equal(va, vb, visiting))
                }
                (Compound::Map(p), Compound::Map(q)) => {
                    p.len() == q.len()
                        && p.iter().zip(q.iter()).all(|((ka, va), (kb, vb))| {
                            structurally_equal(ka, kb, visiting)
                                && structurally_equal(va, vb, visiting)
                        })
                }
                _ => false,
            };
            visiting.pop();
            equal
        }
        _ => false,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        structurally_equal(self, other, &mut Vec::new())
    }
}

fn describe(value: &Value, out: &mut String, ancestors: &mut Vec<usize>) {
    use std::fmt::Write;

    match value {
        Value::String(s) => {
            let _ = write!(out, "{:?}", s);
        }
        Value::Number(n) => {
            let _ = write!(out, "{}", n);
        }
        Value::BigInt(n) => {
            let _ = write!(out, "{}n", n);
        }
        Value::Bool(b) => {
            let _ = write!(out, "{}", b);
        }
        Value::Date(ms) => {
            let _ = write!(out, "Date({})", ms);
        }
        Value::RegExp { source, flags } => {
            let _ = write!(out, "/{}/{}", source, flags);
        }
        Value::Binary(b) => {
            let _ = write!(out, "{:?}({:?})", b.kind, b.bytes);
        }
        Value::Object(node) => {
            if ancestors.contains(&node.id()) {
                out.push_str("[Circular]");
                return;
            }
            ancestors.push(node.id());
            let compound = node.read().clone();
            match &compound {
                Compound::Object(props) => {
                    out.push('{');
                    for (i, (name, v)) in props.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        let _ = write!(out, "{}: ", name);
                        describe(v, out, ancestors);
                    }
                    out.push('}');
                }
                Compound::Array(items) | Compound::Set(items) => {
                    if matches!(compound, Compound::Set(_)) {
                        out.push_str("Set");
                    }
                    out.push('[');
                    for (i, v) in items.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        describe(v, out, ancestors);
                    }
                    out.push(']');
                }
                Compound::Map(entries) => {
                    out.push_str("Map{");
                    for (i, (k, v)) in entries.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        describe(k, out, ancestors);
                        out.push_str(" => ");
                        describe(v, out, ancestors);
                    }
                    out.push('}');
                }
            }
            ancestors.pop();
        }
        other => out.push_str(other.type_name()),
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        describe(self, &mut out, &mut Vec::new());
        f.write_str(&out)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&Value::Object(self.clone()), f)
    }
}
