//! Key path evaluation and key injection

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::key::{validate_key, EncodedKey, Key};
use crate::value::{Compound, ObjectRef, Value};

/// Where a key lives inside a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    /// Dot-separated property path; empty means the value itself.
    String(String),
    /// Compound key: one sub-path per array element.
    Array(Vec<String>),
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' || first == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

fn is_valid_path(path: &str) -> bool {
    path.is_empty() || path.split('.').all(is_identifier)
}

fn evaluate_path(value: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(value.clone());
    }
    let mut current = value.clone();
    for segment in path.split('.') {
        let next = match &current {
            Value::String(s) if segment == "length" => {
                Value::Number(s.encode_utf16().count() as f64)
            }
            Value::Binary(binary) if segment == "byteLength" => {
                Value::Number(binary.bytes.len() as f64)
            }
            Value::Object(node) => match &*node.read() {
                Compound::Array(items) if segment == "length" => {
                    Value::Number(items.len() as f64)
                }
                Compound::Object(props) => props
                    .iter()
                    .find(|(name, _)| name == segment)
                    .map(|(_, v)| v.clone())?,
                compound @ (Compound::Map(_) | Compound::Set(_)) if segment == "size" => {
                    Value::Number(compound.len() as f64)
                }
                _ => return None,
            },
            _ => return None,
        };
        current = next;
    }
    Some(current)
}

impl KeyPath {
    /// Whether every segment is a valid identifier (arrays must be non-empty).
    pub fn is_valid(&self) -> bool {
        match self {
            KeyPath::String(path) => is_valid_path(path),
            KeyPath::Array(paths) => !paths.is_empty() && paths.iter().all(|p| is_valid_path(p)),
        }
    }

    /// Evaluate against a value; `None` when any step is missing.
    pub fn evaluate(&self, value: &Value) -> Option<Value> {
        match self {
            KeyPath::String(path) => evaluate_path(value, path),
            KeyPath::Array(paths) => paths
                .iter()
                .map(|path| evaluate_path(value, path))
                .collect::<Option<Vec<_>>>()
                .map(Value::array),
        }
    }

    /// Primary key of an in-line keyed value. A missing key is `Ok(None)`;
    /// a present but invalid one is a `DataError`.
    pub fn extract_key(&self, value: &Value) -> Result<Option<Key>> {
        match self.evaluate(value) {
            None => Ok(None),
            Some(found) => validate_key(&found).map(Some),
        }
    }

    /// Keys an index derives from a value. Invalid keys produce no entry;
    /// multi-entry arrays yield each distinct valid element once.
    pub fn index_keys(&self, value: &Value, multi_entry: bool) -> Vec<Key> {
        let Some(found) = self.evaluate(value) else {
            return Vec::new();
        };
        if multi_entry {
            if let Value::Object(node) = &found {
                let items = match &*node.read() {
                    Compound::Array(items) => Some(items.clone()),
                    _ => None,
                };
                if let Some(items) = items {
                    let unique: BTreeMap<EncodedKey, Key> = items
                        .iter()
                        .filter_map(|item| validate_key(item).ok())
                        .map(|key| (key.encode(), key))
                        .collect();
                    return unique.into_values().collect();
                }
            }
        }
        validate_key(&found).map(|key| vec![key]).unwrap_or_default()
    }

    fn injection_parts(&self) -> Result<(Vec<&str>, &str)> {
        match self {
            KeyPath::String(path) if !path.is_empty() => {
                let mut segments: Vec<&str> = path.split('.').collect();
                let last = segments.pop().unwrap_or_default();
                Ok((segments, last))
            }
            _ => Err(Error::Data(format!(
                "cannot inject a key through key path {}",
                self
            ))),
        }
    }

    /// Verify a generated key could be written into `value` without
    /// modifying it.
    pub fn check_injectable(&self, value: &Value) -> Result<()> {
        let (parents, _) = self.injection_parts()?;
        let mut current = plain_object(value)?;
        for segment in parents {
            match current.get(segment) {
                None => return Ok(()),
                Some(next) => current = plain_object(&next)?,
            }
        }
        Ok(())
    }

    /// Write `key` into `value` at this path, creating intermediate objects.
    pub fn inject_key(&self, value: &Value, key: &Key) -> Result<()> {
        let (parents, last) = self.injection_parts()?;
        let mut current = plain_object(value)?;
        for segment in parents {
            current = match current.get(segment) {
                Some(next) => plain_object(&next)?,
                None => {
                    let created = Value::object(Vec::<(String, Value)>::new());
                    current.set(segment, created.clone());
                    plain_object(&created)?
                }
            };
        }
        current.set(last, key.to_value());
        Ok(())
    }
}

fn plain_object(value: &Value) -> Result<ObjectRef> {
    match value {
        Value::Object(node) if matches!(&*node.read(), Compound::Object(_)) => Ok(node.clone()),
        other => Err(Error::Data(format!(
            "cannot inject a key into {:?}",
            other
        ))),
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPath::String(path) => write!(f, "{:?}", path),
            KeyPath::Array(paths) => write!(f, "{:?}", paths),
        }
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::String(path.to_string())
    }
}

impl From<Vec<&str>> for KeyPath {
    fn from(paths: Vec<&str>) -> Self {
        KeyPath::Array(paths.into_iter().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn person() -> Value {
        Value::from(serde_json::json!({
            "id": 7,
            "name": "Alice",
            "address": { "city": "Oslo" },
            "tags": ["a", "b", "a", true],
        }))
    }

    #[test]
    fn test_validity() {
        assert!(KeyPath::from("").is_valid());
        assert!(KeyPath::from("a.b_c.$d").is_valid());
        assert!(KeyPath::from(vec!["a", "b.c"]).is_valid());
        assert!(!KeyPath::from("a..b").is_valid());
        assert!(!KeyPath::from("1a").is_valid());
        assert!(!KeyPath::from("a b").is_valid());
        assert!(!KeyPath::Array(vec![]).is_valid());
    }

    #[test]
    fn test_extract_nested_and_compound() {
        let value = person();
        assert_eq!(
            KeyPath::from("address.city").extract_key(&value).unwrap(),
            Some(Key::from("Oslo"))
        );
        assert_eq!(
            KeyPath::from(vec!["name", "id"]).extract_key(&value).unwrap(),
            Some(Key::Array(vec![Key::from("Alice"), Key::from(7)]))
        );
        assert_eq!(KeyPath::from("missing").extract_key(&value).unwrap(), None);
        assert_eq!(
            KeyPath::from("name.length").extract_key(&value).unwrap(),
            Some(Key::from(5))
        );
        assert!(KeyPath::from("address").extract_key(&value).is_err());
    }

    #[test]
    fn test_multi_entry_dedupes_and_skips_invalid() {
        let keys = KeyPath::from("tags").index_keys(&person(), true);
        assert_eq!(keys, vec![Key::from("a"), Key::from("b")]);

        // Without multi-entry the array contains a boolean, so it is no key.
        assert!(KeyPath::from("tags").index_keys(&person(), false).is_empty());
    }

    #[test]
    fn test_inject_creates_intermediate_objects() {
        let value = Value::object(vec![("name", Value::from("x"))]);
        let path = KeyPath::from("meta.id");
        path.check_injectable(&value).unwrap();
        path.inject_key(&value, &Key::from(3)).unwrap();
        assert_eq!(path.extract_key(&value).unwrap(), Some(Key::from(3)));
    }

    #[test]
    fn test_inject_rejects_primitives_in_the_way() {
        let value = Value::object(vec![("meta", Value::from(1))]);
        let path = KeyPath::from("meta.id");
        assert!(matches!(path.check_injectable(&value), Err(Error::Data(_))));
        assert!(KeyPath::from("id").check_injectable(&Value::from("str")).is_err());
    }
}
