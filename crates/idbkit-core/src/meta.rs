//! Schema metadata
//!
//! `DatabaseMeta` is the single source of truth for a database's schema. It
//! is serialized as-is by durable backends, so field names are persisted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::keypath::KeyPath;

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    VersionChange,
}

impl TransactionMode {
    pub fn is_writable(self) -> bool {
        !matches!(self, TransactionMode::ReadOnly)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionMode::ReadOnly => "readonly",
            TransactionMode::ReadWrite => "readwrite",
            TransactionMode::VersionChange => "versionchange",
        }
    }
}

/// Cursor iteration direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Next,
    NextUnique,
    Prev,
    PrevUnique,
}

impl Direction {
    pub fn is_forward(self) -> bool {
        matches!(self, Direction::Next | Direction::NextUnique)
    }

    pub fn is_unique(self) -> bool {
        matches!(self, Direction::NextUnique | Direction::PrevUnique)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStoreMeta {
    pub id: u64,
    pub name: String,
    pub key_path: Option<KeyPath>,
    pub auto_increment: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub id: u64,
    pub name: String,
    /// Name of the owning object store.
    pub store: String,
    pub key_path: KeyPath,
    pub unique: bool,
    pub multi_entry: bool,
}

/// Options for `create_object_store`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectStoreParameters {
    pub key_path: Option<KeyPath>,
    pub auto_increment: bool,
}

impl ObjectStoreParameters {
    pub fn key_path(path: impl Into<KeyPath>) -> Self {
        Self {
            key_path: Some(path.into()),
            auto_increment: false,
        }
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Reject invalid paths and combinations IndexedDB forbids.
    pub fn validate(&self) -> Result<()> {
        match &self.key_path {
            Some(path) if !path.is_valid() => Err(Error::InvalidAccess(format!(
                "invalid key path {}",
                path
            ))),
            Some(KeyPath::Array(_)) if self.auto_increment => Err(Error::InvalidAccess(
                "auto increment requires a string key path".into(),
            )),
            Some(KeyPath::String(path)) if self.auto_increment && path.is_empty() => Err(
                Error::InvalidAccess("auto increment requires a non-empty key path".into()),
            ),
            _ => Ok(()),
        }
    }
}

/// Options for `create_index`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexParameters {
    pub unique: bool,
    pub multi_entry: bool,
}

impl IndexParameters {
    pub fn unique() -> Self {
        Self {
            unique: true,
            multi_entry: false,
        }
    }

    pub fn multi_entry() -> Self {
        Self {
            unique: false,
            multi_entry: true,
        }
    }
}

/// Name and version as reported by `Factory::databases`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseMeta {
    pub name: String,
    pub version: u64,
    pub stores: BTreeMap<String, ObjectStoreMeta>,
    /// Indexes keyed by owning store name.
    pub indexes: BTreeMap<String, Vec<IndexMeta>>,
    pub next_object_id: u64,
}

impl DatabaseMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            stores: BTreeMap::new(),
            indexes: BTreeMap::new(),
            next_object_id: 1,
        }
    }

    pub fn info(&self) -> DatabaseInfo {
        DatabaseInfo {
            name: self.name.clone(),
            version: self.version,
        }
    }

    pub fn store_names(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }

    pub fn store(&self, name: &str) -> Option<&ObjectStoreMeta> {
        self.stores.get(name)
    }

    pub fn store_by_id(&self, id: u64) -> Option<&ObjectStoreMeta> {
        self.stores.values().find(|store| store.id == id)
    }

    pub fn indexes(&self, store: &str) -> &[IndexMeta] {
        self.indexes.get(store).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn index(&self, store: &str, name: &str) -> Option<&IndexMeta> {
        self.indexes(store).iter().find(|index| index.name == name)
    }

    pub fn index_by_id(&self, id: u64) -> Option<&IndexMeta> {
        self.indexes.values().flatten().find(|index| index.id == id)
    }

    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_object_id;
        self.next_object_id += 1;
        id
    }

    /// Store meta or `NotFoundError`.
    pub fn require_store(&self, name: &str) -> Result<&ObjectStoreMeta> {
        self.store(name)
            .ok_or_else(|| Error::NotFound(format!("object store '{}'", name)))
    }

    pub fn require_index(&self, store: &str, name: &str) -> Result<&IndexMeta> {
        self.index(store, name)
            .ok_or_else(|| Error::NotFound(format!("index '{}' on object store '{}'", name, store)))
    }

    pub fn add_store(&mut self, store: ObjectStoreMeta) -> Result<()> {
        if self.stores.contains_key(&store.name) {
            return Err(Error::Constraint(format!(
                "object store '{}' already exists",
                store.name
            )));
        }
        self.stores.insert(store.name.clone(), store);
        Ok(())
    }

    /// Remove a store and all of its indexes.
    pub fn remove_store(&mut self, name: &str) -> Result<ObjectStoreMeta> {
        let store = self
            .stores
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("object store '{}'", name)))?;
        self.indexes.remove(name);
        Ok(store)
    }

    pub fn rename_store(&mut self, from: &str, to: &str) -> Result<()> {
        if from == to {
            return self.require_store(from).map(|_| ());
        }
        if self.stores.contains_key(to) {
            return Err(Error::Constraint(format!("object store '{}' already exists", to)));
        }
        let mut store = self.remove_store_only(from)?;
        store.name = to.to_string();
        self.stores.insert(to.to_string(), store);
        if let Some(mut indexes) = self.indexes.remove(from) {
            for index in &mut indexes {
                index.store = to.to_string();
            }
            self.indexes.insert(to.to_string(), indexes);
        }
        Ok(())
    }

    fn remove_store_only(&mut self, name: &str) -> Result<ObjectStoreMeta> {
        self.stores
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("object store '{}'", name)))
    }

    pub fn add_index(&mut self, index: IndexMeta) -> Result<()> {
        self.require_store(&index.store)?;
        if self.index(&index.store, &index.name).is_some() {
            return Err(Error::Constraint(format!(
                "index '{}' already exists on object store '{}'",
                index.name, index.store
            )));
        }
        self.indexes.entry(index.store.clone()).or_default().push(index);
        Ok(())
    }

    pub fn remove_index(&mut self, store: &str, name: &str) -> Result<IndexMeta> {
        self.require_index(store, name)?;
        let list = self.indexes.entry(store.to_string()).or_default();
        let position = list
            .iter()
            .position(|index| index.name == name)
            .ok_or_else(|| Error::NotFound(format!("index '{}'", name)))?;
        let removed = list.remove(position);
        if list.is_empty() {
            self.indexes.remove(store);
        }
        Ok(removed)
    }

    pub fn rename_index(&mut self, store: &str, from: &str, to: &str) -> Result<()> {
        self.require_index(store, from)?;
        if from == to {
            return Ok(());
        }
        if self.index(store, to).is_some() {
            return Err(Error::Constraint(format!(
                "index '{}' already exists on object store '{}'",
                to, store
            )));
        }
        if let Some(index) = self
            .indexes
            .get_mut(store)
            .and_then(|list| list.iter_mut().find(|index| index.name == from))
        {
            index.name = to.to_string();
        }
        Ok(())
    }
}
