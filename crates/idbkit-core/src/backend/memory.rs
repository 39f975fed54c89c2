//! In-memory storage backend
//!
//! Keeps every database in process memory. Data outlives connections, so a
//! database closed and reopened through the same `MemoryBackend` still has
//! its records. Not durable across processes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::backend::ordered::{seek_flat, seek_nested};
use crate::backend::{
    BackendDatabase, BackendTransaction, Position, ScanDirection, StorageBackend,
};
use crate::error::{Error, Result};
use crate::key::EncodedKey;
use crate::meta::{DatabaseInfo, DatabaseMeta, IndexMeta, ObjectStoreMeta, TransactionMode};
use crate::range::KeyRangeSpec;

/// Index entries plus the reverse map from primary key to the index keys
/// that point at it.
#[derive(Debug, Clone, Default)]
struct IndexData {
    entries: BTreeMap<EncodedKey, BTreeSet<EncodedKey>>,
    by_primary: BTreeMap<EncodedKey, BTreeSet<EncodedKey>>,
}

impl IndexData {
    fn insert(&mut self, key: EncodedKey, primary: EncodedKey) {
        self.by_primary
            .entry(primary.clone())
            .or_default()
            .insert(key.clone());
        self.entries.entry(key).or_default().insert(primary);
    }

    fn remove_primary(&mut self, primary: &EncodedKey) {
        let Some(keys) = self.by_primary.remove(primary) else {
            return;
        };
        for key in keys {
            if let Some(primaries) = self.entries.get_mut(&key) {
                primaries.remove(primary);
                if primaries.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.by_primary.clear();
    }
}

#[derive(Debug, Clone)]
struct StoreData {
    records: BTreeMap<EncodedKey, Vec<u8>>,
    indexes: HashMap<String, IndexData>,
    /// Next generated key.
    counter: u64,
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            indexes: HashMap::new(),
            counter: 1,
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryState {
    meta: DatabaseMeta,
    stores: HashMap<String, StoreData>,
}

/// In-memory storage backend.
///
/// Useful for:
/// - Unit testing
/// - Short-lived processes that don't need persistence
#[derive(Debug, Default)]
pub struct MemoryBackend {
    databases: Mutex<HashMap<String, Arc<Mutex<MemoryState>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn open(&self, name: &str) -> Result<Arc<dyn BackendDatabase>> {
        let state = self
            .databases
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(database = %name, "creating in-memory database");
                Arc::new(Mutex::new(MemoryState {
                    meta: DatabaseMeta::new(name),
                    stores: HashMap::new(),
                }))
            })
            .clone();
        Ok(Arc::new(MemoryDatabase { state }))
    }

    fn delete_database(&self, name: &str) -> Result<()> {
        if self.databases.lock().remove(name).is_some() {
            debug!(database = %name, "deleted in-memory database");
        }
        Ok(())
    }

    fn databases(&self) -> Result<Vec<DatabaseInfo>> {
        let databases = self.databases.lock();
        let mut infos: Vec<DatabaseInfo> = databases
            .values()
            .map(|state| state.lock().meta.info())
            .filter(|info| info.version > 0)
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }
}

struct MemoryDatabase {
    state: Arc<Mutex<MemoryState>>,
}

impl BackendDatabase for MemoryDatabase {
    fn meta(&self) -> DatabaseMeta {
        self.state.lock().meta.clone()
    }

    fn begin_transaction(
        &self,
        _scope: &[String],
        mode: TransactionMode,
    ) -> Result<Box<dyn BackendTransaction>> {
        let guard = self.state.lock();
        let snapshot = (mode == TransactionMode::VersionChange).then(|| guard.clone());
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            meta: guard.meta.clone(),
            mode,
            snapshot,
            saved: HashMap::new(),
        }))
    }
}

/// Mutates live state in place and keeps what it needs to undo: a copy of
/// the whole database for versionchange, otherwise a copy of each store
/// taken before its first write.
struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    meta: DatabaseMeta,
    mode: TransactionMode,
    snapshot: Option<MemoryState>,
    saved: HashMap<String, Option<StoreData>>,
}

fn missing_store(name: &str) -> Error {
    Error::NotFound(format!("object store '{}'", name))
}

fn missing_index(store: &str, name: &str) -> Error {
    Error::NotFound(format!("index '{}' on object store '{}'", name, store))
}

impl MemoryTransaction {
    fn read<R>(&self, store: &str, f: impl FnOnce(&StoreData) -> R) -> Result<R> {
        let state = self.state.lock();
        state.stores.get(store).map(f).ok_or_else(|| missing_store(store))
    }

    fn write<R>(&mut self, store: &str, f: impl FnOnce(&mut StoreData) -> Result<R>) -> Result<R> {
        if !self.mode.is_writable() {
            return Err(Error::ReadOnly("transaction is readonly".into()));
        }
        let mut state = self.state.lock();
        if self.snapshot.is_none() && !self.saved.contains_key(store) {
            self.saved
                .insert(store.to_string(), state.stores.get(store).cloned());
        }
        let data = state.stores.get_mut(store).ok_or_else(|| missing_store(store))?;
        f(data)
    }

    fn write_index<R>(
        &mut self,
        store: &str,
        index: &str,
        f: impl FnOnce(&mut IndexData) -> R,
    ) -> Result<R> {
        self.write(store, |data| {
            data.indexes
                .get_mut(index)
                .map(f)
                .ok_or_else(|| missing_index(store, index))
        })
    }

    fn schema(&mut self, f: impl FnOnce(&mut MemoryState) -> Result<()>) -> Result<()> {
        if self.mode != TransactionMode::VersionChange {
            return Err(Error::InvalidState(
                "schema changes require a versionchange transaction".into(),
            ));
        }
        f(&mut self.state.lock())
    }
}

impl BackendTransaction for MemoryTransaction {
    fn meta(&self) -> &DatabaseMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut DatabaseMeta {
        &mut self.meta
    }

    fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn store_create(&mut self, store: &ObjectStoreMeta) -> Result<()> {
        self.schema(|state| {
            state.stores.insert(store.name.clone(), StoreData::default());
            Ok(())
        })
    }

    fn store_delete(&mut self, name: &str) -> Result<()> {
        self.schema(|state| {
            state.stores.remove(name).map(|_| ()).ok_or_else(|| missing_store(name))
        })
    }

    fn store_rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.schema(|state| {
            let data = state.stores.remove(from).ok_or_else(|| missing_store(from))?;
            state.stores.insert(to.to_string(), data);
            Ok(())
        })
    }

    fn index_create(&mut self, index: &IndexMeta) -> Result<()> {
        self.schema(|state| {
            let data = state
                .stores
                .get_mut(&index.store)
                .ok_or_else(|| missing_store(&index.store))?;
            data.indexes.insert(index.name.clone(), IndexData::default());
            Ok(())
        })
    }

    fn index_delete(&mut self, store: &str, name: &str) -> Result<()> {
        self.schema(|state| {
            let data = state.stores.get_mut(store).ok_or_else(|| missing_store(store))?;
            data.indexes
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| missing_index(store, name))
        })
    }

    fn index_rename(&mut self, store: &str, from: &str, to: &str) -> Result<()> {
        self.schema(|state| {
            let data = state.stores.get_mut(store).ok_or_else(|| missing_store(store))?;
            let index = data.indexes.remove(from).ok_or_else(|| missing_index(store, from))?;
            data.indexes.insert(to.to_string(), index);
            Ok(())
        })
    }

    fn record_get(&mut self, store: &str, key: &EncodedKey) -> Result<Option<Vec<u8>>> {
        self.read(store, |data| data.records.get(key).cloned())
    }

    fn record_put(&mut self, store: &str, key: EncodedKey, value: Vec<u8>) -> Result<()> {
        self.write(store, |data| {
            data.records.insert(key, value);
            Ok(())
        })
    }

    fn record_delete(&mut self, store: &str, key: &EncodedKey) -> Result<()> {
        self.write(store, |data| {
            data.records.remove(key);
            Ok(())
        })
    }

    fn record_clear(&mut self, store: &str) -> Result<()> {
        self.write(store, |data| {
            data.records.clear();
            for index in data.indexes.values_mut() {
                index.clear();
            }
            Ok(())
        })
    }

    fn record_seek(
        &mut self,
        store: &str,
        range: &KeyRangeSpec,
        direction: ScanDirection,
        after: Option<&Position>,
    ) -> Result<Option<(EncodedKey, Vec<u8>)>> {
        self.read(store, |data| {
            seek_flat(&data.records, range, direction, after, |_| false)
                .map(|(key, value)| (key.clone(), value.clone()))
        })
    }

    fn index_insert(
        &mut self,
        store: &str,
        index: &str,
        key: EncodedKey,
        primary: EncodedKey,
    ) -> Result<()> {
        self.write_index(store, index, |data| data.insert(key, primary))
    }

    fn index_delete_primary(
        &mut self,
        store: &str,
        index: &str,
        primary: &EncodedKey,
    ) -> Result<()> {
        self.write_index(store, index, |data| data.remove_primary(primary))
    }

    fn index_seek(
        &mut self,
        store: &str,
        index: &str,
        range: &KeyRangeSpec,
        direction: ScanDirection,
        after: Option<&Position>,
    ) -> Result<Option<(EncodedKey, EncodedKey)>> {
        self.read(store, |data| {
            data.indexes
                .get(index)
                .map(|data| seek_nested(&data.entries, range, direction, after))
                .ok_or_else(|| missing_index(store, index))
        })?
    }

    fn counter_get(&mut self, store: &str) -> Result<u64> {
        self.read(store, |data| data.counter)
    }

    fn counter_set(&mut self, store: &str, next: u64) -> Result<()> {
        self.write(store, |data| {
            data.counter = next;
            Ok(())
        })
    }

    fn commit(self: Box<Self>) -> Result<()> {
        if self.mode == TransactionMode::VersionChange {
            self.state.lock().meta = self.meta;
        }
        Ok(())
    }

    fn abort(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(snapshot) = self.snapshot {
            *state = snapshot;
            return Ok(());
        }
        for (name, saved) in self.saved {
            match saved {
                Some(data) => {
                    state.stores.insert(name, data);
                }
                None => {
                    state.stores.remove(&name);
                }
            }
        }
        Ok(())
    }
}
