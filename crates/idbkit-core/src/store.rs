//! Object store handles

use std::sync::Arc;

use tracing::debug;

use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::key::{EncodedKey, Key};
use crate::keypath::KeyPath;
use crate::meta::{DatabaseMeta, Direction, IndexMeta, IndexParameters, ObjectStoreMeta};
use crate::range::Query;
use crate::transaction::{Request, Transaction, TxHandle};
use crate::value::{decode_value, encode_value, Value};

/// Name of the store with `id` in the working schema.
pub(crate) fn store_name(meta: &DatabaseMeta, id: u64) -> Result<String> {
    meta.store_by_id(id)
        .map(|store| store.name.clone())
        .ok_or_else(|| Error::InvalidState("object store has been deleted".into()))
}

pub(crate) fn decode_keys(encoded: Vec<EncodedKey>) -> Result<Vec<Key>> {
    encoded.iter().map(EncodedKey::decode).collect()
}

pub(crate) fn decode_values(values: Vec<Vec<u8>>) -> Result<Vec<Value>> {
    values.iter().map(|bytes| decode_value(bytes)).collect()
}

/// Where the primary key of a write comes from.
enum KeySource {
    Given(Key),
    /// Taken from the key generator, then written into the value at the
    /// path when the store uses in-line keys.
    Generated(Option<KeyPath>),
}

/// Handle to one object store within a transaction.
///
/// The store is tracked by id; a rename in the same transaction is visible
/// through existing handles, and an aborted rename reverts it.
#[derive(Clone)]
pub struct ObjectStore {
    handle: Arc<TxHandle>,
    id: u64,
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}

impl ObjectStore {
    pub(crate) fn new(handle: Arc<TxHandle>, store: &ObjectStoreMeta) -> Self {
        Self {
            handle,
            id: store.id,
        }
    }

    fn meta(&self) -> Result<ObjectStoreMeta> {
        self.handle.with_meta(|meta| {
            meta.store_by_id(self.id)
                .cloned()
                .ok_or_else(|| Error::InvalidState("object store has been deleted".into()))
        })
    }

    /// Current name; empty once the store has been deleted.
    pub fn name(&self) -> String {
        self.meta().map(|store| store.name).unwrap_or_default()
    }

    pub fn key_path(&self) -> Option<KeyPath> {
        self.meta().ok().and_then(|store| store.key_path)
    }

    pub fn auto_increment(&self) -> bool {
        self.meta().map(|store| store.auto_increment).unwrap_or(false)
    }

    /// Index names, sorted.
    pub fn index_names(&self) -> Vec<String> {
        self.handle.with_meta(|meta| {
            let Some(store) = meta.store_by_id(self.id) else {
                return Vec::new();
            };
            let mut names: Vec<String> = meta
                .indexes(&store.name)
                .iter()
                .map(|index| index.name.clone())
                .collect();
            names.sort();
            names
        })
    }

    pub fn transaction(&self) -> Transaction {
        Transaction::from_handle(self.handle.clone())
    }

    /// Store checks first, then transaction activity.
    fn check_readable(&self) -> Result<ObjectStoreMeta> {
        let store = self.meta()?;
        self.handle.check_active()?;
        Ok(store)
    }

    fn check_write(&self) -> Result<ObjectStoreMeta> {
        let store = self.check_readable()?;
        self.handle.check_writable()?;
        Ok(store)
    }

    // ── Writes ──────────────────────────────────────────────

    /// Insert or replace. The key comes from the key path or the key
    /// generator.
    pub fn put(&self, value: &Value) -> Request<Key> {
        self.write(value, None, true)
    }

    /// Insert or replace under an explicit key (out-of-line stores only).
    pub fn put_with_key(&self, value: &Value, key: impl Into<Key>) -> Request<Key> {
        self.write(value, Some(key.into()), true)
    }

    /// Insert; the request fails with `ConstraintError` when the key exists.
    pub fn add(&self, value: &Value) -> Request<Key> {
        self.write(value, None, false)
    }

    pub fn add_with_key(&self, value: &Value, key: impl Into<Key>) -> Request<Key> {
        self.write(value, Some(key.into()), false)
    }

    fn write(&self, value: &Value, key: Option<Key>, overwrite: bool) -> Request<Key> {
        let (source, bytes) = match self.prepare_write(value, key) {
            Ok(prepared) => prepared,
            Err(err) => return Request::ready(Err(err)),
        };
        let id = self.id;
        self.handle.request(move |tx| {
            let name = store_name(tx.meta(), id)?;
            let auto_increment = tx.meta().require_store(&name)?.auto_increment;
            let (key, bytes) = match source {
                KeySource::Given(key) => {
                    if auto_increment {
                        tx.bump_auto_increment(&name, &key)?;
                    }
                    (key, bytes)
                }
                KeySource::Generated(path) => {
                    let key = tx.next_auto_increment_key(&name)?;
                    let bytes = match path {
                        Some(path) => {
                            let copy = decode_value(&bytes)?;
                            path.inject_key(&copy, &key)?;
                            encode_value(&copy)?
                        }
                        None => bytes,
                    };
                    (key, bytes)
                }
            };
            if overwrite {
                tx.put(&name, &key, bytes)?;
            } else {
                tx.add(&name, &key, bytes)?;
            }
            Ok(key)
        })
    }

    /// Synchronous half of a write: resolve where the key comes from and
    /// clone the value.
    fn prepare_write(&self, value: &Value, key: Option<Key>) -> Result<(KeySource, Vec<u8>)> {
        let store = self.check_write()?;
        let source = match (&store.key_path, key) {
            (Some(_), Some(_)) => {
                return Err(Error::Data(
                    "object store uses in-line keys; an explicit key is not allowed".into(),
                ))
            }
            (None, Some(key)) => {
                key.check()?;
                KeySource::Given(key)
            }
            (None, None) if store.auto_increment => KeySource::Generated(None),
            (None, None) => {
                return Err(Error::Data(
                    "object store uses out-of-line keys and has no key generator".into(),
                ))
            }
            (Some(path), None) => match path.extract_key(value)? {
                Some(key) => KeySource::Given(key),
                None if store.auto_increment => {
                    path.check_injectable(value)?;
                    KeySource::Generated(Some(path.clone()))
                }
                None => {
                    return Err(Error::Data(format!(
                        "value has no key at key path {}",
                        path
                    )))
                }
            },
        };
        Ok((source, encode_value(value)?))
    }

    /// Delete the records matching `query`; `Query::All` is rejected, use
    /// `clear` instead.
    pub fn delete(&self, query: impl Into<Query>) -> Request<()> {
        let query = query.into();
        let prepared = self.check_write().and_then(|_| match query {
            Query::All => Err(Error::Data("delete requires a key or key range".into())),
            query => query.encode(),
        });
        let range = match prepared {
            Ok(range) => range,
            Err(err) => return Request::ready(Err(err)),
        };
        let id = self.id;
        self.handle.request(move |tx| {
            let name = store_name(tx.meta(), id)?;
            tx.delete(&name, &range)
        })
    }

    pub fn clear(&self) -> Request<()> {
        if let Err(err) = self.check_write() {
            return Request::ready(Err(err));
        }
        let id = self.id;
        self.handle.request(move |tx| {
            let name = store_name(tx.meta(), id)?;
            tx.clear(&name)
        })
    }

    // ── Reads ───────────────────────────────────────────────

    /// Value of the first record matching `query`.
    pub fn get(&self, query: impl Into<Query>) -> Request<Option<Value>> {
        let range = match self.check_readable().and_then(|_| query.into().encode()) {
            Ok(range) => range,
            Err(err) => return Request::ready(Err(err)),
        };
        let id = self.id;
        self.handle.request(move |tx| {
            let name = store_name(tx.meta(), id)?;
            tx.get(&name, &range)?
                .map(|bytes| decode_value(&bytes))
                .transpose()
        })
    }

    pub fn get_key(&self, query: impl Into<Query>) -> Request<Option<Key>> {
        let range = match self.check_readable().and_then(|_| query.into().encode()) {
            Ok(range) => range,
            Err(err) => return Request::ready(Err(err)),
        };
        let id = self.id;
        self.handle.request(move |tx| {
            let name = store_name(tx.meta(), id)?;
            tx.get_key(&name, &range)?.map(|key| key.decode()).transpose()
        })
    }

    /// Values in key order; a `count` of `None` or 0 means no limit.
    pub fn get_all(&self, query: impl Into<Query>, count: Option<u32>) -> Request<Vec<Value>> {
        let range = match self.check_readable().and_then(|_| query.into().encode()) {
            Ok(range) => range,
            Err(err) => return Request::ready(Err(err)),
        };
        let id = self.id;
        self.handle.request(move |tx| {
            let name = store_name(tx.meta(), id)?;
            decode_values(tx.get_all(&name, &range, count)?)
        })
    }

    pub fn get_all_keys(&self, query: impl Into<Query>, count: Option<u32>) -> Request<Vec<Key>> {
        let range = match self.check_readable().and_then(|_| query.into().encode()) {
            Ok(range) => range,
            Err(err) => return Request::ready(Err(err)),
        };
        let id = self.id;
        self.handle.request(move |tx| {
            let name = store_name(tx.meta(), id)?;
            decode_keys(tx.get_all_keys(&name, &range, count)?)
        })
    }

    pub fn count(&self, query: impl Into<Query>) -> Request<u64> {
        let range = match self.check_readable().and_then(|_| query.into().encode()) {
            Ok(range) => range,
            Err(err) => return Request::ready(Err(err)),
        };
        let id = self.id;
        self.handle.request(move |tx| {
            let name = store_name(tx.meta(), id)?;
            tx.count(&name, &range)
        })
    }

    // ── Cursors ─────────────────────────────────────────────

    /// Cursor over records; resolves to `None` when nothing matches.
    pub fn open_cursor(&self, query: impl Into<Query>, direction: Direction) -> Request<Option<Cursor>> {
        self.cursor(query.into(), direction, false)
    }

    /// Cursor over keys only; values are never loaded.
    pub fn open_key_cursor(
        &self,
        query: impl Into<Query>,
        direction: Direction,
    ) -> Request<Option<Cursor>> {
        self.cursor(query.into(), direction, true)
    }

    fn cursor(&self, query: Query, direction: Direction, key_only: bool) -> Request<Option<Cursor>> {
        let range = match self.check_readable().and_then(|_| query.encode()) {
            Ok(range) => range,
            Err(err) => return Request::ready(Err(err)),
        };
        let id = self.id;
        let handle = self.handle.clone();
        self.handle.request(move |tx| {
            let name = store_name(tx.meta(), id)?;
            let inner = if key_only {
                tx.open_key_cursor(&name, range, direction)?
            } else {
                tx.open_cursor(&name, range, direction)?
            };
            Ok(Cursor::open(handle, inner))
        })
    }

    // ── Indexes ─────────────────────────────────────────────

    pub fn index(&self, name: &str) -> Result<Index> {
        let store = self.meta()?;
        if self.handle.is_finished() {
            return Err(Error::InvalidState("transaction has finished".into()));
        }
        let index = self.handle.with_meta(|meta| {
            meta.index(&store.name, name)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("index '{}' not found", name)))
        })?;
        Ok(Index::new(self.handle.clone(), &index))
    }

    /// Create an index and backfill it from existing records. A unique
    /// violation during backfill aborts the upgrade with `ConstraintError`.
    pub fn create_index(
        &self,
        name: &str,
        key_path: impl Into<KeyPath>,
        params: IndexParameters,
    ) -> Result<Index> {
        let key_path = key_path.into();
        self.handle.check_upgrade()?;
        let store = self.meta()?;
        self.handle.check_active()?;
        if !key_path.is_valid() {
            return Err(Error::InvalidAccess(format!("invalid key path {}", key_path)));
        }
        if params.multi_entry && matches!(key_path, KeyPath::Array(_)) {
            return Err(Error::InvalidAccess(
                "multi-entry indexes require a string key path".into(),
            ));
        }
        let index = self.handle.edit_meta(|meta| {
            if meta.index(&store.name, name).is_some() {
                return Err(Error::Constraint(format!(
                    "index '{}' already exists on object store '{}'",
                    name, store.name
                )));
            }
            let index = IndexMeta {
                id: meta.allocate_id(),
                name: name.to_string(),
                store: store.name.clone(),
                key_path,
                unique: params.unique,
                multi_entry: params.multi_entry,
            };
            meta.add_index(index.clone())?;
            Ok(index)
        })?;
        debug!(store = %store.name, index = %index.name, "queued index creation");
        let queued = index.clone();
        self.handle.schema_op(move |tx| tx.create_index(queued));
        Ok(Index::new(self.handle.clone(), &index))
    }

    pub fn delete_index(&self, name: &str) -> Result<()> {
        self.handle.check_upgrade()?;
        let store = self.meta()?;
        self.handle.check_active()?;
        self.handle.edit_meta(|meta| meta.remove_index(&store.name, name))?;
        let name = name.to_string();
        self.handle
            .schema_op(move |tx| tx.delete_index(&store.name, &name));
        Ok(())
    }

    /// Rename the store. Indexes move with it.
    pub fn rename(&self, new_name: &str) -> Result<()> {
        self.handle.check_upgrade()?;
        let store = self.meta()?;
        self.handle.check_active()?;
        if store.name == new_name {
            return Ok(());
        }
        self.handle
            .edit_meta(|meta| meta.rename_store(&store.name, new_name))?;
        let to = new_name.to_string();
        self.handle
            .schema_op(move |tx| tx.rename_object_store(&store.name, &to));
        Ok(())
    }
}
