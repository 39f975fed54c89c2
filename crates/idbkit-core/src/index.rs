//! Index handles

use std::sync::Arc;

use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::keypath::KeyPath;
use crate::meta::{DatabaseMeta, Direction, IndexMeta};
use crate::range::{KeyRangeSpec, Query};
use crate::store::{decode_keys, decode_values, ObjectStore};
use crate::transaction::{Request, TxHandle};
use crate::value::{decode_value, Value};

/// `(store name, index name)` of the index with `id` in the working schema.
pub(crate) fn index_names(meta: &DatabaseMeta, id: u64) -> Result<(String, String)> {
    meta.index_by_id(id)
        .filter(|index| meta.store(&index.store).is_some())
        .map(|index| (index.store.clone(), index.name.clone()))
        .ok_or_else(|| Error::InvalidState("index has been deleted".into()))
}

/// Handle to one index within a transaction. Tracked by id, like
/// [`ObjectStore`].
#[derive(Clone)]
pub struct Index {
    handle: Arc<TxHandle>,
    id: u64,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}

impl Index {
    pub(crate) fn new(handle: Arc<TxHandle>, index: &IndexMeta) -> Self {
        Self {
            handle,
            id: index.id,
        }
    }

    fn meta(&self) -> Result<IndexMeta> {
        self.handle.with_meta(|meta| {
            index_names(meta, self.id)?;
            meta.index_by_id(self.id)
                .cloned()
                .ok_or_else(|| Error::InvalidState("index has been deleted".into()))
        })
    }

    pub fn name(&self) -> String {
        self.meta().map(|index| index.name).unwrap_or_default()
    }

    pub fn key_path(&self) -> Option<KeyPath> {
        self.meta().ok().map(|index| index.key_path)
    }

    pub fn unique(&self) -> bool {
        self.meta().map(|index| index.unique).unwrap_or(false)
    }

    pub fn multi_entry(&self) -> bool {
        self.meta().map(|index| index.multi_entry).unwrap_or(false)
    }

    /// The store this index belongs to.
    pub fn object_store(&self) -> Result<ObjectStore> {
        let index = self.meta()?;
        let store = self.handle.with_meta(|meta| meta.require_store(&index.store).cloned())?;
        Ok(ObjectStore::new(self.handle.clone(), &store))
    }

    fn check_readable(&self, query: Query) -> Result<KeyRangeSpec> {
        self.meta()?;
        self.handle.check_active()?;
        query.encode()
    }

    /// Value of the record referenced by the first entry matching `query`.
    pub fn get(&self, query: impl Into<Query>) -> Request<Option<Value>> {
        let range = match self.check_readable(query.into()) {
            Ok(range) => range,
            Err(err) => return Request::ready(Err(err)),
        };
        let id = self.id;
        self.handle.request(move |tx| {
            let (store, index) = index_names(tx.meta(), id)?;
            tx.index_get(&store, &index, &range)?
                .map(|bytes| decode_value(&bytes))
                .transpose()
        })
    }

    /// Primary key of the first entry matching `query`.
    pub fn get_key(&self, query: impl Into<Query>) -> Request<Option<Key>> {
        let range = match self.check_readable(query.into()) {
            Ok(range) => range,
            Err(err) => return Request::ready(Err(err)),
        };
        let id = self.id;
        self.handle.request(move |tx| {
            let (store, index) = index_names(tx.meta(), id)?;
            tx.index_get_key(&store, &index, &range)?
                .map(|key| key.decode())
                .transpose()
        })
    }

    pub fn get_all(&self, query: impl Into<Query>, count: Option<u32>) -> Request<Vec<Value>> {
        let range = match self.check_readable(query.into()) {
            Ok(range) => range,
            Err(err) => return Request::ready(Err(err)),
        };
        let id = self.id;
        self.handle.request(move |tx| {
            let (store, index) = index_names(tx.meta(), id)?;
            decode_values(tx.index_get_all(&store, &index, &range, count)?)
        })
    }

    /// Primary keys of the matching entries, in index order.
    pub fn get_all_keys(&self, query: impl Into<Query>, count: Option<u32>) -> Request<Vec<Key>> {
        let range = match self.check_readable(query.into()) {
            Ok(range) => range,
            Err(err) => return Request::ready(Err(err)),
        };
        let id = self.id;
        self.handle.request(move |tx| {
            let (store, index) = index_names(tx.meta(), id)?;
            decode_keys(tx.index_get_all_keys(&store, &index, &range, count)?)
        })
    }

    pub fn count(&self, query: impl Into<Query>) -> Request<u64> {
        let range = match self.check_readable(query.into()) {
            Ok(range) => range,
            Err(err) => return Request::ready(Err(err)),
        };
        let id = self.id;
        self.handle.request(move |tx| {
            let (store, index) = index_names(tx.meta(), id)?;
            tx.index_count(&store, &index, &range)
        })
    }

    pub fn open_cursor(&self, query: impl Into<Query>, direction: Direction) -> Request<Option<Cursor>> {
        self.cursor(query.into(), direction, false)
    }

    pub fn open_key_cursor(
        &self,
        query: impl Into<Query>,
        direction: Direction,
    ) -> Request<Option<Cursor>> {
        self.cursor(query.into(), direction, true)
    }

    fn cursor(&self, query: Query, direction: Direction, key_only: bool) -> Request<Option<Cursor>> {
        let range = match self.check_readable(query) {
            Ok(range) => range,
            Err(err) => return Request::ready(Err(err)),
        };
        let id = self.id;
        let handle = self.handle.clone();
        self.handle.request(move |tx| {
            let (store, index) = index_names(tx.meta(), id)?;
            let inner = if key_only {
                tx.open_index_key_cursor(&store, &index, range, direction)?
            } else {
                tx.open_index_cursor(&store, &index, range, direction)?
            };
            Ok(Cursor::open(handle, inner))
        })
    }

    /// Rename within a versionchange transaction.
    pub fn rename(&self, new_name: &str) -> Result<()> {
        self.handle.check_upgrade()?;
        let index = self.meta()?;
        self.handle.check_active()?;
        if index.name == new_name {
            return Ok(());
        }
        self.handle
            .edit_meta(|meta| meta.rename_index(&index.store, &index.name, new_name))?;
        let to = new_name.to_string();
        self.handle
            .schema_op(move |tx| tx.rename_index(&index.store, &index.name, &to));
        Ok(())
    }
}
