//! Backend trait definitions

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{BackendCursor, CursorSource, Position, ScanDirection};
use crate::error::{Error, Result};
use crate::key::{EncodedKey, Key};
use crate::meta::{
    DatabaseInfo, DatabaseMeta, Direction, IndexMeta, ObjectStoreMeta, TransactionMode,
};
use crate::range::KeyRangeSpec;
use crate::value::{decode_value, Value};

/// Largest key a key generator hands out (2^53).
pub const MAX_GENERATED_KEY: u64 = 1 << 53;

/// A storage engine holding any number of named databases.
pub trait StorageBackend: Send + Sync {
    /// Open the named database, creating it at version 0 if it does not exist.
    fn open(&self, name: &str) -> Result<Arc<dyn BackendDatabase>>;

    /// Remove all storage of the named database. Missing databases are not
    /// an error.
    fn delete_database(&self, name: &str) -> Result<()>;

    /// Persisted databases with a version above 0.
    fn databases(&self) -> Result<Vec<DatabaseInfo>>;
}

/// One open logical database.
pub trait BackendDatabase: Send + Sync {
    /// Committed schema.
    fn meta(&self) -> DatabaseMeta;

    /// Begin a transaction. The caller guarantees, through the scheduler,
    /// that no conflicting transaction is running.
    fn begin_transaction(
        &self,
        scope: &[String],
        mode: TransactionMode,
    ) -> Result<Box<dyn BackendTransaction>>;

    /// Release resources held for this database.
    fn close(&self) {}
}

/// A running backend transaction.
///
/// Implementors provide ordered primitives over encoded keys; the provided
/// methods build every IndexedDB operation on top of them. Schema primitives
/// are called before the working metadata changes, so they can still look up
/// the old names.
pub trait BackendTransaction: Send {
    /// Working schema, including this transaction's uncommitted changes.
    fn meta(&self) -> &DatabaseMeta;

    fn meta_mut(&mut self) -> &mut DatabaseMeta;

    fn mode(&self) -> TransactionMode;

    // ── Schema primitives ───────────────────────────────────

    fn store_create(&mut self, store: &ObjectStoreMeta) -> Result<()>;

    /// Drop a store together with its indexes and key generator.
    fn store_delete(&mut self, name: &str) -> Result<()>;

    fn store_rename(&mut self, from: &str, to: &str) -> Result<()>;

    fn index_create(&mut self, index: &IndexMeta) -> Result<()>;

    fn index_delete(&mut self, store: &str, name: &str) -> Result<()>;

    fn index_rename(&mut self, store: &str, from: &str, to: &str) -> Result<()>;

    // ── Record primitives ───────────────────────────────────

    fn record_get(&mut self, store: &str, key: &EncodedKey) -> Result<Option<Vec<u8>>>;

    fn record_put(&mut self, store: &str, key: EncodedKey, value: Vec<u8>) -> Result<()>;

    fn record_delete(&mut self, store: &str, key: &EncodedKey) -> Result<()>;

    /// Remove every record of a store and every entry of its indexes.
    fn record_clear(&mut self, store: &str) -> Result<()>;

    /// First record in `range` in `direction`, past `after` when given.
    fn record_seek(
        &mut self,
        store: &str,
        range: &KeyRangeSpec,
        direction: ScanDirection,
        after: Option<&Position>,
    ) -> Result<Option<(EncodedKey, Vec<u8>)>>;

    // ── Index primitives ────────────────────────────────────

    fn index_insert(
        &mut self,
        store: &str,
        index: &str,
        key: EncodedKey,
        primary: EncodedKey,
    ) -> Result<()>;

    /// Remove every entry of `index` pointing at `primary`.
    fn index_delete_primary(&mut self, store: &str, index: &str, primary: &EncodedKey)
        -> Result<()>;

    /// First `(index key, primary key)` entry in `range`, ordered by index
    /// key then primary key, past `after` when given.
    fn index_seek(
        &mut self,
        store: &str,
        index: &str,
        range: &KeyRangeSpec,
        direction: ScanDirection,
        after: Option<&Position>,
    ) -> Result<Option<(EncodedKey, EncodedKey)>>;

    // ── Key generator primitives ────────────────────────────

    /// Next key the store's generator would hand out (starts at 1).
    fn counter_get(&mut self, store: &str) -> Result<u64>;

    fn counter_set(&mut self, store: &str, next: u64) -> Result<()>;

    // ── Lifecycle ───────────────────────────────────────────

    fn commit(self: Box<Self>) -> Result<()>;

    /// Roll back every schema and data change made through this handle.
    fn abort(self: Box<Self>) -> Result<()>;

    // ── Provided: schema ────────────────────────────────────

    fn set_version(&mut self, version: u64) -> Result<()> {
        require_version_change(self.mode())?;
        self.meta_mut().version = version;
        Ok(())
    }

    fn create_object_store(&mut self, store: ObjectStoreMeta) -> Result<()> {
        require_version_change(self.mode())?;
        let mut next = self.meta().clone();
        next.add_store(store.clone())?;
        next.next_object_id = next.next_object_id.max(store.id + 1);
        self.store_create(&store)?;
        *self.meta_mut() = next;
        debug!(store = %store.name, "created object store");
        Ok(())
    }

    fn delete_object_store(&mut self, name: &str) -> Result<()> {
        require_version_change(self.mode())?;
        let mut next = self.meta().clone();
        next.remove_store(name)?;
        self.store_delete(name)?;
        *self.meta_mut() = next;
        debug!(store = %name, "deleted object store");
        Ok(())
    }

    fn rename_object_store(&mut self, from: &str, to: &str) -> Result<()> {
        require_version_change(self.mode())?;
        if from == to {
            return self.meta().require_store(from).map(|_| ());
        }
        let mut next = self.meta().clone();
        next.rename_store(from, to)?;
        self.store_rename(from, to)?;
        *self.meta_mut() = next;
        Ok(())
    }

    /// Create an index and backfill it from the store's existing records.
    /// A unique violation during backfill is a `ConstraintError`.
    fn create_index(&mut self, index: IndexMeta) -> Result<()> {
        require_version_change(self.mode())?;
        let mut next = self.meta().clone();
        next.add_index(index.clone())?;
        next.next_object_id = next.next_object_id.max(index.id + 1);
        self.index_create(&index)?;
        *self.meta_mut() = next;

        let all = KeyRangeSpec::all();
        let mut after = None;
        let mut indexed = 0usize;
        while let Some((primary, bytes)) =
            self.record_seek(&index.store, &all, ScanDirection::Forward, after.as_ref())?
        {
            after = Some(Position::after(primary.clone()));
            let value = match decode_value(&bytes) {
                Ok(value) => value,
                Err(err) => {
                    warn!(store = %index.store, index = %index.name, error = %err, "skipping undecodable record during backfill");
                    continue;
                }
            };
            for key in index.key_path.index_keys(&value, index.multi_entry) {
                let encoded = key.encode();
                if index.unique {
                    let only = KeyRangeSpec::only(encoded.clone());
                    if let Some((_, other)) = self.index_seek(
                        &index.store,
                        &index.name,
                        &only,
                        ScanDirection::Forward,
                        None,
                    )? {
                        if other != primary {
                            return Err(unique_violation(&index, &key));
                        }
                    }
                }
                self.index_insert(&index.store, &index.name, encoded, primary.clone())?;
            }
            indexed += 1;
        }
        debug!(store = %index.store, index = %index.name, records = indexed, "created index");
        Ok(())
    }

    fn delete_index(&mut self, store: &str, name: &str) -> Result<()> {
        require_version_change(self.mode())?;
        let mut next = self.meta().clone();
        next.remove_index(store, name)?;
        self.index_delete(store, name)?;
        *self.meta_mut() = next;
        Ok(())
    }

    fn rename_index(&mut self, store: &str, from: &str, to: &str) -> Result<()> {
        require_version_change(self.mode())?;
        if from == to {
            return self.meta().require_index(store, from).map(|_| ());
        }
        let mut next = self.meta().clone();
        next.rename_index(store, from, to)?;
        self.index_rename(store, from, to)?;
        *self.meta_mut() = next;
        Ok(())
    }

    // ── Provided: store reads ───────────────────────────────

    /// Value of the first record in `range`.
    fn get(&mut self, store: &str, range: &KeyRangeSpec) -> Result<Option<Vec<u8>>> {
        Ok(self
            .record_seek(store, range, ScanDirection::Forward, None)?
            .map(|(_, value)| value))
    }

    /// Key of the first record in `range`.
    fn get_key(&mut self, store: &str, range: &KeyRangeSpec) -> Result<Option<EncodedKey>> {
        Ok(self
            .record_seek(store, range, ScanDirection::Forward, None)?
            .map(|(key, _)| key))
    }

    /// Values in key order; `count` of `None` or 0 means no limit.
    fn get_all(
        &mut self,
        store: &str,
        range: &KeyRangeSpec,
        count: Option<u32>,
    ) -> Result<Vec<Vec<u8>>> {
        Ok(scan_records(self, store, range, count)?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    fn get_all_keys(
        &mut self,
        store: &str,
        range: &KeyRangeSpec,
        count: Option<u32>,
    ) -> Result<Vec<EncodedKey>> {
        Ok(scan_records(self, store, range, count)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    /// Backends with a cheaper native count may override this.
    fn count(&mut self, store: &str, range: &KeyRangeSpec) -> Result<u64> {
        count_records(self, store, range)
    }

    // ── Provided: store writes ──────────────────────────────

    /// Insert or replace a record.
    fn put(&mut self, store: &str, key: &Key, value: Vec<u8>) -> Result<()> {
        write_record(self, store, key, value, true)
    }

    /// Insert a record; `ConstraintError` if the key exists.
    fn add(&mut self, store: &str, key: &Key, value: Vec<u8>) -> Result<()> {
        write_record(self, store, key, value, false)
    }

    /// Delete every record in `range` along with its index entries.
    fn delete(&mut self, store: &str, range: &KeyRangeSpec) -> Result<()> {
        require_writable(self.mode())?;
        let indexes = index_names(self.meta(), store);
        let mut after = None;
        while let Some((key, _)) =
            self.record_seek(store, range, ScanDirection::Forward, after.as_ref())?
        {
            for index in &indexes {
                self.index_delete_primary(store, index, &key)?;
            }
            self.record_delete(store, &key)?;
            after = Some(Position::after(key));
        }
        Ok(())
    }

    fn clear(&mut self, store: &str) -> Result<()> {
        require_writable(self.mode())?;
        self.record_clear(store)
    }

    // ── Provided: index reads ───────────────────────────────

    /// Value of the record referenced by the first index entry in `range`.
    fn index_get(
        &mut self,
        store: &str,
        index: &str,
        range: &KeyRangeSpec,
    ) -> Result<Option<Vec<u8>>> {
        match self.index_get_key(store, index, range)? {
            Some(primary) => self.record_get(store, &primary),
            None => Ok(None),
        }
    }

    /// Primary key of the first index entry in `range`.
    fn index_get_key(
        &mut self,
        store: &str,
        index: &str,
        range: &KeyRangeSpec,
    ) -> Result<Option<EncodedKey>> {
        Ok(self
            .index_seek(store, index, range, ScanDirection::Forward, None)?
            .map(|(_, primary)| primary))
    }

    fn index_get_all(
        &mut self,
        store: &str,
        index: &str,
        range: &KeyRangeSpec,
        count: Option<u32>,
    ) -> Result<Vec<Vec<u8>>> {
        let entries = scan_index(self, store, index, range, count)?;
        let mut values = Vec::with_capacity(entries.len());
        for (_, primary) in entries {
            if let Some(value) = self.record_get(store, &primary)? {
                values.push(value);
            }
        }
        Ok(values)
    }

    /// Primary keys of the index entries in `range`.
    fn index_get_all_keys(
        &mut self,
        store: &str,
        index: &str,
        range: &KeyRangeSpec,
        count: Option<u32>,
    ) -> Result<Vec<EncodedKey>> {
        Ok(scan_index(self, store, index, range, count)?
            .into_iter()
            .map(|(_, primary)| primary)
            .collect())
    }

    fn index_count(&mut self, store: &str, index: &str, range: &KeyRangeSpec) -> Result<u64> {
        count_index_entries(self, store, index, range)
    }

    // ── Provided: cursors ───────────────────────────────────

    fn open_cursor(
        &mut self,
        store: &str,
        range: KeyRangeSpec,
        direction: Direction,
    ) -> Result<BackendCursor> {
        let source = store_source(self.meta(), store)?;
        open(self, source, range, direction, false)
    }

    fn open_key_cursor(
        &mut self,
        store: &str,
        range: KeyRangeSpec,
        direction: Direction,
    ) -> Result<BackendCursor> {
        let source = store_source(self.meta(), store)?;
        open(self, source, range, direction, true)
    }

    fn open_index_cursor(
        &mut self,
        store: &str,
        index: &str,
        range: KeyRangeSpec,
        direction: Direction,
    ) -> Result<BackendCursor> {
        let source = index_source(self.meta(), store, index)?;
        open(self, source, range, direction, false)
    }

    fn open_index_key_cursor(
        &mut self,
        store: &str,
        index: &str,
        range: KeyRangeSpec,
        direction: Direction,
    ) -> Result<BackendCursor> {
        let source = index_source(self.meta(), store, index)?;
        open(self, source, range, direction, true)
    }

    // ── Provided: key generator ─────────────────────────────

    /// Take the next generated key. Fails with `ConstraintError` once the
    /// generator has passed 2^53.
    fn next_auto_increment_key(&mut self, store: &str) -> Result<Key> {
        let next = self.counter_get(store)?;
        if next > MAX_GENERATED_KEY {
            return Err(Error::Constraint(format!(
                "key generator of object store '{}' is exhausted",
                store
            )));
        }
        self.counter_set(store, next + 1)?;
        Ok(Key::Number(next as f64))
    }

    /// Advance the generator past an explicitly supplied numeric key.
    fn bump_auto_increment(&mut self, store: &str, key: &Key) -> Result<()> {
        let Key::Number(n) = key else {
            return Ok(());
        };
        let current = self.counter_get(store)?;
        if *n < current as f64 {
            return Ok(());
        }
        let next = if *n >= MAX_GENERATED_KEY as f64 {
            MAX_GENERATED_KEY + 1
        } else {
            n.floor() as u64 + 1
        };
        if next > current {
            self.counter_set(store, next)?;
        }
        Ok(())
    }
}

fn require_version_change(mode: TransactionMode) -> Result<()> {
    if mode == TransactionMode::VersionChange {
        Ok(())
    } else {
        Err(Error::InvalidState(
            "schema changes require a versionchange transaction".into(),
        ))
    }
}

fn require_writable(mode: TransactionMode) -> Result<()> {
    if mode.is_writable() {
        Ok(())
    } else {
        Err(Error::ReadOnly("transaction is readonly".into()))
    }
}

fn unique_violation(index: &IndexMeta, key: &Key) -> Error {
    Error::Constraint(format!(
        "unique index '{}' already contains key {:?}",
        index.name, key
    ))
}

fn index_names(meta: &DatabaseMeta, store: &str) -> Vec<String> {
    meta.indexes(store).iter().map(|index| index.name.clone()).collect()
}

fn limit(count: Option<u32>) -> Option<usize> {
    count.filter(|n| *n > 0).map(|n| n as usize)
}

fn scan_records<T: BackendTransaction + ?Sized>(
    tx: &mut T,
    store: &str,
    range: &KeyRangeSpec,
    count: Option<u32>,
) -> Result<Vec<(EncodedKey, Vec<u8>)>> {
    let limit = limit(count);
    let mut out = Vec::new();
    let mut after = None;
    while limit.map_or(true, |max| out.len() < max) {
        let Some((key, value)) = tx.record_seek(store, range, ScanDirection::Forward, after.as_ref())?
        else {
            break;
        };
        after = Some(Position::after(key.clone()));
        out.push((key, value));
    }
    Ok(out)
}

/// Number of records in `range`, counted one seek at a time.
pub fn count_records<T: BackendTransaction + ?Sized>(
    tx: &mut T,
    store: &str,
    range: &KeyRangeSpec,
) -> Result<u64> {
    let mut total = 0;
    let mut after = None;
    while let Some((key, _)) =
        tx.record_seek(store, range, ScanDirection::Forward, after.as_ref())?
    {
        total += 1;
        after = Some(Position::after(key));
    }
    Ok(total)
}

/// Number of index entries in `range`, counted one seek at a time.
pub fn count_index_entries<T: BackendTransaction + ?Sized>(
    tx: &mut T,
    store: &str,
    index: &str,
    range: &KeyRangeSpec,
) -> Result<u64> {
    let mut total = 0;
    let mut after = None;
    while let Some((key, primary)) =
        tx.index_seek(store, index, range, ScanDirection::Forward, after.as_ref())?
    {
        total += 1;
        after = Some(Position::after_entry(key, primary));
    }
    Ok(total)
}

fn scan_index<T: BackendTransaction + ?Sized>(
    tx: &mut T,
    store: &str,
    index: &str,
    range: &KeyRangeSpec,
    count: Option<u32>,
) -> Result<Vec<(EncodedKey, EncodedKey)>> {
    let limit = limit(count);
    let mut out = Vec::new();
    let mut after = None;
    while limit.map_or(true, |max| out.len() < max) {
        let Some((key, primary)) =
            tx.index_seek(store, index, range, ScanDirection::Forward, after.as_ref())?
        else {
            break;
        };
        after = Some(Position::after_entry(key.clone(), primary.clone()));
        out.push((key, primary));
    }
    Ok(out)
}

/// Index maintenance for one write: stale rows for the primary key go
/// first, then unique constraints are checked, then the record and its new
/// rows are written. A value that fails to decode is stored but not indexed.
fn write_record<T: BackendTransaction + ?Sized>(
    tx: &mut T,
    store: &str,
    key: &Key,
    value: Vec<u8>,
    overwrite: bool,
) -> Result<()> {
    require_writable(tx.mode())?;
    tx.meta().require_store(store)?;
    let primary = key.encode();
    if !overwrite && tx.record_get(store, &primary)?.is_some() {
        return Err(Error::Constraint(format!(
            "key {:?} already exists in object store '{}'",
            key, store
        )));
    }

    let indexes: Vec<IndexMeta> = tx.meta().indexes(store).to_vec();
    let decoded: Option<Value> = if indexes.is_empty() {
        None
    } else {
        match decode_value(&value) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!(store = %store, error = %err, "record value not indexable");
                None
            }
        }
    };

    for index in &indexes {
        tx.index_delete_primary(store, &index.name, &primary)?;
    }

    let mut rows = Vec::new();
    for index in &indexes {
        let Some(decoded) = &decoded else { break };
        for index_key in index.key_path.index_keys(decoded, index.multi_entry) {
            let encoded = index_key.encode();
            if index.unique {
                let only = KeyRangeSpec::only(encoded.clone());
                if tx
                    .index_seek(store, &index.name, &only, ScanDirection::Forward, None)?
                    .is_some()
                {
                    return Err(unique_violation(index, &index_key));
                }
            }
            rows.push((index.name.as_str(), encoded));
        }
    }

    tx.record_put(store, primary.clone(), value)?;
    for (index, encoded) in rows {
        tx.index_insert(store, index, encoded, primary.clone())?;
    }
    Ok(())
}

fn store_source(meta: &DatabaseMeta, store: &str) -> Result<CursorSource> {
    Ok(CursorSource::Store {
        store: meta.require_store(store)?.id,
    })
}

fn index_source(meta: &DatabaseMeta, store: &str, index: &str) -> Result<CursorSource> {
    Ok(CursorSource::Index {
        store: meta.require_store(store)?.id,
        index: meta.require_index(store, index)?.id,
    })
}

fn open<T: BackendTransaction + ?Sized>(
    tx: &mut T,
    source: CursorSource,
    range: KeyRangeSpec,
    direction: Direction,
    key_only: bool,
) -> Result<BackendCursor> {
    let mut cursor = BackendCursor::new(source, range, direction, key_only);
    cursor.advance(tx)?;
    Ok(cursor)
}
