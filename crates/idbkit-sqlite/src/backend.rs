//! SQLite implementation of the storage backend traits

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use idbkit_core::backend::ordered::{seek_flat, seek_nested};
use idbkit_core::backend::{
    count_index_entries, count_records, BackendDatabase, BackendTransaction, Position,
    ScanDirection, StorageBackend,
};
use idbkit_core::{
    DatabaseInfo, DatabaseMeta, EncodedKey, Error, IndexMeta, KeyRangeSpec, ObjectStoreMeta,
    TransactionMode,
};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::SqliteError;
use crate::migrate::migrate;
use crate::overlay::{nearer, Overlay};
use crate::schema;
use crate::sql;

type Result<T> = idbkit_core::Result<T>;

/// Storage backend keeping each logical database in its own SQLite file.
///
/// Without a directory every database lives in an in-memory SQLite
/// connection that outlives its `Database` handles, like `MemoryBackend`.
pub struct SqliteBackend {
    dir: Option<PathBuf>,
    databases: Mutex<HashMap<String, Arc<SqliteState>>>,
}

impl SqliteBackend {
    /// Backend over in-memory SQLite connections (for testing)
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            databases: Mutex::new(HashMap::new()),
        }
    }

    /// Backend storing database files under `dir`, created if missing.
    pub fn open_dir(dir: impl AsRef<Path>) -> crate::error::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "opened SQLite backend");
        Ok(Self {
            dir: Some(dir),
            databases: Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding database files, `None` when in memory.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Path of the file backing `name`.
    pub fn database_path(&self, name: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(schema::file_name(name)))
    }

    fn connect(&self, name: &str) -> crate::error::Result<Connection> {
        let conn = match self.database_path(name) {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        migrate(&conn)?;
        Ok(conn)
    }
}

impl StorageBackend for SqliteBackend {
    fn open(&self, name: &str) -> Result<Arc<dyn BackendDatabase>> {
        let mut databases = self.databases.lock();
        let state = match databases.get(name) {
            Some(state) => state.clone(),
            None => {
                let conn = self.connect(name)?;
                let meta = schema::load_meta(&conn, name)?;
                debug!(database = %name, version = meta.version, "opened SQLite database");
                let state = Arc::new(SqliteState {
                    conn: Mutex::new(conn),
                    meta: Mutex::new(meta),
                });
                databases.insert(name.to_string(), state.clone());
                state
            }
        };
        Ok(Arc::new(SqliteDatabase { state }))
    }

    fn delete_database(&self, name: &str) -> Result<()> {
        let cached = self.databases.lock().remove(name).is_some();
        if let Some(path) = self.database_path(name) {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(database = %name, path = %path.display(), "deleted database file"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(SqliteError::from(err).into()),
            }
        } else if cached {
            debug!(database = %name, "deleted in-memory SQLite database");
        }
        Ok(())
    }

    fn databases(&self) -> Result<Vec<DatabaseInfo>> {
        let mut found: BTreeMap<String, u64> = BTreeMap::new();
        for state in self.databases.lock().values() {
            let info = state.meta.lock().info();
            found.insert(info.name, info.version);
        }

        if let Some(dir) = &self.dir {
            for entry in std::fs::read_dir(dir).map_err(SqliteError::from)? {
                let path = entry.map_err(SqliteError::from)?.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(schema::FILE_EXTENSION) {
                    continue;
                }
                match read_info(&path) {
                    Ok(Some(info)) => {
                        found.entry(info.name).or_insert(info.version);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "skipping unreadable database file");
                    }
                }
            }
        }

        Ok(found
            .into_iter()
            .filter(|(_, version)| *version > 0)
            .map(|(name, version)| DatabaseInfo { name, version })
            .collect())
    }
}

/// Name and version stored in a database file not currently open.
fn read_info(path: &Path) -> crate::error::Result<Option<DatabaseInfo>> {
    let conn = Connection::open(path)?;
    let exists = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name='__idbkit_meta'")?
        .exists([])?;
    if !exists {
        return Ok(None);
    }
    // The name passed here only matters for files without a schema row.
    let meta = schema::load_meta(&conn, "")?;
    Ok((!meta.name.is_empty()).then(|| meta.info()))
}

/// Connection and committed schema shared by every handle of a database.
struct SqliteState {
    conn: Mutex<Connection>,
    meta: Mutex<DatabaseMeta>,
}

/// One open logical database.
pub struct SqliteDatabase {
    state: Arc<SqliteState>,
}

impl BackendDatabase for SqliteDatabase {
    fn meta(&self) -> DatabaseMeta {
        self.state.meta.lock().clone()
    }

    fn begin_transaction(
        &self,
        _scope: &[String],
        mode: TransactionMode,
    ) -> Result<Box<dyn BackendTransaction>> {
        let meta = self.state.meta.lock().clone();
        let overlay = if mode == TransactionMode::VersionChange {
            self.state
                .conn
                .lock()
                .execute_batch("BEGIN IMMEDIATE")
                .map_err(SqliteError::from)?;
            None
        } else {
            Some(Overlay::default())
        };
        Ok(Box::new(SqliteTransaction {
            state: self.state.clone(),
            meta,
            mode,
            overlay,
        }))
    }
}

/// A running transaction.
///
/// Versionchange transactions write straight to the file inside an open
/// `BEGIN IMMEDIATE` so DDL rolls back with the data. Readonly and readwrite
/// transactions carry an overlay; readonly ones never write to it.
pub struct SqliteTransaction {
    state: Arc<SqliteState>,
    meta: DatabaseMeta,
    mode: TransactionMode,
    /// `None` while a versionchange SQL transaction is open.
    overlay: Option<Overlay>,
}

fn require_writable(mode: TransactionMode) -> Result<()> {
    if mode.is_writable() {
        Ok(())
    } else {
        Err(Error::ReadOnly("transaction is readonly".into()))
    }
}

impl SqliteTransaction {
    /// Id and table name of `store`.
    fn store_table(&self, store: &str) -> Result<(u64, String)> {
        let id = self.meta.require_store(store)?.id;
        Ok((id, schema::store_table(store)))
    }

    /// Id and table name of `index` on `store`.
    fn index_table(&self, store: &str, index: &str) -> Result<(u64, String)> {
        let id = self.meta.require_index(store, index)?.id;
        Ok((id, schema::index_table(store, index)))
    }

    /// Tables of every index on `store`.
    fn index_tables(&self, store: &str) -> Vec<(u64, String)> {
        self.meta
            .indexes(store)
            .iter()
            .map(|index| (index.id, schema::index_table(store, &index.name)))
            .collect()
    }

    fn schema_change(&self) -> Result<()> {
        if self.overlay.is_none() {
            Ok(())
        } else {
            Err(Error::InvalidState(
                "schema changes require a versionchange transaction".into(),
            ))
        }
    }

    /// Run `f` on the shared connection.
    fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> crate::error::Result<R>) -> Result<R> {
        let conn = self.state.conn.lock();
        Ok(f(&conn)?)
    }

    fn rollback(&mut self) -> Result<()> {
        if self.overlay.is_none() {
            self.overlay = Some(Overlay::default());
            self.with_conn(|conn| Ok(conn.execute_batch("ROLLBACK")?))?;
        }
        Ok(())
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if let Err(err) = self.rollback() {
            warn!(database = %self.meta.name, error = %err, "rollback of abandoned transaction failed");
        }
    }
}

impl BackendTransaction for SqliteTransaction {
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
        self.schema_change()?;
        let table = schema::store_table(&store.name);
        self.with_conn(|conn| schema::create_store_table(conn, &table))
    }

    fn store_delete(&mut self, name: &str) -> Result<()> {
        self.schema_change()?;
        let (id, table) = self.store_table(name)?;
        let indexes = self.index_tables(name);
        self.with_conn(|conn| {
            for (_, index) in &indexes {
                schema::drop_table(conn, index)?;
            }
            schema::drop_table(conn, &table)?;
            schema::delete_counter(conn, id)
        })
    }

    fn store_rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.schema_change()?;
        let (_, table) = self.store_table(from)?;
        let indexes: Vec<(String, String)> = self
            .meta
            .indexes(from)
            .iter()
            .map(|index| {
                (
                    schema::index_table(from, &index.name),
                    schema::index_table(to, &index.name),
                )
            })
            .collect();
        let renamed = schema::store_table(to);
        self.with_conn(|conn| {
            schema::rename_store_table(conn, &table, &renamed)?;
            for (old, new) in &indexes {
                schema::rename_index_table(conn, old, new)?;
            }
            Ok(())
        })
    }

    fn index_create(&mut self, index: &IndexMeta) -> Result<()> {
        self.schema_change()?;
        self.store_table(&index.store)?;
        let table = schema::index_table(&index.store, &index.name);
        self.with_conn(|conn| schema::create_index_table(conn, &table))
    }

    fn index_delete(&mut self, store: &str, name: &str) -> Result<()> {
        self.schema_change()?;
        let (_, table) = self.index_table(store, name)?;
        self.with_conn(|conn| schema::drop_table(conn, &table))
    }

    fn index_rename(&mut self, store: &str, from: &str, to: &str) -> Result<()> {
        self.schema_change()?;
        let (_, table) = self.index_table(store, from)?;
        let renamed = schema::index_table(store, to);
        self.with_conn(|conn| schema::rename_index_table(conn, &table, &renamed))
    }

    fn record_get(&mut self, store: &str, key: &EncodedKey) -> Result<Option<Vec<u8>>> {
        let (id, table) = self.store_table(store)?;
        if let Some(staged) = self.overlay.as_ref().and_then(|o| o.stores.get(&id)) {
            if let Some(entry) = staged.records.get(key) {
                return Ok(entry.clone());
            }
            if staged.cleared {
                return Ok(None);
            }
        }
        self.with_conn(|conn| sql::record_get(conn, &table, key))
    }

    fn record_put(&mut self, store: &str, key: EncodedKey, value: Vec<u8>) -> Result<()> {
        require_writable(self.mode)?;
        let (id, table) = self.store_table(store)?;
        match self.overlay.as_mut() {
            Some(overlay) => {
                overlay.store(id).records.insert(key, Some(value));
                Ok(())
            }
            None => self.with_conn(|conn| sql::record_put(conn, &table, &key, &value)),
        }
    }

    fn record_delete(&mut self, store: &str, key: &EncodedKey) -> Result<()> {
        require_writable(self.mode)?;
        let (id, table) = self.store_table(store)?;
        match self.overlay.as_mut() {
            Some(overlay) => {
                overlay.store(id).records.insert(key.clone(), None);
                Ok(())
            }
            None => self.with_conn(|conn| sql::record_delete(conn, &table, key)),
        }
    }

    fn record_clear(&mut self, store: &str) -> Result<()> {
        require_writable(self.mode)?;
        let (id, table) = self.store_table(store)?;
        let indexes = self.index_tables(store);
        match self.overlay.as_mut() {
            Some(overlay) => {
                let staged = overlay.store(id);
                staged.cleared = true;
                staged.records.clear();
                for (index, _) in indexes {
                    overlay.index(index).clear();
                }
                Ok(())
            }
            None => self.with_conn(|conn| {
                sql::truncate(conn, &table)?;
                for (_, index) in &indexes {
                    sql::truncate(conn, index)?;
                }
                Ok(())
            }),
        }
    }

    fn record_seek(
        &mut self,
        store: &str,
        range: &KeyRangeSpec,
        direction: ScanDirection,
        after: Option<&Position>,
    ) -> Result<Option<(EncodedKey, Vec<u8>)>> {
        let (id, table) = self.store_table(store)?;
        let staged = self.overlay.as_ref().and_then(|o| o.stores.get(&id));
        let buffered = staged
            .and_then(|s| seek_flat(&s.records, range, direction, after, Option::is_none))
            .and_then(|(key, value)| value.as_ref().map(|value| (key.clone(), value.clone())));
        if staged.is_some_and(|s| s.cleared) {
            return Ok(buffered);
        }

        // Committed rows the overlay rewrote or deleted are passed over.
        let conn = self.state.conn.lock();
        let mut from = after.map(|p| (p.key.clone(), p.inclusive));
        let committed = loop {
            let found = sql::record_seek(
                &conn,
                &table,
                range,
                direction,
                from.as_ref().map(|(key, inclusive)| (key, *inclusive)),
            )?;
            match found {
                Some((key, _)) if staged.is_some_and(|s| s.records.contains_key(&key)) => {
                    from = Some((key, false));
                }
                other => break other,
            }
        };
        Ok(nearer(buffered, committed, direction))
    }

    fn index_insert(
        &mut self,
        store: &str,
        index: &str,
        key: EncodedKey,
        primary: EncodedKey,
    ) -> Result<()> {
        require_writable(self.mode)?;
        let (id, table) = self.index_table(store, index)?;
        match self.overlay.as_mut() {
            Some(overlay) => {
                overlay.index(id).insert(key, primary);
                Ok(())
            }
            None => self.with_conn(|conn| sql::index_insert(conn, &table, &key, &primary)),
        }
    }

    fn index_delete_primary(
        &mut self,
        store: &str,
        index: &str,
        primary: &EncodedKey,
    ) -> Result<()> {
        require_writable(self.mode)?;
        let (id, table) = self.index_table(store, index)?;
        let Some(overlay) = self.overlay.as_ref() else {
            return self.with_conn(|conn| sql::index_remove_primary(conn, &table, primary));
        };
        let cleared = overlay.indexes.get(&id).is_some_and(|i| i.cleared);
        let committed = if cleared {
            Vec::new()
        } else {
            self.with_conn(|conn| sql::index_keys_of(conn, &table, primary))?
        };
        if let Some(overlay) = self.overlay.as_mut() {
            overlay.index(id).remove_primary(primary, committed);
        }
        Ok(())
    }

    fn index_seek(
        &mut self,
        store: &str,
        index: &str,
        range: &KeyRangeSpec,
        direction: ScanDirection,
        after: Option<&Position>,
    ) -> Result<Option<(EncodedKey, EncodedKey)>> {
        let (id, table) = self.index_table(store, index)?;
        let staged = self.overlay.as_ref().and_then(|o| o.indexes.get(&id));
        let buffered = staged.and_then(|i| seek_nested(&i.added, range, direction, after));
        if staged.is_some_and(|i| i.cleared) {
            return Ok(buffered);
        }

        let conn = self.state.conn.lock();
        let mut from = after.cloned();
        let committed = loop {
            let found = sql::index_seek(&conn, &table, range, direction, from.as_ref())?;
            match found {
                Some((key, primary))
                    if staged.is_some_and(|i| {
                        i.removed.contains(&(key.clone(), primary.clone()))
                    }) =>
                {
                    from = Some(Position::after_entry(key, primary));
                }
                other => break other,
            }
        };
        Ok(nearer(buffered, committed, direction))
    }

    fn count(&mut self, store: &str, range: &KeyRangeSpec) -> Result<u64> {
        let (id, table) = self.store_table(store)?;
        let staged = self.overlay.as_ref().and_then(|o| o.stores.get(&id));
        if staged.map_or(true, |s| s.is_passthrough()) {
            return self.with_conn(|conn| sql::count(conn, &table, range));
        }
        count_records(self, store, range)
    }

    fn index_count(&mut self, store: &str, index: &str, range: &KeyRangeSpec) -> Result<u64> {
        let (id, table) = self.index_table(store, index)?;
        let staged = self.overlay.as_ref().and_then(|o| o.indexes.get(&id));
        if staged.map_or(true, |i| i.is_passthrough()) {
            return self.with_conn(|conn| sql::count(conn, &table, range));
        }
        count_index_entries(self, store, index, range)
    }

    fn counter_get(&mut self, store: &str) -> Result<u64> {
        let (id, _) = self.store_table(store)?;
        let staged = self
            .overlay
            .as_ref()
            .and_then(|o| o.stores.get(&id))
            .and_then(|s| s.counter);
        match staged {
            Some(next) => Ok(next),
            None => self.with_conn(|conn| schema::load_counter(conn, id)),
        }
    }

    fn counter_set(&mut self, store: &str, next: u64) -> Result<()> {
        require_writable(self.mode)?;
        let (id, _) = self.store_table(store)?;
        match self.overlay.as_mut() {
            Some(overlay) => {
                overlay.store(id).counter = Some(next);
                Ok(())
            }
            None => self.with_conn(|conn| schema::save_counter(conn, id, next)),
        }
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        let Some(overlay) = self.overlay.as_ref() else {
            self.with_conn(|conn| {
                schema::save_meta(conn, &self.meta)?;
                Ok(conn.execute_batch("COMMIT")?)
            })?;
            // The SQL transaction is closed; nothing left for Drop to undo.
            self.overlay = Some(Overlay::default());
            *self.state.meta.lock() = self.meta.clone();
            debug!(database = %self.meta.name, version = self.meta.version, "committed versionchange");
            return Ok(());
        };
        if overlay.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            overlay.apply(&tx, &self.meta)?;
            Ok(tx.commit()?)
        })?;
        debug!(
            database = %self.meta.name,
            stores = overlay.stores.len(),
            indexes = overlay.indexes.len(),
            "committed transaction"
        );
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> Result<()> {
        self.rollback()?;
        debug!(database = %self.meta.name, mode = self.mode.as_str(), "aborted transaction");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idbkit_core::{encode_value, Key, KeyPath, Value};
    use pretty_assertions::assert_eq;

    fn setup(backend: &SqliteBackend) -> Arc<dyn BackendDatabase> {
        let db = backend.open("test").unwrap();
        let mut tx = db
            .begin_transaction(&[], TransactionMode::VersionChange)
            .unwrap();
        tx.set_version(1).unwrap();
        tx.create_object_store(ObjectStoreMeta {
            id: 1,
            name: "people".into(),
            key_path: Some(KeyPath::from("id")),
            auto_increment: false,
        })
        .unwrap();
        tx.create_index(IndexMeta {
            id: 2,
            name: "byName".into(),
            store: "people".into(),
            key_path: KeyPath::from("name"),
            unique: true,
            multi_entry: false,
        })
        .unwrap();
        tx.commit().unwrap();
        db
    }

    fn person(id: i32, name: &str) -> Vec<u8> {
        encode_value(&Value::object(vec![
            ("id", Value::from(id)),
            ("name", Value::from(name)),
        ]))
        .unwrap()
    }

    fn scope() -> Vec<String> {
        vec!["people".to_string()]
    }

    #[test]
    fn test_versionchange_commit_persists_schema() {
        let backend = SqliteBackend::in_memory();
        let db = setup(&backend);
        assert_eq!(db.meta().version, 1);
        assert_eq!(db.meta().store_names(), vec!["people".to_string()]);
        assert_eq!(
            backend.databases().unwrap(),
            vec![DatabaseInfo {
                name: "test".into(),
                version: 1
            }]
        );
    }

    #[test]
    fn test_reads_merge_overlay_with_committed_rows() {
        let backend = SqliteBackend::in_memory();
        let db = setup(&backend);

        let mut tx = db.begin_transaction(&scope(), TransactionMode::ReadWrite).unwrap();
        for (id, name) in [(1, "Ann"), (3, "Cid"), (5, "Eve")] {
            tx.put("people", &Key::from(id), person(id, name)).unwrap();
        }
        tx.commit().unwrap();

        let mut tx = db.begin_transaction(&scope(), TransactionMode::ReadWrite).unwrap();
        tx.put("people", &Key::from(2), person(2, "Bea")).unwrap();
        tx.put("people", &Key::from(3), person(3, "Abe")).unwrap();
        tx.delete("people", &KeyRangeSpec::only(Key::from(5).encode()))
            .unwrap();

        let all = KeyRangeSpec::all();
        let keys = tx.get_all_keys("people", &all, None).unwrap();
        assert_eq!(keys, vec![Key::from(1).encode(), Key::from(2).encode(), Key::from(3).encode()]);

        let names: Vec<EncodedKey> = ["Abe", "Ann", "Bea"]
            .into_iter()
            .map(|name| Key::from(name).encode())
            .collect();
        let mut seen = Vec::new();
        let mut after = None;
        while let Some((key, _)) = tx
            .index_seek("people", "byName", &all, ScanDirection::Forward, after.as_ref())
            .unwrap()
        {
            after = Some(Position::after(key.clone()));
            seen.push(key);
        }
        assert_eq!(seen, names);

        // A concurrent reader of committed state sees none of it.
        let mut reader = db.begin_transaction(&scope(), TransactionMode::ReadOnly).unwrap();
        assert_eq!(reader.count("people", &all).unwrap(), 3);
        drop(reader);

        tx.commit().unwrap();
        let mut reader = db.begin_transaction(&scope(), TransactionMode::ReadOnly).unwrap();
        assert_eq!(reader.count("people", &all).unwrap(), 3);
        let cid = KeyRangeSpec::only(Key::from("Cid").encode());
        assert_eq!(reader.index_count("people", "byName", &cid).unwrap(), 0);
        let abe = KeyRangeSpec::only(Key::from("Abe").encode());
        assert_eq!(
            reader.index_get_key("people", "byName", &abe).unwrap(),
            Some(Key::from(3).encode())
        );
    }

    #[test]
    fn test_abort_discards_overlay() {
        let backend = SqliteBackend::in_memory();
        let db = setup(&backend);
        let mut tx = db.begin_transaction(&scope(), TransactionMode::ReadWrite).unwrap();
        tx.put("people", &Key::from(1), person(1, "Ann")).unwrap();
        tx.counter_set("people", 9).unwrap();
        tx.abort().unwrap();

        let mut tx = db.begin_transaction(&scope(), TransactionMode::ReadOnly).unwrap();
        assert_eq!(tx.count("people", &KeyRangeSpec::all()).unwrap(), 0);
        assert_eq!(tx.counter_get("people").unwrap(), 1);
    }

    #[test]
    fn test_clear_hides_committed_rows_until_rewritten() {
        let backend = SqliteBackend::in_memory();
        let db = setup(&backend);
        let mut tx = db.begin_transaction(&scope(), TransactionMode::ReadWrite).unwrap();
        tx.put("people", &Key::from(1), person(1, "Ann")).unwrap();
        tx.put("people", &Key::from(2), person(2, "Bea")).unwrap();
        tx.commit().unwrap();

        let mut tx = db.begin_transaction(&scope(), TransactionMode::ReadWrite).unwrap();
        tx.clear("people").unwrap();
        // Unique check must not see the cleared committed entry.
        tx.put("people", &Key::from(3), person(3, "Ann")).unwrap();
        let all = KeyRangeSpec::all();
        assert_eq!(tx.get_all_keys("people", &all, None).unwrap(), vec![Key::from(3).encode()]);
        tx.commit().unwrap();

        let mut tx = db.begin_transaction(&scope(), TransactionMode::ReadOnly).unwrap();
        assert_eq!(tx.count("people", &all).unwrap(), 1);
        assert_eq!(tx.index_count("people", "byName", &all).unwrap(), 1);
    }

    #[test]
    fn test_counts_see_staged_writes() {
        let backend = SqliteBackend::in_memory();
        let db = setup(&backend);
        let mut tx = db.begin_transaction(&scope(), TransactionMode::ReadWrite).unwrap();
        for (id, name) in [(1, "Ann"), (2, "Bea"), (3, "Cid")] {
            tx.put("people", &Key::from(id), person(id, name)).unwrap();
        }
        tx.commit().unwrap();

        let all = KeyRangeSpec::all();
        let mut tx = db.begin_transaction(&scope(), TransactionMode::ReadWrite).unwrap();
        assert_eq!(tx.count("people", &all).unwrap(), 3);
        assert_eq!(tx.index_count("people", "byName", &all).unwrap(), 3);

        tx.put("people", &Key::from(4), person(4, "Dee")).unwrap();
        tx.delete("people", &KeyRangeSpec::only(Key::from(1).encode()))
            .unwrap();
        tx.delete("people", &KeyRangeSpec::only(Key::from(2).encode()))
            .unwrap();
        assert_eq!(tx.count("people", &all).unwrap(), 2);
        assert_eq!(tx.index_count("people", "byName", &all).unwrap(), 2);
        let ann = KeyRangeSpec::only(Key::from("Ann").encode());
        assert_eq!(tx.index_count("people", "byName", &ann).unwrap(), 0);

        tx.clear("people").unwrap();
        assert_eq!(tx.count("people", &all).unwrap(), 0);
        assert_eq!(tx.index_count("people", "byName", &all).unwrap(), 0);
    }

    #[test]
    fn test_versionchange_abort_rolls_back_tables() {
        let backend = SqliteBackend::in_memory();
        let db = setup(&backend);
        let mut tx = db
            .begin_transaction(&[], TransactionMode::VersionChange)
            .unwrap();
        tx.set_version(2).unwrap();
        tx.put("people", &Key::from(1), person(1, "Ann")).unwrap();
        tx.delete_object_store("people").unwrap();
        tx.abort().unwrap();

        assert_eq!(db.meta().version, 1);
        let mut tx = db.begin_transaction(&scope(), TransactionMode::ReadOnly).unwrap();
        assert_eq!(tx.count("people", &KeyRangeSpec::all()).unwrap(), 0);
    }

    #[test]
    fn test_renamed_tables_keep_their_rows() {
        let backend = SqliteBackend::in_memory();
        let db = setup(&backend);
        let mut tx = db.begin_transaction(&scope(), TransactionMode::ReadWrite).unwrap();
        tx.put("people", &Key::from(1), person(1, "Ann")).unwrap();
        tx.commit().unwrap();

        let mut tx = db
            .begin_transaction(&[], TransactionMode::VersionChange)
            .unwrap();
        tx.set_version(2).unwrap();
        tx.rename_index("people", "byName", "name").unwrap();
        tx.rename_object_store("people", "humans").unwrap();
        // The old name is free again.
        tx.create_object_store(ObjectStoreMeta {
            id: 3,
            name: "people".into(),
            key_path: None,
            auto_increment: true,
        })
        .unwrap();
        tx.commit().unwrap();

        let humans = vec!["humans".to_string()];
        let mut tx = db.begin_transaction(&humans, TransactionMode::ReadWrite).unwrap();
        tx.put("humans", &Key::from(2), person(2, "Bea")).unwrap();
        tx.commit().unwrap();

        let both = vec!["humans".to_string(), "people".to_string()];
        let mut tx = db.begin_transaction(&both, TransactionMode::ReadOnly).unwrap();
        let all = KeyRangeSpec::all();
        assert_eq!(tx.count("humans", &all).unwrap(), 2);
        let ann = KeyRangeSpec::only(Key::from("Ann").encode());
        assert_eq!(
            tx.index_get_key("humans", "name", &ann).unwrap(),
            Some(Key::from(1).encode())
        );
        assert_eq!(tx.count("people", &all).unwrap(), 0);
    }

    #[test]
    fn test_readonly_rejects_primitive_writes() {
        let backend = SqliteBackend::in_memory();
        let db = setup(&backend);
        let mut tx = db.begin_transaction(&scope(), TransactionMode::ReadOnly).unwrap();
        let err = tx
            .record_put("people", Key::from(1).encode(), person(1, "Ann"))
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnly(_)));
        assert!(matches!(
            tx.store_rename("people", "humans"),
            Err(Error::InvalidState(_))
        ));
    }
}
