//! Database factory: opening, upgrading and deleting databases

use std::cmp::Ordering as KeyOrdering;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::StorageBackend;
use crate::database::{Database, DatabaseInner};
use crate::error::{Error, Result};
use crate::key::Key;
use crate::meta::{DatabaseInfo, TransactionMode};
use crate::transaction::Transaction;

/// Handed to the upgrade callback of [`Factory::open`].
#[derive(Debug, Clone)]
pub struct VersionChange {
    pub database: Database,
    /// The versionchange transaction; the only place schema can change.
    pub transaction: Transaction,
    /// 0 when the database is new.
    pub old_version: u64,
    pub new_version: u64,
}

/// A connection opened mid-upgrade would see the schema change under it.
fn refuse_while_upgrading(inner: &DatabaseInner, name: &str) -> Result<()> {
    if inner.upgrading.load(Ordering::SeqCst) {
        return Err(Error::Version(format!("'{}' is being upgraded", name)));
    }
    Ok(())
}

/// Entry point to the engine. Clones share the backend and open databases.
#[derive(Clone)]
pub struct Factory {
    backend: Arc<dyn StorageBackend>,
    databases: Arc<Mutex<HashMap<String, Arc<DatabaseInner>>>>,
}

impl std::fmt::Debug for Factory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory")
            .field("open", &self.databases.lock().len())
            .finish()
    }
}

impl Factory {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            databases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Shared per-name state, opening backend storage on first use.
    fn database(&self, name: &str) -> Result<Arc<DatabaseInner>> {
        let mut databases = self.databases.lock();
        if let Some(inner) = databases.get(name) {
            if !inner.deleted.load(Ordering::SeqCst) {
                return Ok(inner.clone());
            }
        }
        let backend = self.backend.open(name)?;
        let inner = Arc::new(DatabaseInner::new(name, backend));
        databases.insert(name.to_string(), inner.clone());
        Ok(inner)
    }

    /// Open `name` at `version`, running `upgrade` inside a versionchange
    /// transaction when the stored version is lower.
    ///
    /// The upgrade's transaction commits once the callback returns `Ok`;
    /// an `Err` aborts it and is returned from `open`.
    pub async fn open<F, Fut>(&self, name: &str, version: u64, upgrade: F) -> Result<Database>
    where
        F: FnOnce(VersionChange) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if version == 0 {
            return Err(Error::InvalidAccess("version must be at least 1".into()));
        }
        let inner = self.database(name)?;
        let current = inner.version();
        if version < current {
            return Err(Error::Version(format!(
                "requested version {} is lower than the stored version {}",
                version, current
            )));
        }
        if version == current {
            refuse_while_upgrading(&inner, name)?;
            debug!(database = %name, version, "opened database");
            return Ok(Database::connect(inner));
        }
        if inner.connections.load(Ordering::SeqCst) > 0 {
            return Err(Error::Version(format!(
                "cannot upgrade '{}' to version {} while other connections are open",
                name, version
            )));
        }
        if inner
            .upgrading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Version(format!(
                "'{}' is already being upgraded",
                name
            )));
        }

        debug!(database = %name, from = current, to = version, "upgrading database");
        let database = Database::connect(inner.clone());
        let transaction = inner.begin(Vec::new(), TransactionMode::VersionChange);
        transaction.set_version(version);

        let result = upgrade(VersionChange {
            database: database.clone(),
            transaction: transaction.clone(),
            old_version: current,
            new_version: version,
        })
        .await;
        // Either call fails harmlessly when the transaction already ended.
        let _ = match &result {
            Ok(()) => transaction.commit(),
            Err(_) => transaction.abort(),
        };
        let outcome = transaction.done().await;
        inner.upgrading.store(false, Ordering::SeqCst);

        match result.and(outcome) {
            Ok(()) => {
                debug!(database = %name, version, "upgrade committed");
                Ok(database)
            }
            Err(err) => {
                warn!(database = %name, error = %err, "upgrade failed");
                database.close();
                Err(err)
            }
        }
    }

    /// Open at the stored version; a new database is created at version 1
    /// with no stores.
    pub async fn open_latest(&self, name: &str) -> Result<Database> {
        let inner = self.database(name)?;
        match inner.version() {
            0 => self.open(name, 1, |_| async { Ok::<(), Error>(()) }).await,
            version => {
                refuse_while_upgrading(&inner, name)?;
                debug!(database = %name, version, "opened database");
                Ok(Database::connect(inner))
            }
        }
    }

    /// Close every connection to `name` and remove its storage.
    pub fn delete_database(&self, name: &str) -> Result<()> {
        if let Some(inner) = self.databases.lock().remove(name) {
            inner.deleted.store(true, Ordering::SeqCst);
            inner.backend.close();
        }
        self.backend.delete_database(name)?;
        debug!(database = %name, "deleted database");
        Ok(())
    }

    /// Persisted databases, excluding ones never upgraded past version 0.
    pub fn databases(&self) -> Result<Vec<DatabaseInfo>> {
        self.backend.databases()
    }

    /// Compare two keys in IndexedDB order.
    pub fn cmp(&self, a: &Key, b: &Key) -> Result<KeyOrdering> {
        a.check()?;
        b.check()?;
        Ok(a.cmp(b))
    }
}
