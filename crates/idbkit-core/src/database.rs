//! Database connections

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::backend::BackendDatabase;
use crate::error::{Error, Result};
use crate::meta::{DatabaseMeta, TransactionMode};
use crate::scheduler::Scheduler;
use crate::transaction::{self, Transaction};

/// State shared by every connection to one database.
pub(crate) struct DatabaseInner {
    pub(crate) name: String,
    pub(crate) backend: Arc<dyn BackendDatabase>,
    meta: RwLock<DatabaseMeta>,
    pub(crate) scheduler: Mutex<Scheduler>,
    pub(crate) connections: AtomicUsize,
    pub(crate) upgrading: AtomicBool,
    pub(crate) deleted: AtomicBool,
}

impl DatabaseInner {
    pub(crate) fn new(name: &str, backend: Arc<dyn BackendDatabase>) -> Self {
        let meta = backend.meta();
        Self {
            name: name.to_string(),
            backend,
            meta: RwLock::new(meta),
            scheduler: Mutex::new(Scheduler::new()),
            connections: AtomicUsize::new(0),
            upgrading: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
        }
    }

    pub(crate) fn committed_meta(&self) -> DatabaseMeta {
        self.meta.read().clone()
    }

    pub(crate) fn version(&self) -> u64 {
        self.meta.read().version
    }

    /// Reload committed schema from the backend after a versionchange commit.
    pub(crate) fn publish_meta(&self) {
        let meta = self.backend.meta();
        debug!(database = %self.name, version = meta.version, "schema published");
        *self.meta.write() = meta;
    }

    pub(crate) fn begin(self: &Arc<Self>, scope: Vec<String>, mode: TransactionMode) -> Transaction {
        transaction::begin(self, scope, mode)
    }
}

struct Connection {
    inner: Arc<DatabaseInner>,
    closed: AtomicBool,
}

impl Connection {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.connections.fetch_sub(1, Ordering::SeqCst);
            debug!(database = %self.inner.name, "connection closed");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// A connection to an open database. Clones share the connection; it
/// closes when `close` is called or the last clone is dropped.
#[derive(Clone)]
pub struct Database {
    connection: Arc<Connection>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name())
            .field("version", &self.version())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Database {
    pub(crate) fn connect(inner: Arc<DatabaseInner>) -> Self {
        inner.connections.fetch_add(1, Ordering::SeqCst);
        Self {
            connection: Arc::new(Connection {
                inner,
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn inner(&self) -> &Arc<DatabaseInner> {
        &self.connection.inner
    }

    pub fn name(&self) -> &str {
        &self.inner().name
    }

    pub fn version(&self) -> u64 {
        self.inner().version()
    }

    /// Committed store names, sorted.
    pub fn object_store_names(&self) -> Vec<String> {
        self.inner().meta.read().store_names()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.closed.load(Ordering::SeqCst)
            || self.inner().deleted.load(Ordering::SeqCst)
    }

    /// Start a readonly or readwrite transaction over `scope`.
    ///
    /// The transaction is queued immediately; requests may be placed before
    /// the scheduler lets it start. Must be called inside a Tokio runtime.
    pub fn transaction(&self, scope: &[&str], mode: TransactionMode) -> Result<Transaction> {
        if self.is_closed() {
            return Err(Error::InvalidState("database connection is closed".into()));
        }
        if self.inner().upgrading.load(Ordering::SeqCst) {
            return Err(Error::InvalidState(
                "a versionchange transaction is running".into(),
            ));
        }
        if mode == TransactionMode::VersionChange {
            return Err(Error::InvalidAccess(
                "versionchange transactions are only created by open".into(),
            ));
        }
        if scope.is_empty() {
            return Err(Error::InvalidAccess("transaction scope is empty".into()));
        }
        let scope: BTreeSet<String> = scope.iter().map(|name| name.to_string()).collect();
        {
            let meta = self.inner().meta.read();
            for name in &scope {
                meta.require_store(name)?;
            }
        }
        Ok(self.inner().begin(scope.into_iter().collect(), mode))
    }

    /// Close the connection. Running transactions finish normally.
    pub fn close(&self) {
        self.connection.close();
    }
}
