//! # idbkit
//!
//! An IndexedDB-compatible storage engine: object stores, indexes, key
//! ranges, cursors and scheduled transactions over a pluggable backend.
//!
//! This crate ties the engine together:
//! - **config**: explicit backend selection, loadable from JSON
//! - **tracing**: logging setup with idbkit segment prefixes
//! - re-exports of the engine API from `idbkit-core` and the SQLite backend
//!
//! ## Usage
//!
//! ```rust,no_run
//! use idbkit::{open_factory, Config, ObjectStoreParameters, TransactionMode, Value};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::sqlite("./data");
//! idbkit::tracing::init_with_filter(&config.log_filter);
//! let factory = open_factory(&config)?;
//!
//! let db = factory
//!     .open("todo", 1, |change| async move {
//!         change
//!             .transaction
//!             .create_object_store("items", ObjectStoreParameters::key_path("id"))?;
//!         Ok::<_, idbkit::CoreError>(())
//!     })
//!     .await?;
//! let tx = db.transaction(&["items"], TransactionMode::ReadWrite)?;
//! tx.object_store("items")?
//!     .put(&Value::from(serde_json::json!({ "id": 1, "text": "write docs" })))
//!     .await?;
//! tx.done().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ::tracing::{debug, info};

pub mod config;
pub mod error;
pub mod tracing;

pub use config::{BackendConfig, Config};
pub use error::{Error, Result};

pub use idbkit_core::{
    Cursor, Database, DatabaseInfo, Direction, Factory, Index, IndexParameters, Key, KeyPath,
    KeyRange, MemoryBackend, ObjectStore, ObjectStoreParameters, Query, Request, StorageBackend,
    Transaction, TransactionMode, TransactionState, Value, VersionChange,
};
/// Engine error as surfaced by requests and transactions.
pub use idbkit_core::Error as CoreError;
pub use idbkit_sqlite::SqliteBackend;

/// Storage backend selected by `config`.
pub fn open_backend(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let backend: Arc<dyn StorageBackend> = match &config.backend {
        BackendConfig::Memory => Arc::new(MemoryBackend::new()),
        BackendConfig::Sqlite { path } => Arc::new(SqliteBackend::open_dir(path)?),
    };
    debug!("{} {} backend ready", crate::tracing::prefix::DB, config.backend.kind());
    Ok(backend)
}

/// Construct a [`Factory`] over the backend selected by `config`.
pub fn open_factory(config: &Config) -> Result<Factory> {
    let backend = open_backend(config)?;
    match &config.backend {
        BackendConfig::Memory => info!("{} idbkit factory ready (memory)", crate::tracing::prefix::OPEN),
        BackendConfig::Sqlite { path } => info!(
            "{} idbkit factory ready (sqlite at {})",
            crate::tracing::prefix::OPEN,
            path.display()
        ),
    }
    Ok(Factory::new(backend))
}
