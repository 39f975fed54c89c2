//! Durable SQLite storage backend for idbkit
//!
//! This crate provides a persistent implementation of the idbkit-core
//! backend traits, so databases survive process restarts.
//!
//! # Features
//!
//! - One SQLite file per logical database, named from a hash of its name
//! - One table per object store and per index, keyed by encoded keys
//! - Readwrite transactions buffer writes and commit them atomically
//! - Versionchange transactions run inside a single SQLite transaction, so
//!   a failed upgrade rolls back schema and data alike
//! - Supports in-memory databases for testing
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use idbkit_core::{Error, Factory, ObjectStoreParameters, TransactionMode, Value};
//! use idbkit_sqlite::SqliteBackend;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = SqliteBackend::open_dir("/tmp/idbkit")?;
//! let factory = Factory::new(Arc::new(backend));
//!
//! let db = factory
//!     .open("notes", 1, |change| async move {
//!         change
//!             .transaction
//!             .create_object_store("notes", ObjectStoreParameters::default().auto_increment())?;
//!         Ok::<_, Error>(())
//!     })
//!     .await?;
//!
//! let tx = db.transaction(&["notes"], TransactionMode::ReadWrite)?;
//! tx.object_store("notes")?.add(&Value::from("hello")).await?;
//! tx.done().await?;
//! # Ok(())
//! # }
//! ```

mod backend;
pub mod error;
pub mod migrate;
mod overlay;
pub mod schema;
mod sql;

// Re-export main types
pub use backend::{SqliteBackend, SqliteDatabase, SqliteTransaction};
pub use error::{Result, SqliteError};
