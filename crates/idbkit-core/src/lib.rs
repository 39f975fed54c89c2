//! idbkit Core Engine
//!
//! An IndexedDB-compatible object database: key-ordered object stores with
//! secondary indexes, scoped transactions and cursors, over a pluggable
//! storage backend.
//!
//! This crate holds everything backend-independent plus an in-memory
//! backend. The durable SQLite backend lives in `idbkit-sqlite`.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use idbkit_core::{Factory, MemoryBackend, ObjectStoreParameters, TransactionMode, Value};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> idbkit_core::Result<()> {
//! let factory = Factory::new(Arc::new(MemoryBackend::new()));
//! let db = factory
//!     .open("shop", 1, |change| async move {
//!         let customers = change
//!             .transaction
//!             .create_object_store("customers", ObjectStoreParameters::key_path("id"))?;
//!         customers.create_index("byName", "name", Default::default())?;
//!         Ok::<_, idbkit_core::Error>(())
//!     })
//!     .await?;
//!
//! let tx = db.transaction(&["customers"], TransactionMode::ReadWrite)?;
//! let customers = tx.object_store("customers")?;
//! let alice = Value::from(serde_json::json!({ "id": 1, "name": "Alice" }));
//! customers.put(&alice).await?;
//! drop(customers);
//! tx.done().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
mod cursor;
mod database;
pub mod error;
mod factory;
mod index;
pub mod key;
pub mod keypath;
pub mod meta;
pub mod range;
pub mod scheduler;
mod store;
mod transaction;
pub mod value;

// Re-export main types at crate root
pub use backend::{
    BackendCursor, BackendDatabase, BackendTransaction, CursorSource, MemoryBackend,
    ScanDirection, StorageBackend,
};
pub use cursor::Cursor;
pub use database::Database;
pub use error::{Error, Result};
pub use factory::{Factory, VersionChange};
pub use index::Index;
pub use key::{compare_keys, decode_key, encode_key, validate_key, EncodedKey, Key};
pub use keypath::KeyPath;
pub use meta::{
    DatabaseInfo, DatabaseMeta, Direction, IndexMeta, IndexParameters, ObjectStoreMeta,
    ObjectStoreParameters, TransactionMode,
};
pub use range::{KeyRange, KeyRangeSpec, Query};
pub use store::ObjectStore;
pub use transaction::{Request, Transaction, TransactionState};
pub use value::{decode_value, encode_value, Binary, BinaryKind, Compound, ObjectRef, Value};
