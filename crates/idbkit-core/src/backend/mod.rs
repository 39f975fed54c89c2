//! Storage backend abstraction
//!
//! This module defines the traits every storage engine implements.
//! Implementations exist for:
//!
//! - **Memory**: process-local `BTreeMap`s (`MemoryBackend`)
//! - **SQLite**: one database file per logical database (separate crate)
//!
//! Backends only provide ordered primitives over encoded keys and value
//! bytes. Everything IndexedDB-specific (index maintenance, constraint
//! checks, key generators, cursor stepping) lives in provided trait methods
//! and in [`BackendCursor`], so all backends behave identically.

mod cursor;
mod memory;
pub mod ordered;
mod traits;

pub use cursor::{BackendCursor, CursorSource};
pub use memory::MemoryBackend;
pub use traits::{
    count_index_entries, count_records, BackendDatabase, BackendTransaction, StorageBackend,
};

use crate::key::EncodedKey;

/// Physical scan order over encoded keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    Forward,
    Reverse,
}

/// Seek origin. Results lie strictly past it in the scan direction, or at
/// it when `inclusive` is set.
///
/// For index seeks, `primary: None` makes the position key-level: an
/// exclusive position skips every entry of `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub key: EncodedKey,
    pub primary: Option<EncodedKey>,
    pub inclusive: bool,
}

impl Position {
    pub fn after(key: EncodedKey) -> Self {
        Self {
            key,
            primary: None,
            inclusive: false,
        }
    }

    pub fn after_entry(key: EncodedKey, primary: EncodedKey) -> Self {
        Self {
            key,
            primary: Some(primary),
            inclusive: false,
        }
    }
}
