//! Write-set of a readwrite transaction
//!
//! Readwrite transactions never touch the database file until commit. Their
//! writes collect here, keyed by store and index id, and reads merge the
//! overlay with committed rows. Commit applies everything inside one SQLite
//! transaction, abort simply drops the overlay.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use idbkit_core::backend::ScanDirection;
use idbkit_core::{DatabaseMeta, EncodedKey};
use rusqlite::Connection;

use crate::error::{Result, SqliteError};
use crate::schema::{index_table, save_counter, store_table};
use crate::sql;

#[derive(Debug, Default)]
pub struct StoreOverlay {
    /// Committed records are hidden.
    pub cleared: bool,
    /// `None` marks a deleted record.
    pub records: BTreeMap<EncodedKey, Option<Vec<u8>>>,
    pub counter: Option<u64>,
}

#[derive(Debug, Default)]
pub struct IndexOverlay {
    /// Committed entries are hidden.
    pub cleared: bool,
    pub added: BTreeMap<EncodedKey, BTreeSet<EncodedKey>>,
    /// Committed `(key, primary key)` entries to remove.
    pub removed: BTreeSet<(EncodedKey, EncodedKey)>,
}

impl StoreOverlay {
    /// Committed records show through unchanged.
    pub fn is_passthrough(&self) -> bool {
        !self.cleared && self.records.is_empty()
    }
}

impl IndexOverlay {
    /// Committed entries show through unchanged.
    pub fn is_passthrough(&self) -> bool {
        !self.cleared && self.added.is_empty() && self.removed.is_empty()
    }

    pub fn insert(&mut self, key: EncodedKey, primary: EncodedKey) {
        self.removed.remove(&(key.clone(), primary.clone()));
        self.added.entry(key).or_default().insert(primary);
    }

    /// Drop staged entries for `primary` and hide the committed ones.
    pub fn remove_primary(&mut self, primary: &EncodedKey, committed: Vec<EncodedKey>) {
        self.added.retain(|_, primaries| {
            primaries.remove(primary);
            !primaries.is_empty()
        });
        for key in committed {
            self.removed.insert((key, primary.clone()));
        }
    }

    pub fn clear(&mut self) {
        self.cleared = true;
        self.added.clear();
        self.removed.clear();
    }
}

#[derive(Debug, Default)]
pub struct Overlay {
    pub stores: HashMap<u64, StoreOverlay>,
    pub indexes: HashMap<u64, IndexOverlay>,
}

impl Overlay {
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty() && self.indexes.is_empty()
    }

    pub fn store(&mut self, id: u64) -> &mut StoreOverlay {
        self.stores.entry(id).or_default()
    }

    pub fn index(&mut self, id: u64) -> &mut IndexOverlay {
        self.indexes.entry(id).or_default()
    }

    /// Write the overlay into `conn`, resolving table names through `meta`.
    /// The caller wraps this in a transaction.
    pub fn apply(&self, conn: &Connection, meta: &DatabaseMeta) -> Result<()> {
        for (id, store) in &self.stores {
            let name = &meta
                .store_by_id(*id)
                .ok_or_else(|| SqliteError::Schema(format!("no object store with id {}", id)))?
                .name;
            let table = store_table(name);
            if store.cleared {
                sql::truncate(conn, &table)?;
            }
            for (key, value) in &store.records {
                match value {
                    Some(value) => sql::record_put(conn, &table, key, value)?,
                    None => sql::record_delete(conn, &table, key)?,
                }
            }
            if let Some(next) = store.counter {
                save_counter(conn, *id, next)?;
            }
        }
        for (id, index) in &self.indexes {
            let meta = meta
                .index_by_id(*id)
                .ok_or_else(|| SqliteError::Schema(format!("no index with id {}", id)))?;
            let table = index_table(&meta.store, &meta.name);
            if index.cleared {
                sql::truncate(conn, &table)?;
            }
            for (key, primary) in &index.removed {
                sql::index_remove(conn, &table, key, primary)?;
            }
            for (key, primaries) in &index.added {
                for primary in primaries {
                    sql::index_insert(conn, &table, key, primary)?;
                }
            }
        }
        Ok(())
    }
}

/// Whichever candidate comes first in `direction`.
pub fn nearer<T: Ord>(a: Option<T>, b: Option<T>, direction: ScanDirection) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(match direction {
            ScanDirection::Forward => a.min(b),
            ScanDirection::Reverse => a.max(b),
        }),
        (a, b) => a.or(b),
    }
}
