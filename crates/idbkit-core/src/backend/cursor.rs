//! Backend-level cursor stepping

use crate::backend::{BackendTransaction, Position, ScanDirection};
use crate::error::{Error, Result};
use crate::key::EncodedKey;
use crate::meta::Direction;
use crate::range::KeyRangeSpec;

/// What a cursor iterates. Stores and indexes are referenced by id so a
/// rename in the same transaction does not strand the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorSource {
    Store { store: u64 },
    Index { store: u64, index: u64 },
}

/// Position and current record of a cursor. Stepping takes the transaction
/// explicitly, so the cursor itself holds no storage handle.
#[derive(Debug, Clone)]
pub struct BackendCursor {
    source: CursorSource,
    range: KeyRangeSpec,
    direction: Direction,
    key_only: bool,
    started: bool,
    key: Option<EncodedKey>,
    primary_key: Option<EncodedKey>,
    value: Option<Vec<u8>>,
}

impl BackendCursor {
    /// An unpositioned cursor; the first `advance` moves it to the first
    /// record.
    pub fn new(
        source: CursorSource,
        range: KeyRangeSpec,
        direction: Direction,
        key_only: bool,
    ) -> Self {
        Self {
            source,
            range,
            direction,
            key_only,
            started: false,
            key: None,
            primary_key: None,
            value: None,
        }
    }

    pub fn source(&self) -> CursorSource {
        self.source
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_key_only(&self) -> bool {
        self.key_only
    }

    /// Positioned past the last record.
    pub fn is_exhausted(&self) -> bool {
        self.started && self.key.is_none()
    }

    pub fn key(&self) -> Option<&EncodedKey> {
        self.key.as_ref()
    }

    pub fn primary_key(&self) -> Option<&EncodedKey> {
        self.primary_key.as_ref()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Replace the cached value after an update through the cursor.
    pub fn set_value(&mut self, value: Vec<u8>) {
        if !self.key_only && self.key.is_some() {
            self.value = Some(value);
        }
    }

    fn scan_direction(&self) -> ScanDirection {
        if self.direction.is_forward() {
            ScanDirection::Forward
        } else {
            ScanDirection::Reverse
        }
    }

    /// Step to the next record. Unique directions skip the remaining records
    /// of the current key, so the first record seen per key is kept.
    pub fn advance<T: BackendTransaction + ?Sized>(&mut self, tx: &mut T) -> Result<bool> {
        if !self.started {
            return self.seek(tx, None);
        }
        let Some(key) = self.key.clone() else {
            return Ok(false);
        };
        let position = match (self.source, &self.primary_key) {
            (CursorSource::Index { .. }, Some(primary)) if !self.direction.is_unique() => {
                Position::after_entry(key, primary.clone())
            }
            _ => Position::after(key),
        };
        self.seek(tx, Some(position))
    }

    /// Jump to the first record at or past `key` in the cursor's direction.
    pub fn continue_to<T: BackendTransaction + ?Sized>(
        &mut self,
        tx: &mut T,
        key: EncodedKey,
    ) -> Result<bool> {
        let position = Position {
            key,
            primary: None,
            inclusive: true,
        };
        self.seek(tx, Some(position))
    }

    /// Jump to the first index entry at or past `(key, primary)`.
    pub fn continue_primary_key<T: BackendTransaction + ?Sized>(
        &mut self,
        tx: &mut T,
        key: EncodedKey,
        primary: EncodedKey,
    ) -> Result<bool> {
        if !matches!(self.source, CursorSource::Index { .. }) {
            return Err(Error::InvalidAccess(
                "continue_primary_key requires an index cursor".into(),
            ));
        }
        let position = Position {
            key,
            primary: Some(primary),
            inclusive: true,
        };
        self.seek(tx, Some(position))
    }

    fn seek<T: BackendTransaction + ?Sized>(
        &mut self,
        tx: &mut T,
        position: Option<Position>,
    ) -> Result<bool> {
        self.started = true;
        let direction = self.scan_direction();
        let found = match self.source {
            CursorSource::Store { store } => {
                let name = store_name(tx, store)?;
                tx.record_seek(&name, &self.range, direction, position.as_ref())?
                    .map(|(key, value)| (key.clone(), key, Some(value)))
            }
            CursorSource::Index { store, index } => {
                let store_name = store_name(tx, store)?;
                let index_name = tx
                    .meta()
                    .index_by_id(index)
                    .map(|meta| meta.name.clone())
                    .ok_or_else(|| Error::InvalidState("index has been deleted".into()))?;
                match tx.index_seek(&store_name, &index_name, &self.range, direction, position.as_ref())? {
                    Some((key, primary)) => {
                        let value = if self.key_only {
                            None
                        } else {
                            tx.record_get(&store_name, &primary)?
                        };
                        Some((key, primary, value))
                    }
                    None => None,
                }
            }
        };

        match found {
            Some((key, primary, value)) => {
                self.key = Some(key);
                self.primary_key = Some(primary);
                self.value = if self.key_only { None } else { value };
                Ok(true)
            }
            None => {
                self.key = None;
                self.primary_key = None;
                self.value = None;
                Ok(false)
            }
        }
    }
}

fn store_name<T: BackendTransaction + ?Sized>(tx: &T, id: u64) -> Result<String> {
    tx.meta()
        .store_by_id(id)
        .map(|store| store.name.clone())
        .ok_or_else(|| Error::InvalidState("object store has been deleted".into()))
}
