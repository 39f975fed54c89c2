//! Cursor handles
//!
//! A [`Cursor`] wraps a [`BackendCursor`] shared with the operations it
//! queues. Steps run on the transaction's driver in call order; while a
//! step is queued the cursor refuses further steps and writes, the same
//! rule IndexedDB enforces with its "got value" flag.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{BackendCursor, BackendTransaction, CursorSource};
use crate::error::{Error, Result};
use crate::index::index_names;
use crate::key::{EncodedKey, Key};
use crate::meta::Direction;
use crate::range::KeyRangeSpec;
use crate::store::store_name;
use crate::transaction::{Request, TxHandle};
use crate::value::{decode_value, encode_value, Value};

struct CursorState {
    inner: BackendCursor,
    /// A step is queued and has not run yet.
    stepping: bool,
    key: Option<Key>,
    primary_key: Option<Key>,
    value: Option<Value>,
}

impl CursorState {
    fn forget(&mut self) {
        self.key = None;
        self.primary_key = None;
        self.value = None;
    }
}

/// Cursor over a store or an index.
#[derive(Clone)]
pub struct Cursor {
    handle: Arc<TxHandle>,
    state: Arc<Mutex<CursorState>>,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Cursor")
            .field("source", &state.inner.source())
            .field("direction", &state.inner.direction())
            .field("key", &state.inner.key())
            .field("primary_key", &state.inner.primary_key())
            .finish()
    }
}

impl Cursor {
    /// Wrap a freshly opened backend cursor; `None` if it found nothing.
    pub(crate) fn open(handle: Arc<TxHandle>, inner: BackendCursor) -> Option<Self> {
        if inner.is_exhausted() {
            return None;
        }
        Some(Self {
            handle,
            state: Arc::new(Mutex::new(CursorState {
                inner,
                stepping: false,
                key: None,
                primary_key: None,
                value: None,
            })),
        })
    }

    pub fn direction(&self) -> Direction {
        self.state.lock().inner.direction()
    }

    /// Key at the current position: the index key for index cursors.
    pub fn key(&self) -> Result<Option<Key>> {
        let mut state = self.state.lock();
        if state.key.is_none() {
            let decoded = state.inner.key().map(EncodedKey::decode).transpose()?;
            state.key = decoded;
        }
        Ok(state.key.clone())
    }

    pub fn primary_key(&self) -> Result<Option<Key>> {
        let mut state = self.state.lock();
        if state.primary_key.is_none() {
            let decoded = state
                .inner
                .primary_key()
                .map(EncodedKey::decode)
                .transpose()?;
            state.primary_key = decoded;
        }
        Ok(state.primary_key.clone())
    }

    /// Record value; always `None` for key cursors.
    pub fn value(&self) -> Result<Option<Value>> {
        let mut state = self.state.lock();
        if state.value.is_none() {
            let decoded = state.inner.value().map(decode_value).transpose()?;
            state.value = decoded;
        }
        Ok(state.value.clone())
    }

    fn source(&self) -> CursorSource {
        self.state.lock().inner.source()
    }

    fn store_id(&self) -> u64 {
        match self.source() {
            CursorSource::Store { store } | CursorSource::Index { store, .. } => store,
        }
    }

    fn check_source(&self) -> Result<()> {
        let source = self.source();
        self.handle.with_meta(|meta| match source {
            CursorSource::Store { store } => store_name(meta, store).map(|_| ()),
            CursorSource::Index { index, .. } => index_names(meta, index).map(|_| ()),
        })
    }

    /// Current `(key, primary key)`, failing unless the cursor sits on a
    /// record with no step pending.
    fn position(&self) -> Result<(EncodedKey, EncodedKey)> {
        let state = self.state.lock();
        if state.stepping {
            return Err(Error::InvalidState("cursor is already advancing".into()));
        }
        match (state.inner.key(), state.inner.primary_key()) {
            (Some(key), Some(primary)) => Ok((key.clone(), primary.clone())),
            _ => Err(Error::InvalidState(
                "cursor is past the end of its range".into(),
            )),
        }
    }

    fn check_step(&self) -> Result<(EncodedKey, EncodedKey)> {
        self.handle.check_active()?;
        self.check_source()?;
        self.position()
    }

    fn step<F>(&self, f: F) -> Request<bool>
    where
        F: FnOnce(&mut BackendCursor, &mut dyn BackendTransaction) -> Result<bool> + Send + 'static,
    {
        self.state.lock().stepping = true;
        let state = self.state.clone();
        self.handle.request(move |tx| {
            let mut state = state.lock();
            state.stepping = false;
            state.forget();
            f(&mut state.inner, tx)
        })
    }

    /// Move to the next record (IndexedDB `continue()`). Resolves to
    /// `false` once the range is exhausted.
    pub fn next(&self) -> Request<bool> {
        if let Err(err) = self.check_step() {
            return Request::ready(Err(err));
        }
        self.step(|cursor, tx| cursor.advance(tx))
    }

    /// Skip `count` records.
    pub fn advance(&self, count: u32) -> Request<bool> {
        if count == 0 {
            return Request::ready(Err(Error::InvalidAccess(
                "advance count must be positive".into(),
            )));
        }
        if let Err(err) = self.check_step() {
            return Request::ready(Err(err));
        }
        self.step(move |cursor, tx| {
            for _ in 0..count {
                if !cursor.advance(tx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        })
    }

    /// Move to the first record whose key is at or past `key`. The key must
    /// lie strictly past the current one in the cursor's direction.
    pub fn continue_to(&self, key: impl Into<Key>) -> Request<bool> {
        let key = key.into();
        let target = self.check_step().and_then(|(current, _)| {
            key.check()?;
            let target = key.encode();
            let forward = self.direction().is_forward();
            if (forward && target <= current) || (!forward && target >= current) {
                return Err(Error::Data(format!(
                    "key {:?} is not past the cursor position",
                    key
                )));
            }
            Ok(target)
        });
        match target {
            Ok(target) => self.step(move |cursor, tx| cursor.continue_to(tx, target)),
            Err(err) => Request::ready(Err(err)),
        }
    }

    /// Move to the first index entry at or past `(key, primary_key)`. Only
    /// for index cursors iterating `Next` or `Prev`.
    pub fn continue_primary_key(
        &self,
        key: impl Into<Key>,
        primary_key: impl Into<Key>,
    ) -> Request<bool> {
        match self.prepare_continue_primary_key(key.into(), primary_key.into()) {
            Ok((key, primary)) => {
                self.step(move |cursor, tx| cursor.continue_primary_key(tx, key, primary))
            }
            Err(err) => Request::ready(Err(err)),
        }
    }

    fn prepare_continue_primary_key(
        &self,
        key: Key,
        primary_key: Key,
    ) -> Result<(EncodedKey, EncodedKey)> {
        self.handle.check_active()?;
        self.check_source()?;
        if !matches!(self.source(), CursorSource::Index { .. }) {
            return Err(Error::InvalidAccess(
                "continue_primary_key requires an index cursor".into(),
            ));
        }
        let direction = self.direction();
        if direction.is_unique() {
            return Err(Error::InvalidAccess(
                "continue_primary_key is not allowed on unique cursors".into(),
            ));
        }
        let (current, current_primary) = self.position()?;
        key.check()?;
        primary_key.check()?;
        let target = key.encode();
        let target_primary = primary_key.encode();
        let behind = if direction.is_forward() {
            target < current || (target == current && target_primary <= current_primary)
        } else {
            target > current || (target == current && target_primary >= current_primary)
        };
        if behind {
            return Err(Error::Data(format!(
                "({:?}, {:?}) is not past the cursor position",
                key, primary_key
            )));
        }
        Ok((target, target_primary))
    }

    /// Replace the record under the cursor. Resolves to its primary key.
    pub fn update(&self, value: &Value) -> Request<Key> {
        let (primary, bytes) = match self.prepare_update(value) {
            Ok(prepared) => prepared,
            Err(err) => return Request::ready(Err(err)),
        };
        let store = self.store_id();
        let state = self.state.clone();
        self.handle.request(move |tx| {
            let name = store_name(tx.meta(), store)?;
            let key = primary.decode()?;
            tx.put(&name, &key, bytes.clone())?;
            let mut state = state.lock();
            state.inner.set_value(bytes);
            state.value = None;
            Ok(key)
        })
    }

    fn prepare_update(&self, value: &Value) -> Result<(EncodedKey, Vec<u8>)> {
        let primary = self.prepare_write()?;
        if self.state.lock().inner.is_key_only() {
            return Err(Error::InvalidState("key cursors cannot update".into()));
        }
        let store = self.store_id();
        let key_path = self.handle.with_meta(|meta| {
            meta.store_by_id(store)
                .and_then(|store| store.key_path.clone())
        });
        if let Some(path) = key_path {
            match path.extract_key(value)? {
                Some(key) if key.encode() == primary => {}
                _ => {
                    return Err(Error::Data(
                        "updated value must keep the record's in-line key".into(),
                    ))
                }
            }
        }
        Ok((primary, encode_value(value)?))
    }

    fn prepare_write(&self) -> Result<EncodedKey> {
        self.handle.check_active()?;
        self.handle.check_writable()?;
        self.check_source()?;
        let (_, primary) = self.position()?;
        Ok(primary)
    }

    /// Delete the record under the cursor. The cursor keeps its position.
    pub fn delete(&self) -> Request<()> {
        let primary = match self.prepare_write() {
            Ok(primary) => primary,
            Err(err) => return Request::ready(Err(err)),
        };
        if self.state.lock().inner.is_key_only() {
            return Request::ready(Err(Error::InvalidState(
                "key cursors cannot delete".into(),
            )));
        }
        let store = self.store_id();
        self.handle.request(move |tx| {
            let name = store_name(tx.meta(), store)?;
            tx.delete(&name, &KeyRangeSpec::only(primary))
        })
    }
}
