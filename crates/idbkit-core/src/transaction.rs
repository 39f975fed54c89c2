//! Transactions, requests and the per-transaction driver task
//!
//! Every transaction owns a driver task spawned when it is created. Handles
//! (`Transaction`, `ObjectStore`, `Index`, `Cursor`) validate calls
//! synchronously and push operations onto the driver's channel; the driver
//! waits for the scheduler to start the transaction, then runs operations
//! one at a time in call order against the backend transaction.
//!
//! A readonly or readwrite transaction commits when an explicit commit
//! arrives, when the channel closes because every handle able to issue
//! requests is gone, or when it goes idle: its queue is empty, every result
//! it delivered has been taken by the caller, and after one more turn of the
//! runtime nothing new was queued. A versionchange transaction stays open
//! until its upgrade callback returns.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, trace, warn};

use crate::backend::BackendTransaction;
use crate::database::DatabaseInner;
use crate::error::{Error, Result};
use crate::meta::{DatabaseMeta, ObjectStoreMeta, ObjectStoreParameters, TransactionMode};
use crate::scheduler::EntryId;
use crate::store::ObjectStore;

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Waiting for the scheduler. Requests may already be placed.
    Pending,
    Active,
    Committing,
    Aborting,
    Finished,
}

// ============================================================================
// Requests
// ============================================================================

/// Results delivered to requests and not yet taken by their callers.
#[derive(Default)]
struct Deliveries {
    outstanding: AtomicUsize,
    taken: Notify,
}

impl Deliveries {
    fn issue(self: &Arc<Self>) -> Delivery {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Delivery(self.clone())
    }

    /// Wait until every delivered result has been taken or dropped.
    async fn all_taken(&self) {
        loop {
            let taken = self.taken.notified();
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            taken.await;
        }
    }
}

/// Travels with a delivered result; dropping it marks the result taken.
pub(crate) struct Delivery(Arc<Deliveries>);

impl Drop for Delivery {
    fn drop(&mut self) {
        self.0.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.0.taken.notify_one();
    }
}

type Reply<T> = (Result<T>, Option<Delivery>);

enum RequestState<T> {
    Ready(Option<Result<T>>),
    Waiting(oneshot::Receiver<Reply<T>>),
}

/// Result of one queued operation.
///
/// The operation runs whether or not the request is awaited; awaiting only
/// observes its result.
pub struct Request<T> {
    state: RequestState<T>,
}

impl<T> Request<T> {
    pub(crate) fn ready(result: Result<T>) -> Self {
        Self {
            state: RequestState::Ready(Some(result)),
        }
    }

    fn waiting(receiver: oneshot::Receiver<Reply<T>>) -> Self {
        Self {
            state: RequestState::Waiting(receiver),
        }
    }
}

impl<T> Unpin for Request<T> {}

impl<T> Future for Request<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            RequestState::Ready(slot) => Poll::Ready(
                slot.take()
                    .unwrap_or_else(|| Err(Error::InvalidState("request already resolved".into()))),
            ),
            RequestState::Waiting(receiver) => Pin::new(receiver).poll(cx).map(|reply| match reply {
                Ok((result, _delivery)) => result,
                Err(_) => Err(Error::Abort("transaction was aborted".into())),
            }),
        }
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Crate-internal unit of work run by the driver.
pub(crate) trait Operation: Send {
    /// Run against the backend and deliver the result to the request. An
    /// error is also returned so the driver aborts the transaction.
    fn run(self: Box<Self>, tx: &mut dyn BackendTransaction, delivery: Delivery) -> Result<()>;

    /// Fail the request without running.
    fn cancel(self: Box<Self>, err: Error);
}

struct Op<T, F> {
    f: F,
    reply: oneshot::Sender<Reply<T>>,
}

impl<T, F> Operation for Op<T, F>
where
    T: Send,
    F: FnOnce(&mut dyn BackendTransaction) -> Result<T> + Send,
{
    fn run(self: Box<Self>, tx: &mut dyn BackendTransaction, delivery: Delivery) -> Result<()> {
        let Op { f, reply } = *self;
        match f(tx) {
            Ok(value) => {
                let _ = reply.send((Ok(value), Some(delivery)));
                Ok(())
            }
            Err(err) => {
                let _ = reply.send((Err(err.clone()), None));
                Err(err)
            }
        }
    }

    fn cancel(self: Box<Self>, err: Error) {
        let _ = self.reply.send((Err(err), None));
    }
}

enum Message {
    Run(Box<dyn Operation>),
    Commit,
}

// ============================================================================
// Shared state
// ============================================================================

pub(crate) struct TxShared {
    pub(crate) mode: TransactionMode,
    scope: Vec<String>,
    state: Mutex<TransactionState>,
    /// Working schema used to validate calls before they are queued.
    meta: Mutex<DatabaseMeta>,
    error: Mutex<Option<Error>>,
    abort: Notify,
    deliveries: Arc<Deliveries>,
    outcome: watch::Sender<Option<Result<()>>>,
    database: Arc<DatabaseInner>,
}

impl TxShared {
    fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }
}

/// Everything a handle needs to issue requests. Dropping the last one
/// closes the driver's channel.
pub(crate) struct TxHandle {
    pub(crate) shared: Arc<TxShared>,
    sender: mpsc::UnboundedSender<Message>,
}

impl TxHandle {
    pub(crate) fn check_active(&self) -> Result<()> {
        match self.shared.state() {
            TransactionState::Pending | TransactionState::Active => Ok(()),
            state => Err(Error::TransactionInactive(format!(
                "transaction is {:?}",
                state
            ))),
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.shared.state() == TransactionState::Finished
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.shared.mode.is_writable() {
            Ok(())
        } else {
            Err(Error::ReadOnly("transaction is readonly".into()))
        }
    }

    pub(crate) fn check_upgrade(&self) -> Result<()> {
        if self.shared.mode == TransactionMode::VersionChange {
            Ok(())
        } else {
            Err(Error::InvalidState(
                "schema changes require a versionchange transaction".into(),
            ))
        }
    }

    pub(crate) fn with_meta<R>(&self, f: impl FnOnce(&DatabaseMeta) -> R) -> R {
        f(&self.shared.meta.lock())
    }

    /// Apply a schema change to the working schema; nothing is queued.
    pub(crate) fn edit_meta<R>(&self, f: impl FnOnce(&mut DatabaseMeta) -> Result<R>) -> Result<R> {
        f(&mut self.shared.meta.lock())
    }

    /// Queue an operation behind everything issued before it.
    pub(crate) fn request<T, F>(&self, f: F) -> Request<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn BackendTransaction) -> Result<T> + Send + 'static,
    {
        if let Err(err) = self.check_active() {
            return Request::ready(Err(err));
        }
        let (reply, receiver) = oneshot::channel();
        let op: Box<dyn Operation> = Box::new(Op { f, reply });
        if let Err(mpsc::error::SendError(Message::Run(op))) = self.sender.send(Message::Run(op)) {
            op.cancel(Error::TransactionInactive("transaction has finished".into()));
        }
        Request::waiting(receiver)
    }

    /// Queue a schema operation whose only observable effect is aborting
    /// the transaction on failure.
    pub(crate) fn schema_op<F>(&self, f: F)
    where
        F: FnOnce(&mut dyn BackendTransaction) -> Result<()> + Send + 'static,
    {
        drop(self.request(f));
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// A transaction over a fixed set of object stores.
#[derive(Clone)]
pub struct Transaction {
    handle: Arc<TxHandle>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("mode", &self.handle.shared.mode)
            .field("scope", &self.handle.shared.scope)
            .field("state", &self.handle.shared.state())
            .finish()
    }
}

impl Transaction {
    pub(crate) fn from_handle(handle: Arc<TxHandle>) -> Self {
        Self { handle }
    }

    pub fn mode(&self) -> TransactionMode {
        self.handle.shared.mode
    }

    pub fn state(&self) -> TransactionState {
        self.handle.shared.state()
    }

    /// The error that aborted this transaction, if any.
    pub fn error(&self) -> Option<Error> {
        self.handle.shared.error.lock().clone()
    }

    /// Stores this transaction may touch, sorted.
    pub fn object_store_names(&self) -> Vec<String> {
        if self.mode() == TransactionMode::VersionChange {
            self.handle.with_meta(DatabaseMeta::store_names)
        } else {
            self.handle.shared.scope.clone()
        }
    }

    pub fn object_store(&self, name: &str) -> Result<ObjectStore> {
        if self.handle.is_finished() {
            return Err(Error::InvalidState("transaction has finished".into()));
        }
        let in_scope = self.mode() == TransactionMode::VersionChange
            || self.handle.shared.scope.iter().any(|s| s == name);
        let store = self
            .handle
            .with_meta(|meta| meta.store(name).cloned())
            .filter(|_| in_scope)
            .ok_or_else(|| Error::NotFound(format!("object store '{}' is not in scope", name)))?;
        Ok(ObjectStore::new(self.handle.clone(), &store))
    }

    pub fn create_object_store(
        &self,
        name: &str,
        params: ObjectStoreParameters,
    ) -> Result<ObjectStore> {
        self.handle.check_upgrade()?;
        self.handle.check_active()?;
        params.validate()?;
        let store = self.handle.edit_meta(|meta| {
            if meta.store(name).is_some() {
                return Err(Error::Constraint(format!(
                    "object store '{}' already exists",
                    name
                )));
            }
            let store = ObjectStoreMeta {
                id: meta.allocate_id(),
                name: name.to_string(),
                key_path: params.key_path.clone(),
                auto_increment: params.auto_increment,
            };
            meta.add_store(store.clone())?;
            Ok(store)
        })?;
        let queued = store.clone();
        self.handle
            .schema_op(move |tx| tx.create_object_store(queued));
        Ok(ObjectStore::new(self.handle.clone(), &store))
    }

    pub fn delete_object_store(&self, name: &str) -> Result<()> {
        self.handle.check_upgrade()?;
        self.handle.check_active()?;
        self.handle.edit_meta(|meta| meta.remove_store(name))?;
        let name = name.to_string();
        self.handle.schema_op(move |tx| tx.delete_object_store(&name));
        Ok(())
    }

    pub(crate) fn set_version(&self, version: u64) {
        self.handle.shared.meta.lock().version = version;
        self.handle.schema_op(move |tx| tx.set_version(version));
    }

    /// Commit once every request placed so far has run.
    pub fn commit(&self) -> Result<()> {
        let shared = &self.handle.shared;
        {
            let mut state = shared.state.lock();
            match *state {
                TransactionState::Pending | TransactionState::Active => {
                    *state = TransactionState::Committing
                }
                other => {
                    return Err(Error::InvalidState(format!(
                        "cannot commit a transaction that is {:?}",
                        other
                    )))
                }
            }
        }
        let _ = self.handle.sender.send(Message::Commit);
        Ok(())
    }

    /// Abort: queued requests fail with `AbortError` and every change is
    /// rolled back.
    pub fn abort(&self) -> Result<()> {
        let shared = &self.handle.shared;
        {
            let mut state = shared.state.lock();
            match *state {
                TransactionState::Pending | TransactionState::Active => {
                    *state = TransactionState::Aborting
                }
                other => {
                    return Err(Error::InvalidState(format!(
                        "cannot abort a transaction that is {:?}",
                        other
                    )))
                }
            }
        }
        *shared.error.lock() = Some(Error::Abort("transaction was aborted".into()));
        shared.abort.notify_one();
        Ok(())
    }

    /// Wait for the transaction to finish. Dropping this handle here lets
    /// the transaction auto-commit once no other handle remains.
    pub async fn done(self) -> Result<()> {
        let mut outcome = self.handle.shared.outcome.subscribe();
        drop(self);
        let result = outcome
            .wait_for(Option::is_some)
            .await
            .map(|outcome| (*outcome).clone());
        match result {
            Ok(Some(result)) => result,
            _ => Err(Error::Abort("transaction driver stopped".into())),
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Create a transaction, queue it with the database's scheduler and spawn
/// its driver. Must be called inside a Tokio runtime.
pub(crate) fn begin(
    database: &Arc<DatabaseInner>,
    scope: Vec<String>,
    mode: TransactionMode,
) -> Transaction {
    let (sender, receiver) = mpsc::unbounded_channel();
    let (started, start) = oneshot::channel();
    let (outcome, _) = watch::channel(None);
    let shared = Arc::new(TxShared {
        mode,
        scope: scope.clone(),
        state: Mutex::new(TransactionState::Pending),
        meta: Mutex::new(database.committed_meta()),
        error: Mutex::new(None),
        abort: Notify::new(),
        deliveries: Arc::default(),
        outcome,
        database: database.clone(),
    });

    let entry = database.scheduler.lock().enqueue(
        scope,
        mode,
        Box::new(move || {
            let _ = started.send(());
        }),
    );

    let driver = Driver {
        shared: shared.clone(),
        receiver,
        start,
        entry,
    };
    tokio::spawn(driver.run());

    Transaction {
        handle: Arc::new(TxHandle { shared, sender }),
    }
}

struct Driver {
    shared: Arc<TxShared>,
    receiver: mpsc::UnboundedReceiver<Message>,
    start: oneshot::Receiver<()>,
    entry: EntryId,
}

impl Driver {
    async fn run(mut self) {
        let shared = self.shared.clone();
        let started = tokio::select! {
            biased;
            _ = shared.abort.notified() => false,
            result = &mut self.start => result.is_ok(),
        };
        if !started {
            self.finish(Err(Error::Abort("transaction was aborted".into())));
            return;
        }

        {
            let mut state = shared.state.lock();
            if *state == TransactionState::Pending {
                *state = TransactionState::Active;
            }
        }

        let mut backend = match shared
            .database
            .backend
            .begin_transaction(&shared.scope, shared.mode)
        {
            Ok(backend) => backend,
            Err(err) => {
                warn!(error = %err, "failed to begin backend transaction");
                self.finish(Err(err));
                return;
            }
        };
        debug!(mode = shared.mode.as_str(), scope = ?shared.scope, "transaction started");

        let outcome = loop {
            tokio::select! {
                biased;
                _ = shared.abort.notified() => {
                    break Err(Error::Abort("transaction was aborted".into()));
                }
                message = self.next_message() => match message {
                    Some(Message::Run(op)) => {
                        let delivery = shared.deliveries.issue();
                        if let Err(err) = op.run(backend.as_mut(), delivery) {
                            break Err(err);
                        }
                    }
                    Some(Message::Commit) | None => break Ok(()),
                },
            }
        };

        let outcome = match outcome.and_then(|()| self.begin_commit()) {
            Ok(()) => match backend.commit() {
                Ok(()) => {
                    debug!(mode = shared.mode.as_str(), "transaction committed");
                    Ok(())
                }
                Err(err) => {
                    warn!(error = %err, "commit failed");
                    Err(err)
                }
            },
            Err(err) => {
                shared.set_state(TransactionState::Aborting);
                if let Err(rollback) = backend.abort() {
                    warn!(error = %rollback, "rollback failed");
                }
                debug!(mode = shared.mode.as_str(), error = %err, "transaction aborted");
                Err(err)
            }
        };
        self.finish(outcome);
    }

    /// Next queued message. `None` once the channel is closed, or once the
    /// transaction has gone idle and should commit.
    async fn next_message(&mut self) -> Option<Message> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) => return Some(message),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => {}
            }
            if self.shared.mode == TransactionMode::VersionChange {
                return self.receiver.recv().await;
            }
            // Callers queue follow-up requests right after taking a result,
            // before they next yield to the runtime.
            let deliveries = self.shared.deliveries.clone();
            tokio::select! {
                biased;
                message = self.receiver.recv() => return message,
                _ = deliveries.all_taken() => {}
            }
            tokio::task::yield_now().await;
            match self.receiver.try_recv() {
                Ok(message) => return Some(message),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => {
                    if self.shared.deliveries.outstanding.load(Ordering::SeqCst) == 0 {
                        trace!(mode = self.shared.mode.as_str(), "transaction idle");
                        return None;
                    }
                }
            }
        }
    }

    /// Move to `Committing` unless an abort got there first.
    fn begin_commit(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if *state == TransactionState::Aborting {
            return Err(Error::Abort("transaction was aborted".into()));
        }
        *state = TransactionState::Committing;
        Ok(())
    }

    fn finish(&mut self, outcome: Result<()>) {
        let shared = &self.shared;
        self.receiver.close();
        while let Ok(message) = self.receiver.try_recv() {
            if let Message::Run(op) = message {
                let err = match &outcome {
                    Ok(()) => Error::TransactionInactive("transaction has finished".into()),
                    Err(_) => Error::Abort("transaction was aborted".into()),
                };
                op.cancel(err);
            }
        }

        let database = &shared.database;
        match &outcome {
            Ok(()) if shared.mode == TransactionMode::VersionChange => database.publish_meta(),
            Ok(()) => {}
            Err(err) => {
                shared.error.lock().get_or_insert_with(|| err.clone());
                *shared.meta.lock() = database.committed_meta();
            }
        }
        shared.set_state(TransactionState::Finished);
        database.scheduler.lock().done(self.entry);
        shared.outcome.send_replace(Some(outcome));
    }
}
