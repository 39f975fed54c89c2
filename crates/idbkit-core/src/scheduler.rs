//! Transaction scheduler
//!
//! Decides when a transaction may start. Entries are considered strictly in
//! enqueue order: an entry starts once it conflicts with no running entry and
//! no entry queued before it. Two entries conflict when their scopes overlap
//! and at least one of them writes. A versionchange entry conflicts with
//! everything.
//!
//! The scheduler only orders starts; running transactions is the caller's
//! business. It is a plain struct, owned by its database behind a mutex.

use std::collections::{BTreeSet, VecDeque};

use tracing::trace;

use crate::meta::TransactionMode;

/// Callback run when an entry is allowed to start.
pub type StartFn = Box<dyn FnOnce() + Send>;

/// Handle returned by [`Scheduler::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u64);

struct Entry {
    id: EntryId,
    scope: BTreeSet<String>,
    mode: TransactionMode,
}

struct Waiting {
    entry: Entry,
    start: StartFn,
}

impl Entry {
    fn conflicts_with(&self, other: &Entry) -> bool {
        if self.mode == TransactionMode::VersionChange
            || other.mode == TransactionMode::VersionChange
        {
            return true;
        }
        if self.mode == TransactionMode::ReadOnly && other.mode == TransactionMode::ReadOnly {
            return false;
        }
        self.scope.intersection(&other.scope).next().is_some()
    }
}

#[derive(Default)]
pub struct Scheduler {
    next_id: u64,
    queue: VecDeque<Waiting>,
    active: Vec<Entry>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a transaction. `start` runs before this returns if nothing
    /// conflicts, otherwise once the blocking entries are done.
    pub fn enqueue(
        &mut self,
        scope: impl IntoIterator<Item = String>,
        mode: TransactionMode,
        start: StartFn,
    ) -> EntryId {
        self.next_id += 1;
        let id = EntryId(self.next_id);
        self.queue.push_back(Waiting {
            entry: Entry {
                id,
                scope: scope.into_iter().collect(),
                mode,
            },
            start,
        });
        trace!(entry = id.0, mode = mode.as_str(), "enqueued transaction");
        self.pass();
        id
    }

    /// Mark an entry finished, whether it ran or was still waiting, and
    /// start whatever it was blocking.
    pub fn done(&mut self, id: EntryId) {
        self.active.retain(|entry| entry.id != id);
        self.queue.retain(|waiting| waiting.entry.id != id);
        trace!(entry = id.0, "transaction done");
        self.pass();
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    /// One scheduling pass in queue order. Started entries join `active`
    /// immediately, so later entries in the same pass see them.
    fn pass(&mut self) {
        let mut blocked: Vec<Waiting> = Vec::new();
        while let Some(waiting) = self.queue.pop_front() {
            let runnable = !self
                .active
                .iter()
                .chain(blocked.iter().map(|w| &w.entry))
                .any(|other| other.conflicts_with(&waiting.entry));
            if runnable {
                trace!(entry = waiting.entry.id.0, "starting transaction");
                self.active.push(waiting.entry);
                (waiting.start)();
            } else {
                blocked.push(waiting);
            }
        }
        self.queue = blocked.into();
    }
}
