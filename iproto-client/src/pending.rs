//! Request correlation table.
//!
//! Every request that expects a reply is registered here under its sync id.
//! An entry is resolved by whoever removes it first: the read loop (reply),
//! the request's timer (timeout) or a close (drain). Removal happens under
//! the table lock, so each entry resolves exactly once.

use crate::error::ClientError;
use iproto_protocol::Body;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::AbortHandle;

pub(crate) type Completion = oneshot::Sender<Result<Body, ClientError>>;

/// A request waiting for its final reply.
pub(crate) struct Pending {
    completion: Completion,
    push: Option<mpsc::UnboundedSender<Body>>,
    timer: Option<AbortHandle>,
    pub(crate) stream_id: Option<u64>,
    pub(crate) description: String,
}

impl Pending {
    pub(crate) fn new(
        completion: Completion,
        push: Option<mpsc::UnboundedSender<Body>>,
        stream_id: Option<u64>,
        description: String,
    ) -> Self {
        Self {
            completion,
            push,
            timer: None,
            stream_id,
            description,
        }
    }

    /// Stops the timer and hands the result to the waiting caller. A caller
    /// that dropped its handle is not an error.
    pub(crate) fn complete(self, result: Result<Body, ClientError>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        let _ = self.completion.send(result);
    }
}

/// Outcome of routing an `IPROTO_CHUNK` frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    Delivered,
    /// The request exists but did not ask for pushes.
    NoConsumer,
    NotPending,
}

#[derive(Default)]
struct Table {
    entries: HashMap<u64, Pending>,
    /// Set once the connection is closed; later inserts fail with it.
    closed: Option<ClientError>,
}

pub(crate) struct PendingTable {
    table: Mutex<Table>,
    drained: Notify,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self {
            table: Mutex::new(Table::default()),
            drained: Notify::new(),
        }
    }

    /// Registers a request. Fails with the close error once the table has
    /// been closed.
    pub(crate) fn insert(&self, sync: u64, pending: Pending) -> Result<(), ClientError> {
        let mut table = self.table.lock();
        if let Some(err) = &table.closed {
            return Err(err.clone());
        }
        let previous = table.entries.insert(sync, pending);
        debug_assert!(previous.is_none(), "sync id {} reused while pending", sync);
        Ok(())
    }

    /// Attaches a timer to a pending request. If the request already
    /// resolved, the timer is cancelled right away.
    pub(crate) fn set_timer(&self, sync: u64, timer: AbortHandle) {
        let mut table = self.table.lock();
        match table.entries.get_mut(&sync) {
            Some(entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }
    }

    pub(crate) fn push(&self, sync: u64, body: Body) -> PushOutcome {
        let table = self.table.lock();
        let Some(entry) = table.entries.get(&sync) else {
            return PushOutcome::NotPending;
        };
        match &entry.push {
            // A dropped consumer just stops receiving pushes
            Some(tx) => {
                let _ = tx.send(body);
                PushOutcome::Delivered
            }
            None => PushOutcome::NoConsumer,
        }
    }

    /// Removes a request so the caller can resolve it.
    pub(crate) fn take(&self, sync: u64) -> Option<Pending> {
        let mut table = self.table.lock();
        let entry = table.entries.remove(&sync);
        if entry.is_some() && table.entries.is_empty() {
            self.drained.notify_waiters();
        }
        entry
    }

    /// Closes the table and fails every pending request with `err`.
    /// Returns the number of requests failed.
    pub(crate) fn close(&self, err: ClientError) -> usize {
        let drained: Vec<Pending> = {
            let mut table = self.table.lock();
            if table.closed.is_none() {
                table.closed = Some(err.clone());
            }
            table.entries.drain().map(|(_, entry)| entry).collect()
        };
        self.drained.notify_waiters();

        let count = drained.len();
        for entry in drained {
            entry.complete(Err(err.clone()));
        }
        count
    }

    /// Waits until no request is pending.
    pub(crate) async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.table.lock().entries.is_empty()
    }

    /// Number of pending requests with a live timer.
    pub(crate) fn active_timers(&self) -> usize {
        self.table
            .lock()
            .entries
            .values()
            .filter(|entry| entry.timer.as_ref().is_some_and(|t| !t.is_finished()))
            .count()
    }
}
