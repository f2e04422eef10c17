//! Transaction stream bookkeeping.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transaction state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Allocated, no transaction started.
    None,
    Active,
    Committed,
    RolledBack,
    /// The server rolled the transaction back when its timeout elapsed.
    AbortedByTimeout,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionState::None => "none",
            TransactionState::Active => "active",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled back",
            TransactionState::AbortedByTimeout => "aborted by timeout",
        })
    }
}

/// Streams allocated on one connection.
pub(crate) struct StreamTracker {
    next_id: AtomicU64,
    states: Mutex<HashMap<u64, TransactionState>>,
}

impl StreamTracker {
    pub(crate) fn new() -> Self {
        Self {
            // Stream id 0 means "no stream" on the wire
            next_id: AtomicU64::new(1),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn allocate(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.states.lock().insert(id, TransactionState::None);
        id
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.states.lock().contains_key(&id)
    }

    pub(crate) fn state(&self, id: u64) -> Option<TransactionState> {
        self.states.lock().get(&id).copied()
    }

    /// Records a state change. Abort by timeout is sticky: a later commit or
    /// rollback reply does not clear it.
    pub(crate) fn set(&self, id: u64, state: TransactionState) {
        if let Some(current) = self.states.lock().get_mut(&id) {
            if *current != TransactionState::AbortedByTimeout || state == TransactionState::Active {
                *current = state;
            }
        }
    }

    pub(crate) fn mark_aborted(&self, id: u64) {
        self.set(id, TransactionState::AbortedByTimeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_unique() {
        let tracker = StreamTracker::new();
        let a = tracker.allocate();
        let b = tracker.allocate();
        assert_ne!(a, b);
        assert_ne!(a, 0);
        assert_eq!(tracker.state(a), Some(TransactionState::None));
        assert!(!tracker.contains(999));
    }

    #[test]
    fn test_lifecycle() {
        let tracker = StreamTracker::new();
        let id = tracker.allocate();
        tracker.set(id, TransactionState::Active);
        tracker.set(id, TransactionState::Committed);
        assert_eq!(tracker.state(id), Some(TransactionState::Committed));

        // Unknown ids are ignored
        tracker.set(77, TransactionState::Active);
        assert_eq!(tracker.state(77), None);
    }

    #[test]
    fn test_abort_is_sticky_until_next_begin() {
        let tracker = StreamTracker::new();
        let id = tracker.allocate();
        tracker.set(id, TransactionState::Active);
        tracker.mark_aborted(id);
        tracker.set(id, TransactionState::RolledBack);
        assert_eq!(tracker.state(id), Some(TransactionState::AbortedByTimeout));

        tracker.set(id, TransactionState::Active);
        assert_eq!(tracker.state(id), Some(TransactionState::Active));
    }
}
