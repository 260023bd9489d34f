use std::sync::atomic::{AtomicU64, Ordering};

/// Per-bridge operation counters. Writes are `fetch_add` on specific paths
/// only; reads are relaxed loads and never take a lock.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    pub(crate) sent_awaiting_response: AtomicU64,
    pub(crate) pending_unsent: AtomicU64,
    pub(crate) completed_sync: AtomicU64,
    pub(crate) completed_async: AtomicU64,
    pub(crate) failed_async: AtomicU64,
    pub(crate) subscriptions: AtomicU64,
    pub(crate) socket_count: AtomicU64,
    pub(crate) operation_count: AtomicU64,
}

/// Owned point-in-time copy of a bridge's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub sent_awaiting_response: u64,
    pub pending_unsent: u64,
    pub completed_sync: u64,
    pub completed_async: u64,
    pub failed_async: u64,
    pub subscriptions: u64,
    pub socket_count: u64,
    pub operation_count: u64,
}

impl ConnectionCounters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decr(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            sent_awaiting_response: self.sent_awaiting_response.load(Ordering::Relaxed),
            pending_unsent: self.pending_unsent.load(Ordering::Relaxed),
            completed_sync: self.completed_sync.load(Ordering::Relaxed),
            completed_async: self.completed_async.load(Ordering::Relaxed),
            failed_async: self.failed_async.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
            socket_count: self.socket_count.load(Ordering::Relaxed),
            operation_count: self.operation_count.load(Ordering::Relaxed),
        }
    }
}
