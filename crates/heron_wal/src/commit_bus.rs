//! Bounded commit-notification queue between sequencers and the WAL apply
//! job.
//!
//! Publishing never blocks a committer. When the queue is full the notice is
//! dropped and the rescan counter is bumped instead; the apply job must then
//! scan every registered sequencer for unapplied transactions. The durable
//! transaction catalog is the source of truth, the queue is only a shortcut.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::time::Duration;

use parking_lot::Mutex;

use heron_common::types::{TableId, Txn};

/// One committed transaction, data or structural.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitNotice {
    pub table_id: TableId,
    pub table_name: String,
    pub txn: Txn,
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitBusStats {
    pub published: u64,
    pub dropped: u64,
}

pub struct CommitBus {
    tx: SyncSender<CommitNotice>,
    rx: Mutex<Receiver<CommitNotice>>,
    /// Pending full-scan requests. Starts at 1 so the first apply pass
    /// scans all tables: commits may predate this process.
    rescan_requests: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl CommitBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            rescan_requests: AtomicU64::new(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Publishes a commit notice without ever blocking. A full queue drops
    /// the notice and records a rescan request instead.
    pub fn publish(&self, notice: CommitNotice) {
        match self.tx.try_send(notice) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(notice)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.rescan_requests.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    table = %notice.table_name,
                    txn = notice.txn,
                    "commit queue full, notice dropped, rescan requested"
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                // Consumer is gone during shutdown; nothing to wake.
            }
        }
    }

    /// Non-blocking consume.
    pub fn try_next(&self) -> Option<CommitNotice> {
        self.rx.lock().try_recv().ok()
    }

    /// Blocking consume with a deadline, for the apply job's main loop.
    pub fn next_timeout(&self, timeout: Duration) -> Option<CommitNotice> {
        match self.rx.lock().recv_timeout(timeout) {
            Ok(notice) => Some(notice),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Takes all pending rescan requests, returning how many there were.
    /// A nonzero return obliges the caller to scan every table.
    pub fn take_rescan_requests(&self) -> u64 {
        self.rescan_requests.swap(0, Ordering::Relaxed)
    }

    pub fn rescan_requests(&self) -> u64 {
        self.rescan_requests.load(Ordering::Relaxed)
    }

    /// Forces the next apply pass to scan all tables.
    pub fn request_rescan(&self) {
        self.rescan_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CommitBusStats {
        CommitBusStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(txn: Txn) -> CommitNotice {
        CommitNotice {
            table_id: TableId(1),
            table_name: "plug".into(),
            txn,
        }
    }

    #[test]
    fn test_starts_with_one_rescan_request() {
        let bus = CommitBus::new(4);
        assert_eq!(bus.rescan_requests(), 1);
        assert_eq!(bus.take_rescan_requests(), 1);
        assert_eq!(bus.rescan_requests(), 0);
    }

    #[test]
    fn test_publish_and_consume_in_order() {
        let bus = CommitBus::new(4);
        bus.publish(notice(1));
        bus.publish(notice(2));
        assert_eq!(bus.try_next().unwrap().txn, 1);
        assert_eq!(bus.try_next().unwrap().txn, 2);
        assert!(bus.try_next().is_none());
        assert_eq!(bus.stats().published, 2);
        assert_eq!(bus.stats().dropped, 0);
    }

    #[test]
    fn test_full_queue_drops_and_requests_rescan() {
        let bus = CommitBus::new(2);
        bus.take_rescan_requests();
        bus.publish(notice(1));
        bus.publish(notice(2));

        bus.publish(notice(3));
        assert_eq!(bus.rescan_requests(), 1);
        assert_eq!(bus.stats().dropped, 1);

        // The queued notices survive, the overflow one does not.
        assert_eq!(bus.try_next().unwrap().txn, 1);
        assert_eq!(bus.try_next().unwrap().txn, 2);
        assert!(bus.try_next().is_none());
    }

    #[test]
    fn test_publish_does_not_block_when_full() {
        let bus = CommitBus::new(1);
        bus.publish(notice(1));
        let start = std::time::Instant::now();
        for txn in 2..100 {
            bus.publish(notice(txn));
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(bus.stats().dropped, 98);
    }
}
