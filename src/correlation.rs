//! The correlation table: tracks pending requests by `id` and routes
//! inbound ACK frames back to their waiter (spec §4.2, §5, §8 invariants
//! 1-2).
//!
//! One table is owned per channel (the client binds exactly one table to
//! one channel), so "on channel close, fail every owned slot" is simply
//! "drain this table".

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::command::TenuredCommand;
use crate::error::TenuredError;

type SlotResult = Result<TenuredCommand, TenuredError>;

/// A concurrent map from request id to its pending response waiter. Insert
/// and take-if-present are both O(1) and lock-free at the map level
/// (striping handled by `dashmap`); no lock is held across I/O (spec §5).
pub struct CorrelationTable {
    slots: DashMap<u32, oneshot::Sender<SlotResult>>,
    next_id: AtomicU32,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Allocate the next monotonic request id. Wraps on overflow, matching
    /// the original's plain `uint32` counter.
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a fresh slot for `id`, returning the receiver half the
    /// caller awaits up to its deadline.
    pub fn register(&self, id: u32) -> oneshot::Receiver<SlotResult> {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(id, tx);
        rx
    }

    /// Atomically remove the slot for `id` without completing it. Used on
    /// send failure and on timeout: the caller already knows the outcome
    /// and a late response for this id must be dropped silently.
    pub fn remove(&self, id: u32) {
        self.slots.remove(&id);
    }

    /// Complete and remove the slot for `id` if one is pending. Returns
    /// `false` if there was no such slot (a late ACK after timeout, which
    /// is not an error — spec §4.2).
    pub fn complete(&self, id: u32, response: TenuredCommand) -> bool {
        match self.slots.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Fail every slot currently owned by this table with `ChannelClosed`
    /// and remove them all (spec §4.7 OnClose, invariant #2).
    pub fn fail_all_closed(&self) {
        let ids: Vec<u32> = self.slots.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.slots.remove(&id) {
                let _ = tx.send(Err(TenuredError::ChannelClosed));
            }
        }
    }

    /// Number of slots currently pending. Used by the shutdown drain loop
    /// (spec §4.7) — polled, not pushed, so it costs nothing when idle.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_delivers_to_waiter_and_removes_slot() {
        let table = CorrelationTable::new();
        let id = table.next_id();
        let rx = table.register(id);

        assert!(table.complete(id, TenuredCommand::response(id, 1, vec![], vec![])));
        assert_eq!(table.len(), 0);

        let resp = rx.await.unwrap().unwrap();
        assert_eq!(resp.id, id);
    }

    #[test]
    fn complete_on_unknown_id_is_a_silent_noop() {
        let table = CorrelationTable::new();
        assert!(!table.complete(999, TenuredCommand::response(999, 1, vec![], vec![])));
    }

    #[tokio::test]
    async fn fail_all_closed_drains_every_slot() {
        let table = CorrelationTable::new();
        let id1 = table.next_id();
        let id2 = table.next_id();
        let rx1 = table.register(id1);
        let rx2 = table.register(id2);

        table.fail_all_closed();
        assert!(table.is_empty());

        assert!(matches!(rx1.await.unwrap(), Err(TenuredError::ChannelClosed)));
        assert!(matches!(rx2.await.unwrap(), Err(TenuredError::ChannelClosed)));
    }

    #[test]
    fn remove_drops_slot_without_completing_it() {
        let table = CorrelationTable::new();
        let id = table.next_id();
        let rx = table.register(id);
        table.remove(id);
        assert_eq!(table.len(), 0);
        drop(rx); // would error if polled since sender was dropped; removal didn't panic
    }
}
