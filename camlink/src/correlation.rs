//! Correlation table pairing camera notifications with waiting callers.
//!
//! A fixed array of waiter slots addressed by either key: the sequence
//! number of an outstanding request, or `(cmd_set, cmd_id)` for frames the
//! camera originates on its own. One tagged key per slot (rather than two
//! maps) lets the eviction policies reason across both kinds: by-seq
//! allocation may evict the globally least-recently-used entry, while
//! by-cmd allocation only ever sacrifices another by-cmd entry.
//!
//! The mutex guards slot metadata only. Waiting happens on a per-entry
//! signal taken out of the lock; delivery stores the payload, then raises
//! the signal. Each allocation gets a fresh signal, so a waiter parked on
//! an evicted entry can never be woken by the slot's next occupant.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::catalog::Payload;

/// Number of commands that can be awaited in parallel.
pub const TABLE_CAPACITY: usize = 10;

/// Entries untouched for longer than this are reclaimed by [`sweep`].
///
/// [`sweep`]: CorrelationTable::sweep
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("waiter table is full")]
    TableFull,
    #[error("no waiter entry for this key")]
    NotFound,
    #[error("timed out waiting for a matching notification")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Key {
    Seq(u16),
    Cmd { cmd_set: u8, cmd_id: u8 },
}

struct Entry {
    key: Key,
    /// For by-cmd entries, stamped with the sequence the camera chose once
    /// a frame is delivered.
    seq: u16,
    payload: Option<Payload>,
    signal: Arc<Notify>,
    last_access: Instant,
}

impl Entry {
    fn new(key: Key) -> Self {
        let seq = match key {
            Key::Seq(seq) => seq,
            Key::Cmd { .. } => 0,
        };
        Entry {
            key,
            seq,
            payload: None,
            signal: Arc::new(Notify::new()),
            last_access: Instant::now(),
        }
    }
}

type Slots = [Option<Entry>; TABLE_CAPACITY];

pub struct CorrelationTable {
    slots: Mutex<Slots>,
    max_age: Duration,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AGE)
    }
}

impl CorrelationTable {
    pub fn new(max_age: Duration) -> Self {
        CorrelationTable {
            slots: Mutex::new(std::array::from_fn(|_| None)),
            max_age,
        }
    }

    fn position(slots: &Slots, key: Key) -> Option<usize> {
        slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|e| e.key == key))
    }

    fn free_slot(slots: &Slots) -> Option<usize> {
        slots.iter().position(Option::is_none)
    }

    /// Index of the least-recently-accessed entry matching the predicate.
    fn oldest(slots: &Slots, keep: impl Fn(&Entry) -> bool) -> Option<usize> {
        slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().filter(|e| keep(e)).map(|e| (i, e.last_access)))
            .min_by_key(|&(_, at)| at)
            .map(|(i, _)| i)
    }

    /// Reserve a waiter for an outgoing request. An entry already bound to
    /// the same sequence is discarded and replaced; a full table sacrifices
    /// the least-recently-used entry of either kind.
    pub fn allocate_by_seq(&self, seq: u16) -> Result<(), CorrelationError> {
        let mut slots = self.slots.lock();
        if let Some(i) = Self::position(&slots, Key::Seq(seq)) {
            debug!(seq = format!("{seq:#06x}"), "overwriting outstanding waiter");
            slots[i] = None;
        }
        let index = match Self::free_slot(&slots) {
            Some(i) => i,
            None => {
                let i = Self::oldest(&slots, |_| true).ok_or(CorrelationError::TableFull)?;
                if let Some(evicted) = &slots[i] {
                    warn!(key = ?evicted.key, "waiter table full, evicting least-recently-used entry");
                }
                i
            }
        };
        slots[index] = Some(Entry::new(Key::Seq(seq)));
        Ok(())
    }

    /// Reserve (or reuse) a waiter for an unsolicited command family.
    pub fn allocate_by_cmd(&self, cmd_set: u8, cmd_id: u8) -> Result<(), CorrelationError> {
        let mut slots = self.slots.lock();
        Self::allocate_by_cmd_locked(&mut slots, cmd_set, cmd_id).map(|_| ())
    }

    fn allocate_by_cmd_locked(
        slots: &mut Slots,
        cmd_set: u8,
        cmd_id: u8,
    ) -> Result<usize, CorrelationError> {
        let key = Key::Cmd { cmd_set, cmd_id };
        if let Some(i) = Self::position(slots, key) {
            // An existing entry keeps its payload and signal so a parked
            // waiter is not orphaned.
            if let Some(entry) = slots[i].as_mut() {
                entry.last_access = Instant::now();
            }
            return Ok(i);
        }
        let index = match Self::free_slot(slots) {
            Some(i) => i,
            None => {
                // By-seq waiters belong to live requests and are never
                // sacrificed for a push.
                let i = Self::oldest(slots, |e| matches!(e.key, Key::Cmd { .. }))
                    .ok_or(CorrelationError::TableFull)?;
                if let Some(evicted) = &slots[i] {
                    warn!(key = ?evicted.key, "evicting oldest by-cmd entry");
                }
                i
            }
        };
        slots[index] = Some(Entry::new(key));
        Ok(index)
    }

    /// Whether a by-seq entry exists; refreshes its last-access time.
    pub fn find_by_seq(&self, seq: u16) -> bool {
        let mut slots = self.slots.lock();
        match Self::position(&slots, Key::Seq(seq)) {
            Some(i) => {
                if let Some(entry) = slots[i].as_mut() {
                    entry.last_access = Instant::now();
                }
                true
            }
            None => false,
        }
    }

    /// Whether a by-cmd entry exists; refreshes its last-access time.
    pub fn find_by_cmd(&self, cmd_set: u8, cmd_id: u8) -> bool {
        let mut slots = self.slots.lock();
        match Self::position(&slots, Key::Cmd { cmd_set, cmd_id }) {
            Some(i) => {
                if let Some(entry) = slots[i].as_mut() {
                    entry.last_access = Instant::now();
                }
                true
            }
            None => false,
        }
    }

    /// Drop a waiter without consuming it (used after no-reply writes and
    /// on failed sends).
    pub fn release_seq(&self, seq: u16) {
        let mut slots = self.slots.lock();
        if let Some(i) = Self::position(&slots, Key::Seq(seq)) {
            slots[i] = None;
        }
    }

    /// Notification ingress. A frame matching an outstanding request lands
    /// in its by-seq waiter; anything else is parked in a by-cmd entry
    /// stamped with the camera's sequence, where a later [`wait_for_cmd`]
    /// picks it up.
    ///
    /// [`wait_for_cmd`]: CorrelationTable::wait_for_cmd
    pub fn deliver(&self, seq: u16, cmd_set: u8, cmd_id: u8, payload: Payload) {
        let mut slots = self.slots.lock();
        if let Some(i) = Self::position(&slots, Key::Seq(seq)) {
            if let Some(entry) = slots[i].as_mut() {
                entry.payload = Some(payload);
                entry.last_access = Instant::now();
                entry.signal.notify_one();
            }
            return;
        }

        match Self::allocate_by_cmd_locked(&mut slots, cmd_set, cmd_id) {
            Ok(i) => {
                if let Some(entry) = slots[i].as_mut() {
                    entry.seq = seq;
                    entry.payload = Some(payload);
                    entry.last_access = Instant::now();
                    entry.signal.notify_one();
                }
            }
            Err(err) => {
                warn!(
                    seq = format!("{seq:#06x}"),
                    cmd_set = format!("{cmd_set:#04x}"),
                    cmd_id = format!("{cmd_id:#04x}"),
                    error = %err,
                    "dropping notification, no waiter slot available"
                );
            }
        }
    }

    /// Wait for the response to an outstanding request. The entry is
    /// consumed on success, timeout, and eviction alike.
    pub async fn wait_for_seq(
        &self,
        seq: u16,
        timeout: Duration,
    ) -> Result<Payload, CorrelationError> {
        let deadline = Instant::now() + timeout;
        let signal = {
            let mut slots = self.slots.lock();
            let i = Self::position(&slots, Key::Seq(seq)).ok_or(CorrelationError::NotFound)?;
            let Some(entry) = slots[i].as_mut() else {
                return Err(CorrelationError::NotFound);
            };
            entry.last_access = Instant::now();
            if let Some(payload) = entry.payload.take() {
                slots[i] = None;
                return Ok(payload);
            }
            entry.signal.clone()
        };

        let woke = time::timeout_at(deadline, signal.notified()).await.is_ok();

        let mut slots = self.slots.lock();
        let payload = Self::position(&slots, Key::Seq(seq)).and_then(|i| {
            let payload = slots[i].as_mut().and_then(|e| e.payload.take());
            slots[i] = None;
            payload
        });
        payload.ok_or(if woke {
            CorrelationError::NotFound
        } else {
            CorrelationError::Timeout
        })
    }

    /// Wait for a camera-originated frame of the given command family,
    /// returning the sequence the camera chose together with the payload.
    /// Allocates the by-cmd entry when none exists yet so there is a signal
    /// to park on.
    pub async fn wait_for_cmd(
        &self,
        cmd_set: u8,
        cmd_id: u8,
        timeout: Duration,
    ) -> Result<(u16, Payload), CorrelationError> {
        let key = Key::Cmd { cmd_set, cmd_id };
        let deadline = Instant::now() + timeout;
        let signal = {
            let mut slots = self.slots.lock();
            let i = Self::allocate_by_cmd_locked(&mut slots, cmd_set, cmd_id)?;
            let Some(entry) = slots[i].as_mut() else {
                return Err(CorrelationError::NotFound);
            };
            entry.last_access = Instant::now();
            if let Some(payload) = entry.payload.take() {
                let seq = entry.seq;
                slots[i] = None;
                return Ok((seq, payload));
            }
            entry.signal.clone()
        };

        let woke = time::timeout_at(deadline, signal.notified()).await.is_ok();

        let mut slots = self.slots.lock();
        let result = Self::position(&slots, key).and_then(|i| {
            let taken = slots[i]
                .as_mut()
                .and_then(|e| e.payload.take().map(|p| (e.seq, p)));
            slots[i] = None;
            taken
        });
        result.ok_or(if woke {
            CorrelationError::NotFound
        } else {
            CorrelationError::Timeout
        })
    }

    /// Reclaim entries untouched for longer than the retention bound. The
    /// engine runs this once per minute.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if let Some(entry) = slot
                && now.duration_since(entry.last_access) > self.max_age
            {
                debug!(key = ?entry.key, "sweeping stale waiter entry");
                *slot = None;
            }
        }
    }

    #[cfg(test)]
    fn occupancy(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::advance;

    use crate::records::RetCodeAck;

    use super::*;

    fn ack(ret_code: u8) -> Payload {
        Payload::KeyReportAck(RetCodeAck { ret_code })
    }

    #[tokio::test(start_paused = true)]
    async fn deliver_then_wait_returns_immediately() {
        let table = CorrelationTable::default();
        table.allocate_by_seq(7).unwrap();
        table.deliver(7, 0x00, 0x11, ack(3));

        let payload = table.wait_for_seq(7, Duration::from_secs(5)).await.unwrap();
        assert_eq!(payload, ack(3));
        assert_eq!(table.occupancy(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_then_deliver_wakes_the_waiter() {
        let table = Arc::new(CorrelationTable::default());
        table.allocate_by_seq(9).unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.wait_for_seq(9, Duration::from_secs(5)).await })
        };

        advance(Duration::from_millis(50)).await;
        table.deliver(9, 0x1D, 0x03, ack(0));

        assert_eq!(waiter.await.unwrap(), Ok(ack(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_frees_the_entry() {
        let table = CorrelationTable::default();
        table.allocate_by_seq(4).unwrap();

        let result = table.wait_for_seq(4, Duration::from_secs(5)).await;
        assert_eq!(result, Err(CorrelationError::Timeout));
        assert_eq!(table.occupancy(), 0);
        assert!(!table.find_by_seq(4));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_unknown_seq_is_not_found() {
        let table = CorrelationTable::default();
        assert_eq!(
            table.wait_for_seq(1, Duration::from_secs(1)).await,
            Err(CorrelationError::NotFound)
        );
    }

    // Two concurrent waiters on distinct sequences each receive their own
    // payload, regardless of notification arrival order.
    #[tokio::test(start_paused = true)]
    async fn waiters_receive_their_own_sequence() {
        let table = Arc::new(CorrelationTable::default());
        table.allocate_by_seq(1).unwrap();
        table.allocate_by_seq(2).unwrap();

        let first = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.wait_for_seq(1, Duration::from_secs(5)).await })
        };
        let second = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.wait_for_seq(2, Duration::from_secs(5)).await })
        };

        advance(Duration::from_millis(10)).await;
        // Deliver in reverse order.
        table.deliver(2, 0x1D, 0x03, ack(2));
        table.deliver(1, 0x1D, 0x03, ack(1));

        assert_eq!(first.await.unwrap(), Ok(ack(1)));
        assert_eq!(second.await.unwrap(), Ok(ack(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn same_seq_allocation_overwrites() {
        let table = CorrelationTable::default();
        table.allocate_by_seq(5).unwrap();
        table.deliver(5, 0x00, 0x11, ack(1));
        // Reallocating the same sequence discards the stale payload.
        table.allocate_by_seq(5).unwrap();
        assert_eq!(table.occupancy(), 1);

        let result = table.wait_for_seq(5, Duration::from_millis(100)).await;
        assert_eq!(result, Err(CorrelationError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn full_table_evicts_least_recently_used() {
        let table = CorrelationTable::default();
        for seq in 1..=10u16 {
            table.allocate_by_seq(seq).unwrap();
            advance(Duration::from_millis(10)).await;
        }
        // Touch seq 1 so seq 2 becomes the oldest.
        assert!(table.find_by_seq(1));

        table.allocate_by_seq(11).unwrap();

        assert_eq!(table.occupancy(), TABLE_CAPACITY);
        assert!(table.find_by_seq(1));
        assert!(!table.find_by_seq(2), "oldest entry should have been evicted");
        assert!(table.find_by_seq(11));
    }

    #[tokio::test(start_paused = true)]
    async fn by_cmd_never_evicts_by_seq() {
        let table = CorrelationTable::default();
        for seq in 1..=10u16 {
            table.allocate_by_seq(seq).unwrap();
            advance(Duration::from_millis(10)).await;
        }

        assert_eq!(
            table.allocate_by_cmd(0x1D, 0x02),
            Err(CorrelationError::TableFull)
        );
        for seq in 1..=10u16 {
            assert!(table.find_by_seq(seq));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn by_cmd_evicts_oldest_by_cmd_under_pressure() {
        let table = CorrelationTable::default();
        table.allocate_by_cmd(0x1D, 0x02).unwrap();
        advance(Duration::from_millis(10)).await;
        table.allocate_by_cmd(0x1D, 0x06).unwrap();
        advance(Duration::from_millis(10)).await;
        for seq in 1..=8u16 {
            table.allocate_by_seq(seq).unwrap();
            advance(Duration::from_millis(10)).await;
        }

        table.allocate_by_cmd(0x00, 0x19).unwrap();

        assert!(!table.find_by_cmd(0x1D, 0x02), "oldest by-cmd evicted");
        assert!(table.find_by_cmd(0x1D, 0x06));
        assert!(table.find_by_cmd(0x00, 0x19));
        for seq in 1..=8u16 {
            assert!(table.find_by_seq(seq));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn by_cmd_allocation_reuses_matching_entry() {
        let table = CorrelationTable::default();
        table.deliver(0x4242, 0x1D, 0x02, ack(9));
        assert_eq!(table.occupancy(), 1);

        // The second allocation reuses the entry, payload intact.
        table.allocate_by_cmd(0x1D, 0x02).unwrap();
        assert_eq!(table.occupancy(), 1);

        let (seq, payload) = table
            .wait_for_cmd(0x1D, 0x02, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(seq, 0x4242);
        assert_eq!(payload, ack(9));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_cmd_parks_until_delivery() {
        let table = Arc::new(CorrelationTable::default());

        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(
                async move { table.wait_for_cmd(0x00, 0x19, Duration::from_secs(60)).await },
            )
        };

        advance(Duration::from_secs(2)).await;
        table.deliver(0x0077, 0x00, 0x19, ack(0));

        assert_eq!(waiter.await.unwrap(), Ok((0x0077, ack(0))));
    }

    #[tokio::test(start_paused = true)]
    async fn release_discards_without_consuming() {
        let table = CorrelationTable::default();
        table.allocate_by_seq(3).unwrap();
        table.release_seq(3);
        assert_eq!(table.occupancy(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_reclaims_stale_entries_only() {
        let table = CorrelationTable::default();
        table.allocate_by_seq(1).unwrap();
        advance(Duration::from_secs(100)).await;
        table.allocate_by_seq(2).unwrap();

        // Entry 1 is now 121 s old, entry 2 only 21 s.
        advance(Duration::from_secs(21)).await;
        table.sweep();

        assert!(!table.find_by_seq(1));
        assert!(table.find_by_seq(2));
    }

    // Eleven outstanding requests against ten slots: the eleventh
    // allocation evicts the least-recently-touched waiter, whose caller
    // then observes a timeout while every other waiter still gets its own
    // reply. A delivery for the slot's new occupant must not wake the
    // evicted waiter through a recycled signal.
    #[tokio::test(start_paused = true)]
    async fn table_pressure_times_out_only_the_evicted_waiter() {
        let table = Arc::new(CorrelationTable::default());
        let mut waiters = Vec::new();
        for seq in 1..=10u16 {
            table.allocate_by_seq(seq).unwrap();
            let handle = {
                let table = Arc::clone(&table);
                tokio::spawn(async move { table.wait_for_seq(seq, Duration::from_secs(5)).await })
            };
            waiters.push(handle);
            // Let the waiter park (and touch its entry) before the next
            // allocation.
            advance(Duration::from_millis(10)).await;
        }

        // Eleventh request: evicts the waiter for seq 1.
        table.allocate_by_seq(11).unwrap();
        table.deliver(11, 0x1D, 0x03, ack(11));
        for seq in 2..=10u16 {
            table.deliver(seq, 0x1D, 0x03, ack(seq as u8));
        }

        let mut results = Vec::new();
        for handle in waiters {
            results.push(handle.await.unwrap());
        }
        assert_eq!(results[0], Err(CorrelationError::Timeout));
        for (i, result) in results.iter().enumerate().skip(1) {
            assert_eq!(*result, Ok(ack((i + 1) as u8)), "waiter {}", i + 1);
        }
        assert_eq!(
            table.wait_for_seq(11, Duration::from_secs(1)).await,
            Ok(ack(11))
        );
    }
}
