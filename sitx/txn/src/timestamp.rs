//! Timestamp allocation for MVCC transactions.
//!
//! The engine draws every begin and commit timestamp from a single
//! [`TimestampAuthority`]. A transaction's identifier is its begin timestamp
//! moved into the txn-id half of the value space, so cell versions stamped
//! with a [`Timestamp`] tell a reader whether the version is still tied to an
//! in-flight transaction (txn-id domain) or has been rolled forward to its
//! commit point (commit-ts domain).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::TimestampError;

/// Represents a timestamp used for multi-version concurrency control (MVCC).
/// It can either represent a transaction ID which starts from 1 << 63,
/// or a begin/commit timestamp which starts from 0. So, we can determine a
/// timestamp is a transaction ID if the highest bit is set to 1, or a
/// begin/commit timestamp if the highest bit is 0.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

/// A transaction identifier. Lives in the txn-id half of the timestamp space;
/// its low bits are the transaction's begin timestamp, so id order is begin
/// order.
pub type TxnId = Timestamp;

impl Timestamp {
    /// The start of the transaction ID range.
    pub const TXN_ID_START: u64 = 1 << 63;

    /// Create timestamp by a given raw value.
    pub fn with_ts(timestamp: u64) -> Self {
        Self(timestamp)
    }

    /// Returns the maximum possible commit timestamp.
    pub fn max_commit_ts() -> Self {
        Self(u64::MAX & !Self::TXN_ID_START)
    }

    /// Returns true if the timestamp is a transaction ID.
    pub fn is_txn_id(&self) -> bool {
        self.raw() & Self::TXN_ID_START != 0
    }

    /// Returns true if the timestamp is a begin/commit timestamp.
    pub fn is_commit_ts(&self) -> bool {
        self.raw() & Self::TXN_ID_START == 0
    }

    /// The txn id derived from this begin timestamp.
    pub fn as_txn_id(&self) -> TxnId {
        Timestamp(self.0 | Self::TXN_ID_START)
    }

    /// The begin timestamp a txn id was derived from.
    pub fn as_begin_ts(&self) -> Timestamp {
        Timestamp(self.0 & !Self::TXN_ID_START)
    }

    /// Returns the raw value of the timestamp.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Strictly monotonic timestamp counter.
struct TimestampCounter {
    counter: AtomicU64,
}

impl TimestampCounter {
    fn new(start: u64) -> Self {
        Self {
            counter: AtomicU64::new(start),
        }
    }

    fn next(&self) -> Result<Timestamp, TimestampError> {
        let mut cur = self.counter.load(Ordering::SeqCst);
        loop {
            if cur >= Timestamp::max_commit_ts().raw() {
                return Err(TimestampError::CommitTsOverflow(cur));
            }
            match self.counter.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(Timestamp::with_ts(cur)),
                Err(actual) => cur = actual,
            }
        }
    }

    fn current(&self) -> Timestamp {
        Timestamp::with_ts(self.counter.load(Ordering::SeqCst))
    }

    fn update_if_greater(&self, ts: Timestamp) -> Result<(), TimestampError> {
        if !ts.is_commit_ts() {
            return Err(TimestampError::WrongDomainCommit(ts.raw()));
        }
        if ts.raw() >= Timestamp::max_commit_ts().raw() {
            return Err(TimestampError::CommitTsOverflow(ts.raw()));
        }
        self.counter.fetch_max(ts.raw() + 1, Ordering::SeqCst);
        Ok(())
    }
}

/// Issues begin/commit timestamps and begin-derived transaction ids.
///
/// All values come from one shared counter: commit order must be consistent
/// with real time or a reader could observe an effect without its cause.
/// The batched mode routes allocations through one of `lanes` queues, each
/// with a bounded wait; exceeding the wait fails the allocation with a
/// retriable [`TimestampError::AllocationTimeout`] instead of stalling the
/// caller indefinitely.
///
/// Constructed once and injected into the registry; there is no process-wide
/// singleton.
pub struct TimestampAuthority {
    counter: TimestampCounter,
    lanes: Option<Vec<Mutex<()>>>,
    cursor: AtomicUsize,
    wait: Duration,
}

impl TimestampAuthority {
    pub fn new(batched: bool, lanes: usize, wait: Duration) -> Self {
        let lanes = batched.then(|| (0..lanes.max(1)).map(|_| Mutex::new(())).collect());
        Self {
            counter: TimestampCounter::new(1),
            lanes,
            cursor: AtomicUsize::new(0),
            wait,
        }
    }

    fn alloc(&self) -> Result<Timestamp, TimestampError> {
        match &self.lanes {
            None => self.counter.next(),
            Some(lanes) => {
                let lane_idx = self.cursor.fetch_add(1, Ordering::Relaxed) % lanes.len();
                let _lane = lanes[lane_idx]
                    .try_lock_for(self.wait)
                    .ok_or(TimestampError::AllocationTimeout(self.wait))?;
                self.counter.next()
            }
        }
    }

    /// Allocate a begin timestamp and the transaction id derived from it.
    pub fn begin_pair(&self) -> Result<(TxnId, Timestamp), TimestampError> {
        let begin_ts = self.alloc()?;
        Ok((begin_ts.as_txn_id(), begin_ts))
    }

    /// Allocate the next timestamp. Strictly greater than every previously
    /// issued begin/commit timestamp.
    pub fn next_ts(&self) -> Result<Timestamp, TimestampError> {
        self.alloc()
    }

    /// Get the current timestamp without incrementing.
    pub fn current_ts(&self) -> Timestamp {
        self.counter.current()
    }

    /// Fast-forward the counter past `ts`, e.g. when adopting state recovered
    /// from the registry store.
    pub fn observe_ts(&self, ts: Timestamp) -> Result<(), TimestampError> {
        self.counter.update_if_greater(ts)
    }
}

impl Default for TimestampAuthority {
    fn default() -> Self {
        Self::new(false, 1, Duration::from_secs(2))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_timestamp_txn_id_detection() {
        let commit_ts = Timestamp::with_ts(100);
        assert!(commit_ts.is_commit_ts());
        assert!(!commit_ts.is_txn_id());

        let txn_id = Timestamp::with_ts(Timestamp::TXN_ID_START + 100);
        assert!(!txn_id.is_commit_ts());
        assert!(txn_id.is_txn_id());
    }

    #[test]
    fn test_txn_id_round_trips_to_begin_ts() {
        let begin_ts = Timestamp::with_ts(42);
        let id = begin_ts.as_txn_id();
        assert!(id.is_txn_id());
        assert_eq!(id.as_begin_ts(), begin_ts);
    }

    #[test]
    fn test_timestamps_monotonic() {
        let authority = TimestampAuthority::default();
        let ts1 = authority.next_ts().unwrap();
        let (id, begin) = authority.begin_pair().unwrap();
        let ts2 = authority.next_ts().unwrap();
        assert!(begin > ts1);
        assert!(ts2 > begin);
        assert_eq!(id.as_begin_ts(), begin);
    }

    #[test]
    fn test_concurrent_begins_unique() {
        let authority = Arc::new(TimestampAuthority::new(true, 4, Duration::from_secs(2)));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let authority = authority.clone();
            handles.push(thread::spawn(move || {
                (0..100)
                    .map(|_| authority.begin_pair().unwrap().0)
                    .collect::<Vec<_>>()
            }));
        }
        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        assert!(all.iter().all(|id| id.is_txn_id()));
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 400);
    }

    #[test]
    fn test_observe_ts_fast_forwards() {
        let authority = TimestampAuthority::default();
        authority.observe_ts(Timestamp::with_ts(100)).unwrap();
        assert!(authority.next_ts().unwrap().raw() > 100);

        // Observing a smaller value must not move the counter backwards.
        authority.observe_ts(Timestamp::with_ts(50)).unwrap();
        assert!(authority.next_ts().unwrap().raw() > 100);
    }

    #[test]
    fn test_observe_rejects_wrong_domain() {
        let authority = TimestampAuthority::default();
        let txn_id = Timestamp::with_ts(Timestamp::TXN_ID_START + 7);
        assert!(matches!(
            authority.observe_ts(txn_id),
            Err(TimestampError::WrongDomainCommit(_))
        ));
    }
}
