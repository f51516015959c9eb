//! Transaction records and related types.
//!
//! A transaction is plain tagged data: one [`TxnRecord`] per transaction,
//! with parent/child relationships stored as id references. Lifecycle and
//! visibility algorithms live in the engine crate and operate over record
//! snapshots, not over a type hierarchy.

use serde::{Deserialize, Serialize};
use sitx_common::types::TableId;

use crate::timestamp::{Timestamp, TxnId};

/// Isolation level of a transaction. Only snapshot isolation is implemented;
/// the enum leaves room for stronger levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Snapshot isolation - reads see a consistent snapshot fixed at begin
    SnapshotIsolation,
}

/// Lifecycle state of a transaction.
///
/// The only legal transitions are `Active -> Committed`,
/// `Active -> RolledBack` and `Active -> Error`; every non-active state is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    Active,
    Committed,
    RolledBack,
    Error,
}

impl TxnState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxnState::Active)
    }
}

/// Durable metadata of a single transaction, as held by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnRecord {
    /// Globally unique identifier, also the unresolved cell stamp.
    pub id: TxnId,
    /// Parent transaction, absent for a root.
    pub parent: Option<TxnId>,
    /// Snapshot cut of this transaction.
    pub begin_ts: Timestamp,
    /// Set exactly once, on commit.
    pub commit_ts: Option<Timestamp>,
    /// Commit timestamp of the transitive root, defined only once the whole
    /// ancestor chain has committed. Resolved lazily.
    pub global_commit_ts: Option<Timestamp>,
    pub state: TxnState,
    pub isolation: IsolationLevel,
    /// Additive transactions tolerate concurrent same-parent additive
    /// writers on the same row, and are mutually blind to each other.
    pub additive: bool,
    /// Last liveness heartbeat, epoch milliseconds.
    pub keep_alive_ts: i64,
    /// Tables this transaction intends to write; a scoping hint only.
    pub destination_tables: Vec<TableId>,
}

impl TxnRecord {
    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    pub fn is_committed(&self) -> bool {
        self.state == TxnState::Committed
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Whether the heartbeat is stale: no refresh for longer than
    /// `timeout_ms` as of `now_ms`.
    pub fn is_keep_alive_expired(&self, now_ms: i64, timeout_ms: i64) -> bool {
        self.is_active() && now_ms.saturating_sub(self.keep_alive_ts) > timeout_ms
    }
}
