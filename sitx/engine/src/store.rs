//! Versioned key-value store abstraction.
//!
//! The engine never asks the store for more than per-row multi-version
//! reads, atomic per-row writes and the two rollforward primitives
//! ([`VersionedStore::resolve`] and [`VersionedStore::purge`]). Everything
//! else - atomicity across rows, isolation - is layered on top by protocol.
//! [`MemStore`] is the in-memory implementation used for deterministic
//! testing and embedding.

use std::collections::BTreeMap;

use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use sitx_common::types::{CellValue, RowKey};
use sitx_txn::timestamp::{Timestamp, TxnId};

use crate::error::{SiResult, StoreError};

/// One version of a row's cell.
///
/// A freshly written version is stamped with its writer's transaction id;
/// the rollforward engine later rewrites the stamp to the writer's resolved
/// commit timestamp. Readers never mutate versions.
#[derive(Debug, Clone, PartialEq)]
pub struct CellVersion {
    writer: TxnId,
    stamp: Timestamp,
    value: Option<CellValue>,
}

impl CellVersion {
    /// A new, unresolved version: the stamp is the writer id itself.
    pub fn new(writer: TxnId, value: Option<CellValue>) -> Self {
        Self {
            writer,
            stamp: writer,
            value,
        }
    }

    pub fn writer(&self) -> TxnId {
        self.writer
    }

    pub fn stamp(&self) -> Timestamp {
        self.stamp
    }

    /// Whether the stamp has been rewritten to a commit timestamp.
    pub fn is_resolved(&self) -> bool {
        self.stamp.is_commit_ts()
    }

    /// `None` is a tombstone.
    pub fn value(&self) -> Option<&CellValue> {
        self.value.as_ref()
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Contract the engine requires from the underlying versioned store.
///
/// Implementations must make each row-level operation atomic; nothing here
/// spans rows.
pub trait VersionedStore: Send + Sync {
    /// Append (or, for a repeated write by the same transaction, replace)
    /// a version of `row`, unconditionally.
    fn put(&self, row: &RowKey, version: CellVersion) -> Result<(), StoreError>;

    /// Atomic conditional write: run `check` against the row's current
    /// versions (most recent writer first) under the row lock, and insert
    /// `version` only if it passes. This is the single-row primitive the
    /// conflict detector builds on.
    fn put_checked(
        &self,
        row: &RowKey,
        version: CellVersion,
        check: &dyn Fn(&[CellVersion]) -> SiResult<()>,
    ) -> SiResult<()>;

    /// All versions of `row`, most recent writer first.
    fn row_versions(&self, row: &RowKey) -> Vec<CellVersion>;

    /// Rows in `[start, end)` that carry at least one version, in key order,
    /// each with its versions most recent writer first.
    fn scan(&self, start: &RowKey, end: &RowKey) -> Vec<(RowKey, Vec<CellVersion>)>;

    /// Rewrite the stamp of `writer`'s version of `row` to `commit_ts`.
    /// Idempotent; returns whether anything changed.
    fn resolve(&self, row: &RowKey, writer: TxnId, commit_ts: Timestamp) -> bool;

    /// Physically remove `writer`'s version of `row` (tombstone elision for
    /// rolled-back transactions). Returns whether anything was removed.
    fn purge(&self, row: &RowKey, writer: TxnId) -> bool;

    /// Keys of every row currently holding versions. Drives compaction.
    fn row_keys(&self) -> Vec<RowKey>;
}

struct RowEntry {
    versions: RwLock<BTreeMap<TxnId, CellVersion>>,
}

/// In-memory [`VersionedStore`] over a lock-free ordered row map with
/// per-row version locks.
pub struct MemStore {
    rows: SkipMap<RowKey, RowEntry>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self {
            rows: SkipMap::new(),
        }
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn versions_desc(versions: &BTreeMap<TxnId, CellVersion>) -> Vec<CellVersion> {
    versions.values().rev().cloned().collect()
}

impl VersionedStore for MemStore {
    fn put(&self, row: &RowKey, version: CellVersion) -> Result<(), StoreError> {
        let entry = self.rows.get_or_insert_with(row.clone(), || RowEntry {
            versions: RwLock::new(BTreeMap::new()),
        });
        let mut versions = entry.value().versions.write();
        versions.insert(version.writer(), version);
        Ok(())
    }

    fn put_checked(
        &self,
        row: &RowKey,
        version: CellVersion,
        check: &dyn Fn(&[CellVersion]) -> SiResult<()>,
    ) -> SiResult<()> {
        let entry = self.rows.get_or_insert_with(row.clone(), || RowEntry {
            versions: RwLock::new(BTreeMap::new()),
        });
        let mut versions = entry.value().versions.write();
        check(&versions_desc(&versions))?;
        versions.insert(version.writer(), version);
        Ok(())
    }

    fn row_versions(&self, row: &RowKey) -> Vec<CellVersion> {
        self.rows
            .get(row)
            .map(|entry| versions_desc(&entry.value().versions.read()))
            .unwrap_or_default()
    }

    fn scan(&self, start: &RowKey, end: &RowKey) -> Vec<(RowKey, Vec<CellVersion>)> {
        self.rows
            .range(start.clone()..end.clone())
            .filter_map(|entry| {
                let versions = versions_desc(&entry.value().versions.read());
                (!versions.is_empty()).then(|| (entry.key().clone(), versions))
            })
            .collect()
    }

    fn resolve(&self, row: &RowKey, writer: TxnId, commit_ts: Timestamp) -> bool {
        let Some(entry) = self.rows.get(row) else {
            return false;
        };
        let mut versions = entry.value().versions.write();
        match versions.get_mut(&writer) {
            Some(version) if !version.is_resolved() => {
                version.stamp = commit_ts;
                true
            }
            _ => false,
        }
    }

    fn purge(&self, row: &RowKey, writer: TxnId) -> bool {
        let Some(entry) = self.rows.get(row) else {
            return false;
        };
        entry.value().versions.write().remove(&writer).is_some()
    }

    fn row_keys(&self) -> Vec<RowKey> {
        self.rows.iter().map(|entry| entry.key().clone()).collect()
    }
}
