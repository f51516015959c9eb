//! The engine facade.
//!
//! [`SiEngine`] wires the registry, the versioned store, the rollforward
//! workers and the keep-alive monitor together behind the operations an
//! embedding query layer consumes: begin/commit/rollback, conflict-checked
//! writes, snapshot reads and scans, and resolution hand-off.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sitx_common::types::{CellValue, RowKey, TableId};
use sitx_txn::timestamp::{Timestamp, TxnId};
use sitx_txn::transaction::{IsolationLevel, TxnRecord};

use crate::config::SiConfig;
use crate::conflict;
use crate::error::{SiResult, TransactionError};
use crate::keepalive::KeepAliveMonitor;
use crate::record_store::{MemRecordStore, TxnRecordStore};
use crate::registry::TransactionRegistry;
use crate::rollforward::{ReadResolver, ResolutionStats, RollforwardLadder, resolve_for_compaction};
use crate::store::{CellVersion, MemStore, VersionedStore};
use crate::visibility;

pub struct SiEngine {
    config: SiConfig,
    registry: Arc<TransactionRegistry>,
    store: Arc<dyn VersionedStore>,
    read_resolver: ReadResolver,
    rollforward: RollforwardLadder,
    keep_alive: KeepAliveMonitor,
    /// Rows written per active transaction, handed to the rollforward
    /// ladder on commit.
    write_sets: DashMap<TxnId, Vec<RowKey>>,
}

impl SiEngine {
    pub fn new(
        config: SiConfig,
        store: Arc<dyn VersionedStore>,
        records: Arc<dyn TxnRecordStore>,
    ) -> Self {
        let registry = Arc::new(TransactionRegistry::new(&config, records));
        let read_resolver = ReadResolver::start(registry.clone(), store.clone(), &config);
        let rollforward = RollforwardLadder::start(registry.clone(), store.clone(), &config);
        let keep_alive = KeepAliveMonitor::start(registry.clone(), &config);
        Self {
            config,
            registry,
            store,
            read_resolver,
            rollforward,
            keep_alive,
            write_sets: DashMap::new(),
        }
    }

    /// An engine over in-memory stores; the deterministic-test construction.
    pub fn in_memory(config: SiConfig) -> Self {
        Self::new(
            config,
            Arc::new(MemStore::new()),
            Arc::new(MemRecordStore::new()),
        )
    }

    pub fn registry(&self) -> &Arc<TransactionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn VersionedStore> {
        &self.store
    }

    /// Begin a plain root transaction.
    pub fn begin(&self) -> SiResult<TxnRecord> {
        self.begin_with(false, Vec::new())
    }

    pub fn begin_with(&self, additive: bool, tables: Vec<TableId>) -> SiResult<TxnRecord> {
        let record = self
            .registry
            .begin(additive, IsolationLevel::SnapshotIsolation, tables)?;
        self.keep_alive.register(record.id);
        Ok(record)
    }

    pub fn begin_child(&self, parent: TxnId, additive: bool) -> SiResult<TxnRecord> {
        let record = self.registry.begin_child(
            parent,
            additive,
            IsolationLevel::SnapshotIsolation,
            Vec::new(),
        )?;
        self.keep_alive.register(record.id);
        Ok(record)
    }

    /// Stop heartbeating a transaction without ending it, e.g. when handing
    /// ownership to another process. Its record goes stale after the
    /// configured timeout.
    pub fn detach(&self, txn: TxnId) {
        self.keep_alive.unregister(txn);
    }

    pub fn keep_alive(&self, txn: TxnId) -> SiResult<()> {
        self.registry.keep_alive(txn)
    }

    fn active_record(&self, txn: TxnId) -> SiResult<TxnRecord> {
        let record = self
            .registry
            .lookup(txn)?
            .ok_or(TransactionError::UnknownTransaction(txn))?;
        if !record.is_active() {
            return Err(TransactionError::InvalidState {
                id: txn,
                reason: format!("expected an active transaction, found {:?}", record.state),
            }
            .into());
        }
        // A transaction that outlived its heartbeat may already have been
        // rolled back by a conflicting writer; refuse further work on it.
        if self.registry.is_timed_out(&record) {
            return Err(TransactionError::Timeout(txn).into());
        }
        Ok(record)
    }

    /// Write a value under `txn`. Runs the write-write conflict check
    /// atomically with the insert, under the store's row lock.
    pub fn write(&self, txn: TxnId, row: &RowKey, value: CellValue) -> SiResult<()> {
        self.write_version(txn, row, Some(value))
    }

    /// Delete a row under `txn` (a tombstone version).
    pub fn delete(&self, txn: TxnId, row: &RowKey) -> SiResult<()> {
        self.write_version(txn, row, None)
    }

    fn write_version(&self, txn: TxnId, row: &RowKey, value: Option<CellValue>) -> SiResult<()> {
        let record = self.active_record(txn)?;
        let registry = &self.registry;
        self.store.put_checked(
            row,
            CellVersion::new(txn, value),
            &|prior| conflict::check_write(registry, &record, row, prior),
        )?;
        self.write_sets.entry(txn).or_default().push(row.clone());
        Ok(())
    }

    /// The conflict check alone, without writing.
    pub fn check_write(&self, txn: TxnId, row: &RowKey) -> SiResult<()> {
        let record = self.active_record(txn)?;
        let prior = self.store.row_versions(row);
        conflict::check_write(&self.registry, &record, row, &prior)
    }

    /// Snapshot read of `row` under `txn`. `None` means the row is absent
    /// in this transaction's view (never written, tombstoned, or written
    /// only by transactions invisible to it).
    pub fn read(&self, txn: TxnId, row: &RowKey) -> SiResult<Option<CellValue>> {
        let reader = self.active_record(txn)?;
        let versions = self.store.row_versions(row);
        let winner = visibility::visible_version(&self.registry, &reader, &versions)?;
        self.submit_unresolved(txn, row, &versions);
        Ok(winner.and_then(|version| version.value().cloned()))
    }

    /// Snapshot scan over `[start, end)` under `txn`, returning visible,
    /// non-tombstoned rows in key order.
    pub fn scan(
        &self,
        txn: TxnId,
        start: &RowKey,
        end: &RowKey,
    ) -> SiResult<Vec<(RowKey, CellValue)>> {
        let reader = self.active_record(txn)?;
        let mut rows = Vec::new();
        for (key, versions) in self.store.scan(start, end) {
            let winner = visibility::visible_version(&self.registry, &reader, &versions)?;
            self.submit_unresolved(txn, &key, &versions);
            if let Some(value) = winner.and_then(|version| version.value().cloned()) {
                rows.push((key, value));
            }
        }
        Ok(rows)
    }

    /// Whether `writer`'s version of `row` is visible to `reader`.
    pub fn is_visible(&self, reader: TxnId, row: &RowKey, writer: TxnId) -> SiResult<bool> {
        let reader = self.active_record(reader)?;
        let versions = self.store.row_versions(row);
        match versions.iter().find(|v| v.writer() == writer) {
            Some(version) => visibility::is_visible(&self.registry, &reader, version),
            None => Ok(false),
        }
    }

    /// Hand unresolved cells to the lazy read resolver. Best effort.
    fn submit_unresolved(&self, reader: TxnId, row: &RowKey, versions: &[CellVersion]) {
        for version in versions {
            if !version.is_resolved() && version.writer() != reader {
                self.read_resolver.submit(row.clone(), version.writer());
            }
        }
    }

    /// Explicit resolution hand-off, used by the storage/compaction layer.
    pub fn submit_for_resolution(&self, rows: &[RowKey], txn: TxnId) {
        for row in rows {
            self.read_resolver.submit(row.clone(), txn);
        }
    }

    /// Commit `txn` (cascading over its active children) and queue its rows
    /// for rollforward.
    pub fn commit(&self, txn: TxnId) -> SiResult<Timestamp> {
        let (commit_ts, committed) = self.registry.commit(txn)?;
        for id in committed {
            self.keep_alive.unregister(id);
            if let Some((_, rows)) = self.write_sets.remove(&id) {
                self.rollforward.enqueue(rows, id);
            }
        }
        Ok(commit_ts)
    }

    /// Roll back `txn` and every active descendant. Their versions are left
    /// to the read resolver and compaction to purge.
    pub fn rollback(&self, txn: TxnId) -> SiResult<()> {
        let rolled_back = self.registry.rollback(txn)?;
        for id in rolled_back {
            self.keep_alive.unregister(id);
            self.write_sets.remove(&id);
        }
        Ok(())
    }

    /// Eager resolution pass over the store, sized for one compaction cycle
    /// with `pass_budget` of wall-clock budget.
    pub fn compact(&self, pass_budget: Duration) -> SiResult<ResolutionStats> {
        let rows = self.store.row_keys();
        resolve_for_compaction(
            &self.registry,
            self.store.as_ref(),
            &rows,
            pass_budget,
            &self.config,
        )
    }

    /// Stop the background workers. Called automatically on drop.
    pub fn shutdown(&mut self) {
        self.read_resolver.shutdown();
        self.rollforward.shutdown();
        self.keep_alive.shutdown();
    }
}
