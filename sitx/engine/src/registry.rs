//! Shared transaction registry.
//!
//! Source of truth for every transaction's metadata and state. Mutation is
//! serialized per transaction through lock stripes keyed by id, so unrelated
//! transactions never contend. Two read-through caches sit in front of the
//! durable record store: a bounded active-transaction cache and a large
//! sharded LRU of completed transactions (completed records are immutable,
//! so they can be cached indefinitely).

use std::num::NonZeroUsize;
use std::sync::Arc;

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use sitx_common::types::TableId;
use sitx_txn::timestamp::{Timestamp, TimestampAuthority, TxnId};
use sitx_txn::transaction::{IsolationLevel, TxnRecord, TxnState};

use crate::config::{Durability, SiConfig};
use crate::error::{SiResult, TransactionError};
use crate::record_store::TxnRecordStore;

/// How two transactions relate in the transaction tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnRelation {
    Same,
    /// The first transaction is an ancestor of the second.
    FirstIsAncestor,
    /// The second transaction is an ancestor of the first.
    SecondIsAncestor,
    Unrelated,
}

/// Current time as epoch milliseconds; the heartbeat clock.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct TransactionRegistry {
    authority: TimestampAuthority,
    store: Arc<dyn TxnRecordStore>,
    /// Guards state transitions; indexed by `id & (stripes - 1)`.
    stripes: Vec<Mutex<()>>,
    /// Active-transaction cache. Bounded: past `active_cache_max`, begins
    /// skip the cache and lookups fall through to the store.
    active: DashMap<TxnId, TxnRecord>,
    /// Direct children by parent, kept while the parent is alive so commit
    /// and rollback can cascade.
    children: DashMap<TxnId, Vec<TxnId>>,
    /// Sharded completed-transaction cache.
    completed: Vec<Mutex<LruCache<TxnId, Arc<TxnRecord>>>>,
    durability: Durability,
    ignore_missing_txn: bool,
    active_cache_max: usize,
    transaction_timeout_ms: i64,
}

impl TransactionRegistry {
    pub fn new(config: &SiConfig, store: Arc<dyn TxnRecordStore>) -> Self {
        let stripe_count = config.stripe_count();
        let shard_count = config.completed_cache_concurrency.max(1);
        let shard_capacity = (config.completed_cache_size / shard_count).max(1);
        let shard_capacity = NonZeroUsize::new(shard_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            authority: TimestampAuthority::new(
                config.timestamp_batched,
                config.timestamp_lanes,
                config.timestamp_wait,
            ),
            store,
            stripes: (0..stripe_count).map(|_| Mutex::new(())).collect(),
            active: DashMap::with_capacity(config.active_cache_init),
            children: DashMap::new(),
            completed: (0..shard_count)
                .map(|_| Mutex::new(LruCache::new(shard_capacity)))
                .collect(),
            durability: config.durability,
            ignore_missing_txn: config.ignore_missing_txn,
            active_cache_max: config.active_cache_max,
            transaction_timeout_ms: config.transaction_timeout.as_millis() as i64,
        }
    }

    pub fn authority(&self) -> &TimestampAuthority {
        &self.authority
    }

    pub fn ignore_missing_txn(&self) -> bool {
        self.ignore_missing_txn
    }

    fn stripe(&self, id: TxnId) -> &Mutex<()> {
        &self.stripes[id.raw() as usize & (self.stripes.len() - 1)]
    }

    fn completed_shard(&self, id: TxnId) -> &Mutex<LruCache<TxnId, Arc<TxnRecord>>> {
        &self.completed[id.raw() as usize % self.completed.len()]
    }

    fn cache_completed(&self, record: TxnRecord) {
        let arc = Arc::new(record);
        self.completed_shard(arc.id).lock().put(arc.id, arc);
    }

    /// Begin a root transaction.
    pub fn begin(
        &self,
        additive: bool,
        isolation: IsolationLevel,
        tables: Vec<TableId>,
    ) -> SiResult<TxnRecord> {
        self.begin_inner(None, additive, isolation, tables)
    }

    /// Begin a child of `parent`. Fails unless the parent is still active.
    pub fn begin_child(
        &self,
        parent: TxnId,
        additive: bool,
        isolation: IsolationLevel,
        tables: Vec<TableId>,
    ) -> SiResult<TxnRecord> {
        self.begin_inner(Some(parent), additive, isolation, tables)
    }

    fn begin_inner(
        &self,
        parent: Option<TxnId>,
        additive: bool,
        isolation: IsolationLevel,
        tables: Vec<TableId>,
    ) -> SiResult<TxnRecord> {
        // Holding the parent's stripe keeps a concurrent parent commit from
        // racing past an in-flight child creation.
        let _parent_guard = match parent {
            Some(parent_id) => {
                let guard = self.stripe(parent_id).lock();
                let parent_record = self
                    .lookup(parent_id)?
                    .ok_or(TransactionError::UnknownTransaction(parent_id))?;
                if !parent_record.is_active() {
                    return Err(TransactionError::InvalidState {
                        id: parent_id,
                        reason: format!("cannot create child in state {:?}", parent_record.state),
                    }
                    .into());
                }
                Some(guard)
            }
            None => None,
        };

        let (id, begin_ts) = self
            .authority
            .begin_pair()
            .map_err(TransactionError::Timestamp)?;
        let record = TxnRecord {
            id,
            parent,
            begin_ts,
            commit_ts: None,
            global_commit_ts: None,
            state: TxnState::Active,
            isolation,
            additive,
            keep_alive_ts: now_ms(),
            destination_tables: tables,
        };

        // Fatal to the begin if the record cannot be made durable; nothing
        // has been published yet.
        self.store.save(&record, self.durability)?;

        if let Some(parent_id) = parent {
            self.children.entry(parent_id).or_default().push(id);
        }
        if self.active.len() < self.active_cache_max {
            self.active.insert(id, record.clone());
        }
        Ok(record)
    }

    /// Look up a transaction: active cache, then completed cache, then the
    /// record store (populating the right cache on the way back).
    pub fn lookup(&self, id: TxnId) -> SiResult<Option<TxnRecord>> {
        if let Some(record) = self.active.get(&id) {
            return Ok(Some(record.clone()));
        }
        if let Some(record) = self.completed_shard(id).lock().get(&id) {
            return Ok(Some((**record).clone()));
        }
        let Some(record) = self.store.load(id)? else {
            return Ok(None);
        };
        if record.state.is_terminal() {
            self.cache_completed(record.clone());
        } else if self.active.len() < self.active_cache_max {
            self.active.insert(id, record.clone());
        }
        Ok(Some(record))
    }

    pub fn is_active(&self, id: TxnId) -> SiResult<bool> {
        Ok(self
            .lookup(id)?
            .map(|record| record.is_active())
            .unwrap_or(false))
    }

    /// Refresh the liveness heartbeat of an active transaction. A heartbeat
    /// for a terminal transaction is a no-op.
    pub fn keep_alive(&self, id: TxnId) -> SiResult<()> {
        let _guard = self.stripe(id).lock();
        let Some(mut record) = self.lookup(id)? else {
            if self.ignore_missing_txn {
                return Ok(());
            }
            return Err(TransactionError::UnknownTransaction(id).into());
        };
        if !record.is_active() {
            return Ok(());
        }
        record.keep_alive_ts = now_ms();
        // Heartbeats are high-frequency and safe to lose; never wait on them.
        self.store.save(&record, Durability::None)?;
        if let Some(mut cached) = self.active.get_mut(&id) {
            cached.keep_alive_ts = record.keep_alive_ts;
        }
        Ok(())
    }

    /// Whether `record`'s heartbeat is stale beyond the configured timeout.
    pub fn is_timed_out(&self, record: &TxnRecord) -> bool {
        record.is_keep_alive_expired(now_ms(), self.transaction_timeout_ms)
    }

    fn active_children(&self, id: TxnId) -> SiResult<Vec<TxnId>> {
        let Some(child_ids) = self.children.get(&id).map(|c| c.value().clone()) else {
            return Ok(Vec::new());
        };
        let mut active = Vec::new();
        for child_id in child_ids {
            if self.is_active(child_id)? {
                active.push(child_id);
            }
        }
        Ok(active)
    }

    /// Commit a transaction. Active children are committed first,
    /// depth-first, so the chain never holds a committed parent above an
    /// active child. The root's commit timestamp becomes the chain's global
    /// commit timestamp; inner nodes resolve theirs lazily.
    ///
    /// Returns the transaction's commit timestamp and every id the cascade
    /// committed, descendants first.
    pub fn commit(&self, id: TxnId) -> SiResult<(Timestamp, Vec<TxnId>)> {
        let mut committed = Vec::new();
        let commit_ts = self.commit_inner(id, &mut committed)?;
        Ok((commit_ts, committed))
    }

    fn commit_inner(&self, id: TxnId, committed: &mut Vec<TxnId>) -> SiResult<Timestamp> {
        loop {
            let children = self.active_children(id)?;
            for child_id in &children {
                self.commit_inner(*child_id, committed)?;
            }

            let guard = self.stripe(id).lock();
            // A child begun between the cascade and taking the stripe is
            // committed on the next pass.
            if !self.active_children(id)?.is_empty() {
                drop(guard);
                continue;
            }

            let Some(mut record) = self.lookup(id)? else {
                return Err(TransactionError::UnknownTransaction(id).into());
            };
            if !record.is_active() {
                return Err(TransactionError::InvalidState {
                    id,
                    reason: format!("cannot commit in state {:?}", record.state),
                }
                .into());
            }

            let commit_ts = self
                .authority
                .next_ts()
                .map_err(TransactionError::Timestamp)?;
            record.state = TxnState::Committed;
            record.commit_ts = Some(commit_ts);
            if record.is_root() {
                record.global_commit_ts = Some(commit_ts);
            }
            self.store.save(&record, self.durability)?;
            self.finish(record);
            committed.push(id);
            return Ok(commit_ts);
        }
    }

    /// Roll back a transaction and every active descendant. Committed
    /// descendants keep their local state; their effects die with the chain
    /// because their global commit timestamp can never resolve.
    ///
    /// Returns every id the cascade transitioned, descendants first.
    pub fn rollback(&self, id: TxnId) -> SiResult<Vec<TxnId>> {
        let mut terminated = Vec::new();
        self.terminate(id, TxnState::RolledBack, &mut terminated)?;
        Ok(terminated)
    }

    /// Mark a transaction failed. Same cascade semantics as rollback.
    pub fn mark_error(&self, id: TxnId) -> SiResult<Vec<TxnId>> {
        let mut terminated = Vec::new();
        self.terminate(id, TxnState::Error, &mut terminated)?;
        Ok(terminated)
    }

    fn terminate(
        &self,
        id: TxnId,
        target: TxnState,
        terminated: &mut Vec<TxnId>,
    ) -> SiResult<()> {
        loop {
            let children = self.active_children(id)?;
            for child_id in &children {
                self.terminate(*child_id, target, terminated)?;
            }

            let guard = self.stripe(id).lock();
            if !self.active_children(id)?.is_empty() {
                drop(guard);
                continue;
            }

            let Some(mut record) = self.lookup(id)? else {
                if self.ignore_missing_txn {
                    return Ok(());
                }
                return Err(TransactionError::UnknownTransaction(id).into());
            };
            if !record.is_active() {
                return Err(TransactionError::InvalidState {
                    id,
                    reason: format!("cannot roll back in state {:?}", record.state),
                }
                .into());
            }

            record.state = target;
            self.store.save(&record, self.durability)?;
            self.finish(record);
            terminated.push(id);
            return Ok(());
        }
    }

    /// Move a freshly terminal record out of the active set.
    fn finish(&self, record: TxnRecord) {
        self.active.remove(&record.id);
        self.children.remove(&record.id);
        self.cache_completed(record);
    }

    /// The chain-wide commit timestamp: the root's commit timestamp, defined
    /// only once every ancestor up to the root has committed. Memoized into
    /// the completed cache on first resolution.
    pub fn global_commit_ts(&self, record: &TxnRecord) -> SiResult<Option<Timestamp>> {
        if let Some(ts) = record.global_commit_ts {
            return Ok(Some(ts));
        }
        if !record.is_committed() {
            return Ok(None);
        }

        let mut cursor = record.clone();
        while let Some(parent_id) = cursor.parent {
            let Some(parent) = self.lookup(parent_id)? else {
                if self.ignore_missing_txn {
                    return Ok(None);
                }
                return Err(TransactionError::UnknownTransaction(parent_id).into());
            };
            if !parent.is_committed() {
                return Ok(None);
            }
            cursor = parent;
        }

        let global = cursor.commit_ts;
        if let Some(ts) = global {
            let mut memoized = record.clone();
            memoized.global_commit_ts = Some(ts);
            self.cache_completed(memoized);
        }
        Ok(global)
    }

    /// Whether `ancestor` appears in `record`'s ancestor chain.
    pub fn is_ancestor(&self, ancestor: TxnId, record: &TxnRecord) -> SiResult<bool> {
        let mut cursor = record.parent;
        while let Some(parent_id) = cursor {
            if parent_id == ancestor {
                return Ok(true);
            }
            let Some(parent) = self.lookup(parent_id)? else {
                if self.ignore_missing_txn {
                    return Ok(false);
                }
                return Err(TransactionError::UnknownTransaction(parent_id).into());
            };
            cursor = parent.parent;
        }
        Ok(false)
    }

    /// Relation of two transactions in the transaction tree.
    pub fn relation(&self, a: &TxnRecord, b: &TxnRecord) -> SiResult<TxnRelation> {
        if a.id == b.id {
            return Ok(TxnRelation::Same);
        }
        if self.is_ancestor(a.id, b)? {
            return Ok(TxnRelation::FirstIsAncestor);
        }
        if self.is_ancestor(b.id, a)? {
            return Ok(TxnRelation::SecondIsAncestor);
        }
        Ok(TxnRelation::Unrelated)
    }

    /// Additive transactions tolerate each other only under the same direct
    /// parent; this is deliberately narrow so unrelated write streams still
    /// conflict.
    pub fn additive_siblings(a: &TxnRecord, b: &TxnRecord) -> bool {
        a.additive
            && b.additive
            && a.parent.is_some()
            && a.parent == b.parent
    }
}
