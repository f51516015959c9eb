//! Rollforward: asynchronous rewriting of transaction-id cell stamps into
//! resolved commit timestamps.
//!
//! Three complementary paths share one primitive, [`resolve_version`]:
//!
//! - the **read resolver**: readers hand unresolved cells to a bounded queue
//!   served by a small worker pool; a full queue drops the submission,
//! - the **staged ladder**: freshly committed writes are resolved after a
//!   short wait by many workers, stragglers whose chain has not finished
//!   committing are retried by a slow lane with few workers,
//! - **compaction-time resolution**: [`resolve_for_compaction`] runs inline
//!   in a compaction pass under a time budget, purging rolled-back versions
//!   as it goes.
//!
//! None of this is required for correctness: until a cell is resolved,
//! every read re-evaluates visibility against the registry. Resolution only
//! trades registry lookups for a one-time stamp rewrite.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use sitx_common::types::RowKey;
use sitx_txn::timestamp::TxnId;
use tracing::{debug, warn};

use crate::config::SiConfig;
use crate::error::SiResult;
use crate::keepalive::sleep_until;
use crate::registry::TransactionRegistry;
use crate::store::VersionedStore;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of a single resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// Stamp rewritten to the chain-wide commit timestamp.
    Resolved,
    /// Version belonged to a rolled-back or errored transaction and was
    /// physically removed.
    Purged,
    /// The transaction (or its chain) has not finished committing; try
    /// again later.
    Pending,
    /// Nothing to do: version already resolved, gone, or writer unknown
    /// with `ignore_missing_txn` set.
    Skipped,
}

/// Attempt to resolve `writer`'s version of `row`. Idempotent.
pub(crate) fn resolve_version(
    registry: &TransactionRegistry,
    store: &dyn VersionedStore,
    row: &RowKey,
    writer: TxnId,
) -> SiResult<Resolution> {
    let Some(record) = registry.lookup(writer)? else {
        if registry.ignore_missing_txn() {
            return Ok(Resolution::Skipped);
        }
        return Err(crate::error::TransactionError::UnknownTransaction(writer).into());
    };

    if record.is_active() {
        return Ok(Resolution::Pending);
    }
    if !record.is_committed() {
        return Ok(if store.purge(row, writer) {
            Resolution::Purged
        } else {
            Resolution::Skipped
        });
    }

    match registry.global_commit_ts(&record)? {
        Some(global) => Ok(if store.resolve(row, writer, global) {
            Resolution::Resolved
        } else {
            Resolution::Skipped
        }),
        // Locally committed, but the chain is not: not resolvable yet. If an
        // ancestor ends up rolled back this stays pending forever and the
        // version dies at compaction instead.
        None => Ok(Resolution::Pending),
    }
}

struct ResolveTask {
    row: RowKey,
    writer: TxnId,
}

/// Lazy read-resolution worker pool. Best effort: a full queue drops the
/// submission and the cell simply stays unresolved until the next reader or
/// compaction pass.
pub struct ReadResolver {
    queue: Option<SyncSender<ResolveTask>>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl ReadResolver {
    pub fn start(
        registry: Arc<TransactionRegistry>,
        store: Arc<dyn VersionedStore>,
        config: &SiConfig,
    ) -> Self {
        let (tx, rx) = sync_channel::<ResolveTask>(config.read_resolver_queue_size.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let shutdown = Arc::new(AtomicBool::new(false));

        let workers = (0..config.read_resolver_threads.max(1))
            .map(|_| {
                let registry = registry.clone();
                let store = store.clone();
                let rx = rx.clone();
                let shutdown = shutdown.clone();
                thread::spawn(move || {
                    while let Some(task) = next_task(&rx, &shutdown) {
                        match resolve_version(&registry, store.as_ref(), &task.row, task.writer) {
                            Ok(_) => {}
                            Err(e) => {
                                debug!(
                                    row = %task.row,
                                    txn = task.writer.raw(),
                                    error = %e,
                                    "read resolution failed"
                                );
                            }
                        }
                    }
                })
            })
            .collect();

        Self {
            queue: Some(tx),
            shutdown,
            workers,
        }
    }

    /// Submit a cell for resolution. Returns false if the submission was
    /// dropped (full queue or shutdown).
    pub fn submit(&self, row: RowKey, writer: TxnId) -> bool {
        let Some(queue) = &self.queue else {
            return false;
        };
        match queue.try_send(ResolveTask { row, writer }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.queue = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ReadResolver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct LadderTask {
    row: RowKey,
    writer: TxnId,
    not_before: Instant,
    attempts: u32,
}

/// Two-stage rollforward retry ladder for freshly committed transactions.
pub struct RollforwardLadder {
    first: Option<SyncSender<LadderTask>>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    first_wait: Duration,
}

impl RollforwardLadder {
    pub fn start(
        registry: Arc<TransactionRegistry>,
        store: Arc<dyn VersionedStore>,
        config: &SiConfig,
    ) -> Self {
        let capacity = config.rollforward_queue_size.max(1);
        let (first_tx, first_rx) = sync_channel::<LadderTask>(capacity);
        let (second_tx, second_rx) = sync_channel::<LadderTask>(capacity);
        let first_rx = Arc::new(Mutex::new(first_rx));
        let second_rx = Arc::new(Mutex::new(second_rx));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::new();

        // Fast lane: many workers, short wait, one attempt. Anything not
        // yet resolvable is demoted to the slow lane.
        for _ in 0..config.rollforward_first_threads.max(1) {
            let registry = registry.clone();
            let store = store.clone();
            let rx = first_rx.clone();
            let second = second_tx.clone();
            let shutdown = shutdown.clone();
            let second_wait = config.rollforward_second_wait;
            workers.push(thread::spawn(move || {
                while let Some(task) = next_task(&rx, &shutdown) {
                    if !sleep_until(task.not_before, &shutdown) {
                        return;
                    }
                    match resolve_version(&registry, store.as_ref(), &task.row, task.writer) {
                        Ok(Resolution::Pending) | Err(_) => {
                            let demoted = LadderTask {
                                not_before: Instant::now() + second_wait,
                                attempts: 0,
                                ..task
                            };
                            if second.try_send(demoted).is_err() {
                                debug!("rollforward slow lane full, dropping row");
                            }
                        }
                        Ok(_) => {}
                    }
                }
            }));
        }

        // Slow lane: few workers, long wait, bounded retries.
        for _ in 0..config.rollforward_second_threads.max(1) {
            let registry = registry.clone();
            let store = store.clone();
            let rx = second_rx.clone();
            let retry = second_tx.clone();
            let shutdown = shutdown.clone();
            let second_wait = config.rollforward_second_wait;
            let retries = config.rollforward_retries;
            workers.push(thread::spawn(move || {
                while let Some(task) = next_task(&rx, &shutdown) {
                    if !sleep_until(task.not_before, &shutdown) {
                        return;
                    }
                    match resolve_version(&registry, store.as_ref(), &task.row, task.writer) {
                        Ok(Resolution::Pending) | Err(_) => {
                            if task.attempts + 1 >= retries {
                                warn!(
                                    row = %task.row,
                                    txn = task.writer.raw(),
                                    "giving up on rollforward after retries"
                                );
                                continue;
                            }
                            let again = LadderTask {
                                not_before: Instant::now() + second_wait,
                                attempts: task.attempts + 1,
                                ..task
                            };
                            let _ = retry.try_send(again);
                        }
                        Ok(_) => {}
                    }
                }
            }));
        }

        Self {
            first: Some(first_tx),
            shutdown,
            workers,
            first_wait: config.rollforward_first_wait,
        }
    }

    /// Queue a committed transaction's rows for resolution. Best effort.
    pub fn enqueue(&self, rows: impl IntoIterator<Item = RowKey>, writer: TxnId) {
        let Some(first) = &self.first else {
            return;
        };
        let not_before = Instant::now() + self.first_wait;
        for row in rows {
            let task = LadderTask {
                row,
                writer,
                not_before,
                attempts: 0,
            };
            if first.try_send(task).is_err() {
                debug!("rollforward fast lane full, dropping row");
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.first = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for RollforwardLadder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Block on the shared receiver until a task arrives, the channel closes or
/// shutdown is requested.
fn next_task<T>(rx: &Arc<Mutex<Receiver<T>>>, shutdown: &AtomicBool) -> Option<T> {
    loop {
        if shutdown.load(Ordering::Acquire) {
            return None;
        }
        let result = {
            let rx = rx.lock().expect("resolver queue poisoned");
            rx.recv_timeout(POLL_INTERVAL)
        };
        match result {
            Ok(task) => return Some(task),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

/// Counters for one eager resolution pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionStats {
    pub examined: usize,
    pub resolved: usize,
    pub purged: usize,
}

/// Eager, compaction-time resolution: while the storage layer compacts
/// `rows`, rewrite committed stamps in place and purge versions of
/// rolled-back transactions. Bounded by the configured row buffer and by
/// `flush_resolution_share` of `pass_budget`.
pub fn resolve_for_compaction(
    registry: &TransactionRegistry,
    store: &dyn VersionedStore,
    rows: &[RowKey],
    pass_budget: Duration,
    config: &SiConfig,
) -> SiResult<ResolutionStats> {
    let share = config.flush_resolution_share.clamp(0.0, 1.0);
    let deadline = Instant::now() + pass_budget.mul_f64(share);
    let mut stats = ResolutionStats::default();

    for row in rows.iter().take(config.compaction_resolution_buffer_size) {
        for version in store.row_versions(row) {
            if version.is_resolved() {
                continue;
            }
            if Instant::now() >= deadline {
                return Ok(stats);
            }
            stats.examined += 1;
            match resolve_version(registry, store, row, version.writer())? {
                Resolution::Resolved => stats.resolved += 1,
                Resolution::Purged => stats.purged += 1,
                Resolution::Pending | Resolution::Skipped => {}
            }
        }
    }
    Ok(stats)
}
