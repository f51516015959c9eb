//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Whether a registry write waits for durable persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Durability {
    /// Fire and forget.
    None,
    /// Hand the write to the store's buffer, do not wait for the flush.
    Async,
    /// Wait until the record is durable before acknowledging.
    Sync,
}

/// Tunables of the transaction engine. An embedder typically deserializes
/// this from its own configuration file; every field has a production
/// default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiConfig {
    /// Completed-transaction cache capacity. Completed records are immutable
    /// and safe to cache indefinitely.
    pub completed_cache_size: usize,
    /// Shard count of the completed-transaction cache.
    pub completed_cache_concurrency: usize,
    /// Initial capacity of the active-transaction cache.
    pub active_cache_init: usize,
    /// Upper bound of the active-transaction cache; beyond it, lookups fall
    /// through to the registry store.
    pub active_cache_max: usize,

    /// Liveness refresh cadence.
    pub keep_alive_interval: Duration,
    /// Heartbeats older than this classify the transaction as abandoned.
    pub transaction_timeout: Duration,
    /// Heartbeat worker pool size.
    pub keep_alive_threads: usize,

    /// Lazy read-resolution worker pool size.
    pub read_resolver_threads: usize,
    /// Lazy read-resolution queue capacity; a full queue drops submissions.
    pub read_resolver_queue_size: usize,

    /// Fraction of a compaction pass's time budget spent on eager resolution.
    pub flush_resolution_share: f64,
    /// Rows queued per compaction pass.
    pub compaction_resolution_buffer_size: usize,

    /// Capacity of each staged rollforward queue.
    pub rollforward_queue_size: usize,
    /// Delay before a first-stage rollforward attempt.
    pub rollforward_first_wait: Duration,
    /// Delay before a second-stage (straggler) rollforward attempt.
    pub rollforward_second_wait: Duration,
    pub rollforward_first_threads: usize,
    pub rollforward_second_threads: usize,
    /// Second-stage attempts before a row is dropped from the ladder.
    pub rollforward_retries: u32,

    /// Whether commits wait for the registry store.
    pub durability: Durability,
    /// Treat references to unknown transaction ids as "no conflict / not
    /// visible" instead of an error.
    pub ignore_missing_txn: bool,

    /// Route timestamp allocations through bounded-wait lanes instead of
    /// hitting the shared counter directly.
    pub timestamp_batched: bool,
    /// Parallel allocation lanes in batched mode.
    pub timestamp_lanes: usize,
    /// Bound on the wait for a timestamp allocation; exceeding it fails the
    /// begin with a retriable error.
    pub timestamp_wait: Duration,

    /// Registry lock stripe count, rounded up to a power of two.
    pub registry_stripes: usize,
}

impl Default for SiConfig {
    fn default() -> Self {
        Self {
            completed_cache_size: 1 << 20,
            completed_cache_concurrency: 64,
            active_cache_init: 1 << 7,
            active_cache_max: 1 << 12,
            keep_alive_interval: Duration::from_millis(15_000),
            transaction_timeout: Duration::from_millis(150_000),
            keep_alive_threads: 4,
            read_resolver_threads: 4,
            read_resolver_queue_size: 1 << 16,
            flush_resolution_share: 0.2,
            compaction_resolution_buffer_size: 100,
            rollforward_queue_size: 4096,
            rollforward_first_wait: Duration::from_millis(1_000),
            rollforward_second_wait: Duration::from_millis(10_000),
            rollforward_first_threads: 25,
            rollforward_second_threads: 1,
            rollforward_retries: 3,
            durability: Durability::Sync,
            ignore_missing_txn: false,
            timestamp_batched: true,
            timestamp_lanes: 4,
            timestamp_wait: Duration::from_millis(2_000),
            registry_stripes: 64,
        }
    }
}

impl SiConfig {
    /// Stripe count as the next power of two, so stripe selection can mask.
    pub fn stripe_count(&self) -> usize {
        self.registry_stripes.next_power_of_two().max(1)
    }
}
