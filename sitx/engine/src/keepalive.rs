//! Keep-alive monitoring.
//!
//! A fixed-size background pool refreshes the liveness heartbeat of every
//! registered transaction each interval, independent of the threads issuing
//! transaction work. A transaction whose owner stops heartbeating (crashed
//! client, unregistered handle) goes stale and becomes eligible for
//! unilateral rollback by a conflicting writer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dashmap::DashSet;
use sitx_txn::timestamp::TxnId;
use tracing::debug;

use crate::config::SiConfig;
use crate::registry::TransactionRegistry;

pub struct KeepAliveMonitor {
    registered: Arc<DashSet<TxnId>>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

/// Sleep in short ticks until `deadline`, bailing out early on shutdown.
/// Returns false if shutdown was requested.
pub(crate) fn sleep_until(deadline: Instant, shutdown: &AtomicBool) -> bool {
    while Instant::now() < deadline {
        if shutdown.load(Ordering::Acquire) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        thread::sleep(Duration::from_millis(10).min(remaining));
    }
    !shutdown.load(Ordering::Acquire)
}

impl KeepAliveMonitor {
    pub fn start(registry: Arc<TransactionRegistry>, config: &SiConfig) -> Self {
        let registered: Arc<DashSet<TxnId>> = Arc::new(DashSet::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let threads = config.keep_alive_threads.max(1);
        let interval = config.keep_alive_interval;

        let workers = (0..threads)
            .map(|worker_idx| {
                let registry = registry.clone();
                let registered = registered.clone();
                let shutdown = shutdown.clone();
                thread::spawn(move || {
                    loop {
                        let next_round = Instant::now() + interval;
                        // Each worker heartbeats its share of the registered set.
                        for id in registered.iter() {
                            let id = *id;
                            if id.raw() as usize % threads != worker_idx {
                                continue;
                            }
                            if let Err(e) = registry.keep_alive(id) {
                                debug!(txn = id.raw(), error = %e, "keep-alive refresh failed");
                            }
                        }
                        if !sleep_until(next_round, &shutdown) {
                            return;
                        }
                    }
                })
            })
            .collect();

        Self {
            registered,
            shutdown,
            workers,
        }
    }

    /// Start heartbeating `id`.
    pub fn register(&self, id: TxnId) {
        self.registered.insert(id);
    }

    /// Stop heartbeating `id`. Its record will go stale after the configured
    /// timeout unless the owner heartbeats it directly.
    pub fn unregister(&self, id: TxnId) {
        self.registered.remove(&id);
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for KeepAliveMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
