//! The keyed pool of per-bulk-scan execution engines.
//!
//! A `BulkScanWorker` amortises one-time probe setup across every job of a
//! bulk scan handled by this process. Entries are created lazily on the
//! first job of a bulk scan, reference-counted while jobs are in flight and
//! torn down by a sweeper once idle past a TTL.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dragnet_common::job::{BulkScanInfo, ScanJobDescription};
use tokio::sync::{OnceCell, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::scan::{PendingScan, ScanError, ScanFunction, ScannerFactory};

/// A bounded, cancellable execution environment for the scans of one bulk
/// scan.
pub struct BulkScanWorker {
    bulk_scan_id: String,
    scanner: Arc<dyn ScanFunction>,
    /// Bounds how many scans of this bulk scan run at once on this worker.
    limiter: Arc<Semaphore>,
    reexecutions: u32,
    setup: OnceCell<()>,
}

impl BulkScanWorker {
    fn new(info: &BulkScanInfo, scanner: Arc<dyn ScanFunction>, parallel_scan_threads: usize) -> Self {
        Self {
            bulk_scan_id: info.bulk_scan_id.clone(),
            scanner,
            limiter: Arc::new(Semaphore::new(parallel_scan_threads.max(1))),
            reexecutions: info.scan_config.reexecutions,
            setup: OnceCell::new(),
        }
    }

    pub fn bulk_scan_id(&self) -> &str {
        &self.bulk_scan_id
    }

    async fn ensure_setup(&self) -> Result<(), ScanError> {
        self.setup
            .get_or_try_init(|| async {
                info!(bulk_scan_id = %self.bulk_scan_id, "running bulk scan setup");
                self.scanner.setup().await
            })
            .await?;
        Ok(())
    }

    /// Submit one job for execution. Blocks while the bulk scan is at its
    /// concurrency limit, then spawns the scan and returns its handle.
    pub async fn submit(&self, job: &ScanJobDescription) -> Result<PendingScan, ScanError> {
        self.ensure_setup().await?;
        let permit = self
            .limiter
            .clone()
            .acquire_owned()
            .await
            .expect("scan limiter closed");

        let pending = PendingScan::spawn_with_permit(
            self.scanner.clone(),
            job.scan_target.clone(),
            self.reexecutions,
            permit,
        );
        Ok(pending)
    }

    async fn teardown(&self) {
        if self.setup.get().is_some() {
            info!(bulk_scan_id = %self.bulk_scan_id, "running bulk scan teardown");
            self.scanner.teardown().await;
        }
    }
}

struct PoolEntry {
    worker: Arc<BulkScanWorker>,
    refs: usize,
    idle_since: Option<Instant>,
}

/// The process-wide map of live `BulkScanWorker`s, keyed by bulk scan id.
pub struct WorkerPool {
    factory: Arc<dyn ScannerFactory>,
    parallel_scan_threads: usize,
    idle_ttl: Duration,
    entries: Mutex<HashMap<String, PoolEntry>>,
}

impl WorkerPool {
    pub fn new(
        factory: Arc<dyn ScannerFactory>,
        parallel_scan_threads: usize,
        idle_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            parallel_scan_threads,
            idle_ttl,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Look up or lazily create the worker for a job's bulk scan. The
    /// returned lease keeps the entry referenced until dropped.
    pub fn checkout(self: &Arc<Self>, info: &BulkScanInfo) -> WorkerLease {
        let mut entries = self.entries.lock().expect("worker pool lock poisoned");
        let entry = entries
            .entry(info.bulk_scan_id.clone())
            .or_insert_with(|| {
                debug!(bulk_scan_id = %info.bulk_scan_id, "creating bulk scan worker");
                let scanner = self.factory.create(&info.scan_config);
                PoolEntry {
                    worker: Arc::new(BulkScanWorker::new(
                        info,
                        scanner,
                        self.parallel_scan_threads,
                    )),
                    refs: 0,
                    idle_since: None,
                }
            });
        entry.refs += 1;
        entry.idle_since = None;
        WorkerLease {
            pool: self.clone(),
            bulk_scan_id: info.bulk_scan_id.clone(),
            worker: entry.worker.clone(),
        }
    }

    fn release(&self, bulk_scan_id: &str) {
        let mut entries = self.entries.lock().expect("worker pool lock poisoned");
        if let Some(entry) = entries.get_mut(bulk_scan_id) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                entry.idle_since = Some(Instant::now());
            }
        }
    }

    /// Remove entries idle past the TTL; the caller runs their teardown.
    fn take_expired(&self) -> Vec<Arc<BulkScanWorker>> {
        let mut entries = self.entries.lock().expect("worker pool lock poisoned");
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| {
                entry.refs == 0
                    && entry
                        .idle_since
                        .map(|since| since.elapsed() >= self.idle_ttl)
                        .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| entries.remove(&id))
            .map(|entry| entry.worker)
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.entries.lock().expect("worker pool lock poisoned").len()
    }

    /// Periodically evict and tear down idle bulk scan workers until the
    /// token is cancelled.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    for worker in self.take_expired() {
                        info!(bulk_scan_id = %worker.bulk_scan_id(), "evicting idle bulk scan worker");
                        worker.teardown().await;
                    }
                }
            }
        }
    }
}

/// A reference-counted lease on a pool entry. Dropping the lease marks the
/// entry idle once no other job holds it.
pub struct WorkerLease {
    pool: Arc<WorkerPool>,
    bulk_scan_id: String,
    pub worker: Arc<BulkScanWorker>,
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.pool.release(&self.bulk_scan_id);
    }
}
