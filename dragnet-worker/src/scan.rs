//! Cancellable scan execution with partial-result capture.
//!
//! A timed-out scan that completed most of its sub-probes is strictly more
//! valuable than no result, so cancellation must not destroy state the scan
//! already produced. The protocol is a two-slot handshake: the scan body
//! periodically writes its working state into a per-task slot, cancellation
//! stops the body and *then* releases a binary semaphore, and retrieval
//! acquires that semaphore with a short grace timeout before taking the
//! slot. The release happening after the last possible write is what makes
//! the read race-free.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dragnet_common::job::{ScanConfig, ScanTarget};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("scan failed: {0}")]
    Probe(String),
    #[error("scan setup failed: {0}")]
    Setup(String),
    #[error("scan was cancelled")]
    Cancelled,
    #[error("i/o error during scan: {0}")]
    Io(#[from] std::io::Error),
}

/// The pluggable probe implementation executed for every job of a bulk
/// scan. One instance is shared by all jobs of that bulk scan on a worker,
/// so implementations hold per-bulk-scan caches here and keep per-target
/// state on the stack.
#[async_trait]
pub trait ScanFunction: Send + Sync {
    /// One-time per-bulk-scan initialisation, e.g. opening long-lived
    /// handles.
    async fn setup(&self) -> Result<(), ScanError> {
        Ok(())
    }

    /// One-time teardown after the bulk scan goes idle.
    async fn teardown(&self) {}

    /// Scan a single target. Implementations should publish intermediate
    /// state through `progress` whenever a meaningful unit of work
    /// completes; that state is what survives a timeout.
    async fn scan(
        &self,
        target: &ScanTarget,
        progress: &PartialResultSink,
    ) -> Result<serde_json::Value, ScanError>;
}

/// Builds the scan function for a bulk scan from its configuration.
pub trait ScannerFactory: Send + Sync {
    fn create(&self, config: &ScanConfig) -> Arc<dyn ScanFunction>;
}

/// The working-state slot shared between a running scan and whoever awaits
/// it.
pub struct PartialResultSink {
    slot: Mutex<Option<serde_json::Value>>,
    signal: Semaphore,
}

impl PartialResultSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            signal: Semaphore::new(0),
        })
    }

    /// Record the scan's current working state, replacing any earlier
    /// snapshot.
    pub fn publish(&self, value: serde_json::Value) {
        *self.slot.lock().expect("partial result slot poisoned") = Some(value);
    }

    fn release(&self) {
        self.signal.add_permits(1);
    }

    async fn wait_partial(&self, grace: Duration) -> Option<serde_json::Value> {
        match tokio::time::timeout(grace, self.signal.acquire()).await {
            Ok(Ok(_permit)) => self
                .slot
                .lock()
                .expect("partial result slot poisoned")
                .take(),
            _ => None,
        }
    }
}

/// How a single scan ended.
#[derive(Debug)]
pub enum ScanOutcome {
    /// The scan ran to completion.
    Completed(serde_json::Value),
    /// The scan was cancelled but had published working state.
    Partial(serde_json::Value),
    /// The scan failed.
    Failed(ScanError),
    /// The scan was cancelled and left nothing behind.
    TimedOut,
}

/// A scan in flight: a spawned task plus its cancellation token and
/// partial-result slot.
pub struct PendingScan {
    handle: JoinHandle<Result<serde_json::Value, ScanError>>,
    cancel: CancellationToken,
    sink: Arc<PartialResultSink>,
}

impl PendingScan {
    /// Start `scanner.scan` for `target` on the runtime. Failing attempts
    /// are rerun up to `reexecutions` times; the per-job timeout caps the
    /// whole chain from the caller's side.
    pub fn spawn(
        scanner: Arc<dyn ScanFunction>,
        target: ScanTarget,
        reexecutions: u32,
    ) -> Self {
        Self::spawn_inner(scanner, target, reexecutions, None)
    }

    /// Like [`PendingScan::spawn`], holding a concurrency permit for the
    /// lifetime of the scan task.
    pub fn spawn_with_permit(
        scanner: Arc<dyn ScanFunction>,
        target: ScanTarget,
        reexecutions: u32,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self::spawn_inner(scanner, target, reexecutions, Some(permit))
    }

    fn spawn_inner(
        scanner: Arc<dyn ScanFunction>,
        target: ScanTarget,
        reexecutions: u32,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        let sink = PartialResultSink::new();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let sink = sink.clone();
            let cancel = cancel.clone();
            async move {
                let _permit = permit;
                let result = tokio::select! {
                    result = run_with_retries(&*scanner, &target, &sink, reexecutions) => result,
                    _ = cancel.cancelled() => Err(ScanError::Cancelled),
                };
                if let Ok(value) = &result {
                    sink.publish(value.clone());
                }
                // Released strictly after the last write, on every path.
                sink.release();
                result
            }
        });

        Self {
            handle,
            cancel,
            sink,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Await the scan for at most `timeout`. On expiry the scan is
    /// cancelled and the partial-result slot is given `grace` to surface
    /// whatever the scan had published.
    pub async fn outcome(mut self, timeout: Duration, grace: Duration) -> ScanOutcome {
        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(Ok(Ok(value))) => ScanOutcome::Completed(value),
            Ok(Ok(Err(ScanError::Cancelled))) => match self.sink.wait_partial(grace).await {
                Some(value) => ScanOutcome::Partial(value),
                None => ScanOutcome::TimedOut,
            },
            Ok(Ok(Err(error))) => ScanOutcome::Failed(error),
            Ok(Err(join_error)) => {
                ScanOutcome::Failed(ScanError::Probe(format!("scan task died: {join_error}")))
            }
            Err(_elapsed) => {
                self.cancel.cancel();
                match self.sink.wait_partial(grace).await {
                    Some(value) => ScanOutcome::Partial(value),
                    None => {
                        self.handle.abort();
                        ScanOutcome::TimedOut
                    }
                }
            }
        }
    }
}

async fn run_with_retries(
    scanner: &dyn ScanFunction,
    target: &ScanTarget,
    sink: &PartialResultSink,
    reexecutions: u32,
) -> Result<serde_json::Value, ScanError> {
    let mut attempt = 0;
    loop {
        match scanner.scan(target, sink).await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < reexecutions => {
                warn!(%target, %error, attempt, "scan attempt failed; re-executing");
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
