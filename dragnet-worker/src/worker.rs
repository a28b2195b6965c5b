//! The worker loop: poll the queue, execute scans, persist, acknowledge.

use std::sync::Arc;
use std::time::Duration;

use dragnet_common::bulkscan::ScanResult;
use dragnet_common::health::HealthHandle;
use dragnet_common::job::{JobStatus, ScanJobDescription};
use dragnet_common::orchestration::OrchestrationProvider;
use dragnet_common::persistence::{
    store_result_with_recovery, PersistenceError, PersistenceProvider,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::WorkerError;
use crate::pool::WorkerPool;
use crate::scan::ScanOutcome;

/// A worker to poll the orchestration transport and spawn scan tasks when
/// jobs become available.
pub struct ScanWorker {
    /// An identifier for this worker. Used to mark jobs we have consumed.
    name: String,
    transport: Arc<dyn OrchestrationProvider>,
    store: Arc<dyn PersistenceProvider>,
    pool: Arc<WorkerPool>,
    /// The interval for polling the queue.
    poll_interval: Duration,
    /// How long a cancelled scan gets to surface its partial result.
    partial_result_grace: Duration,
    /// Maximum number of concurrent jobs being processed.
    max_concurrent_jobs: usize,
    /// The liveness check handle, to call on a schedule to report healthy.
    liveness: HealthHandle,
    shutdown: CancellationToken,
}

impl ScanWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        transport: Arc<dyn OrchestrationProvider>,
        store: Arc<dyn PersistenceProvider>,
        pool: Arc<WorkerPool>,
        poll_interval: Duration,
        partial_result_grace: Duration,
        max_concurrent_jobs: usize,
        liveness: HealthHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            name: name.to_owned(),
            transport,
            store,
            pool,
            poll_interval,
            partial_result_grace,
            max_concurrent_jobs: max_concurrent_jobs.max(1),
            liveness,
            shutdown,
        }
    }

    /// Wait until a job becomes available in our queue, or `None` once
    /// shutdown is requested.
    async fn wait_for_job(&self) -> Result<Option<ScanJobDescription>, WorkerError> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(None),
                _ = interval.tick() => {
                    self.liveness.report_healthy().await;
                    if let Some(job) = self.transport.next_job().await? {
                        return Ok(Some(job));
                    }
                }
            }
        }
    }

    /// Run this worker to continuously process any jobs that become
    /// available. Returns cleanly on shutdown; in-flight jobs run to their
    /// natural completion or timeout.
    pub async fn run(&self) -> Result<(), WorkerError> {
        info!(worker = %self.name, "scan worker started");
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_jobs));
        let report_semaphore_utilization = || {
            metrics::gauge!("scan_worker_saturation_percent").set(
                1f64 - semaphore.available_permits() as f64 / self.max_concurrent_jobs as f64,
            );
        };

        loop {
            report_semaphore_utilization();
            let Some(job) = self.wait_for_job().await? else {
                info!(worker = %self.name, "scan worker shutting down");
                // Let in-flight jobs drain before returning.
                let _drained = semaphore
                    .acquire_many(self.max_concurrent_jobs as u32)
                    .await;
                return Ok(());
            };

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("job semaphore has been closed");
            let transport = self.transport.clone();
            let store = self.store.clone();
            let pool = self.pool.clone();
            let grace = self.partial_result_grace;

            tokio::spawn(async move {
                let job_id = job.id;
                let result = process_scan_job(transport, store, pool, grace, job).await;
                drop(permit);
                if let Err(error) = result {
                    error!(%job_id, "failed to process scan job: {error}");
                }
            });
        }
    }
}

/// Process one delivery end to end.
///
/// Whatever happens to the scan or the store, the job finishes with exactly
/// one done-notification and acknowledgement; a poison job that never acked
/// would be redelivered forever.
async fn process_scan_job(
    transport: Arc<dyn OrchestrationProvider>,
    store: Arc<dyn PersistenceProvider>,
    pool: Arc<WorkerPool>,
    grace: Duration,
    mut job: ScanJobDescription,
) -> Result<(), WorkerError> {
    let labels = [("bulk_scan", job.bulk_scan_info.bulk_scan_id.clone())];
    metrics::counter!("scan_jobs_total", &labels).increment(1);

    let timeout = job.bulk_scan_info.scan_config.timeout();
    let started = tokio::time::Instant::now();

    let outcome = {
        let lease = pool.checkout(&job.bulk_scan_info);
        match lease.worker.submit(&job).await {
            Ok(pending) => pending.outcome(timeout, grace).await,
            Err(error) => ScanOutcome::Failed(error),
        }
    };

    let result = match outcome {
        ScanOutcome::Completed(document) => {
            metrics::counter!("scan_jobs_completed", &labels).increment(1);
            job.advance(JobStatus::Success);
            ScanResult::for_job(&job, document)
        }
        ScanOutcome::Partial(document) => {
            metrics::counter!("scan_jobs_partial", &labels).increment(1);
            job.advance(JobStatus::Success);
            ScanResult::for_job(&job, document)
        }
        ScanOutcome::Failed(error) => {
            metrics::counter!("scan_jobs_failed", &labels).increment(1);
            job.advance(JobStatus::Error);
            ScanResult::error_document(&job, &error.to_string())
        }
        ScanOutcome::TimedOut => {
            metrics::counter!("scan_jobs_interrupted", &labels).increment(1);
            job.advance(JobStatus::Interrupted);
            ScanResult::error_document(&job, "scan timed out without a partial result")
        }
    };

    metrics::histogram!("scan_jobs_processing_duration_seconds", &labels)
        .record(started.elapsed().as_secs_f64());

    if let Err(store_error) = store_result_with_recovery(store.as_ref(), &mut job, result).await {
        error!(
            job_id = %job.id,
            "failed to persist scan result: {store_error}"
        );
        // The bounded serialization recovery already exhausted its retry;
        // for any other store failure, try once to leave an error summary.
        if !matches!(store_error, PersistenceError::Serialization(_)) {
            if job.status != JobStatus::InternalError {
                job.advance(JobStatus::InternalError);
            }
            let minimal = ScanResult::error_document(&job, &store_error.to_string());
            if let Err(second) = store.insert_scan_result(&minimal, &job).await {
                error!(job_id = %job.id, "failed to persist error summary: {second}");
            }
        }
        metrics::counter!("scan_jobs_internal_error", &labels).increment(1);
    }

    transport.notify_done(&job).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use dragnet_common::health::HealthRegistry;
    use dragnet_common::job::{BulkScanInfo, ScanConfig, ScanTarget};
    use dragnet_common::orchestration::memory::MemoryTransport;
    use dragnet_common::persistence::memory::MemoryStore;
    use dragnet_common::persistence::ModuleRegistry;
    use serde_json::json;

    use crate::scan::{PartialResultSink, ScanError, ScanFunction, ScannerFactory};

    enum Behaviour {
        Succeed,
        Fail,
        PublishThenStall,
        StallForever,
    }

    struct ScriptedScanner {
        behaviour: Behaviour,
    }

    #[async_trait]
    impl ScanFunction for ScriptedScanner {
        async fn scan(
            &self,
            _target: &ScanTarget,
            progress: &PartialResultSink,
        ) -> Result<serde_json::Value, ScanError> {
            match self.behaviour {
                Behaviour::Succeed => Ok(json!({"handshake": "complete"})),
                Behaviour::Fail => Err(ScanError::Probe("handshake refused".to_owned())),
                Behaviour::PublishThenStall => {
                    progress.publish(json!({"handshake": "partial"}));
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok(json!({"handshake": "complete"}))
                }
                Behaviour::StallForever => {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok(json!({"handshake": "complete"}))
                }
            }
        }
    }

    struct ScriptedFactory;

    impl ScannerFactory for ScriptedFactory {
        fn create(&self, config: &ScanConfig) -> Arc<dyn ScanFunction> {
            let behaviour = match config.probe.as_str() {
                "fail" => Behaviour::Fail,
                "publish-then-stall" => Behaviour::PublishThenStall,
                "stall" => Behaviour::StallForever,
                _ => Behaviour::Succeed,
            };
            Arc::new(ScriptedScanner { behaviour })
        }
    }

    struct Fixture {
        transport: Arc<MemoryTransport>,
        store: Arc<MemoryStore>,
        pool: Arc<WorkerPool>,
    }

    fn fixture() -> Fixture {
        Fixture {
            transport: Arc::new(MemoryTransport::new(16)),
            store: Arc::new(MemoryStore::new(Arc::new(ModuleRegistry::new()))),
            pool: WorkerPool::new(Arc::new(ScriptedFactory), 4, Duration::from_secs(60)),
        }
    }

    fn job_for(probe: &str, bulk_scan_id: &str, timeout_millis: u64) -> ScanJobDescription {
        ScanJobDescription::new(
            ScanTarget::parse("192.0.2.10:443", 443).unwrap(),
            BulkScanInfo {
                bulk_scan_id: bulk_scan_id.to_owned(),
                db_name: "db".to_owned(),
                collection_name: "results".to_owned(),
                scan_config: ScanConfig {
                    probe: probe.to_owned(),
                    timeout_millis,
                    ..ScanConfig::default()
                },
            },
        )
    }

    async fn deliver_and_process(fixture: &Fixture, job: ScanJobDescription) {
        fixture.transport.submit_job(&job).await.unwrap();
        let delivered = fixture.transport.next_job().await.unwrap().unwrap();
        process_scan_job(
            fixture.transport.clone(),
            fixture.store.clone(),
            fixture.pool.clone(),
            Duration::from_millis(250),
            delivered,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn successful_scan_persists_notifies_and_acks() {
        let fixture = fixture();
        let job = job_for("succeed", "bs-ok", 5_000);
        let job_id = job.id;
        deliver_and_process(&fixture, job).await;

        let results = fixture.store.results_in("db", "results");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, job_id);
        assert_eq!(results[0].status, JobStatus::Success);
        assert_eq!(results[0].result_document["handshake"], json!("complete"));

        let done = fixture.transport.next_done("bs-ok").await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, JobStatus::Success);
        assert_eq!(fixture.transport.unacked_count(), 0);
    }

    #[tokio::test]
    async fn failing_scan_persists_error_and_still_acks() {
        let fixture = fixture();
        let job = job_for("fail", "bs-err", 5_000);
        deliver_and_process(&fixture, job).await;

        let results = fixture.store.results_in("db", "results");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, JobStatus::Error);
        assert!(results[0].result_document["error"]
            .as_str()
            .unwrap()
            .contains("handshake refused"));

        let done = fixture.transport.next_done("bs-err").await.unwrap();
        assert_eq!(done[0].status, JobStatus::Error);
        assert_eq!(fixture.transport.unacked_count(), 0);
    }

    #[tokio::test]
    async fn timed_out_scan_with_partial_result_is_a_success() {
        let fixture = fixture();
        let job = job_for("publish-then-stall", "bs-partial", 200);
        deliver_and_process(&fixture, job).await;

        let results = fixture.store.results_in("db", "results");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, JobStatus::Success);
        assert_eq!(results[0].result_document["handshake"], json!("partial"));

        let done = fixture.transport.next_done("bs-partial").await.unwrap();
        assert_eq!(done[0].status, JobStatus::Success);
        assert_eq!(fixture.transport.unacked_count(), 0);
    }

    #[tokio::test]
    async fn timed_out_scan_without_partial_result_is_interrupted() {
        let fixture = fixture();
        let job = job_for("stall", "bs-stall", 200);
        deliver_and_process(&fixture, job).await;

        let results = fixture.store.results_in("db", "results");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, JobStatus::Interrupted);

        let done = fixture.transport.next_done("bs-stall").await.unwrap();
        assert_eq!(done[0].status, JobStatus::Interrupted);
    }

    #[tokio::test]
    async fn worker_loop_drains_the_queue() {
        let fixture = fixture();
        for _ in 0..5 {
            fixture
                .transport
                .submit_job(&job_for("succeed", "bs-loop", 5_000))
                .await
                .unwrap();
        }

        let registry = HealthRegistry::new("liveness");
        let liveness = registry.register("worker", ChronoDuration::seconds(30)).await;
        let shutdown = CancellationToken::new();
        let worker = ScanWorker::new(
            "test-worker",
            fixture.transport.clone(),
            fixture.store.clone(),
            fixture.pool.clone(),
            Duration::from_millis(10),
            Duration::from_millis(100),
            4,
            liveness,
            shutdown.clone(),
        );

        let run = tokio::spawn(async move { worker.run().await });

        for _ in 0..200 {
            if fixture.store.results_in("db", "results").len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(fixture.store.results_in("db", "results").len(), 5);
        assert_eq!(fixture.transport.next_done("bs-loop").await.unwrap().len(), 5);

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn redelivered_job_yields_one_observable_result() {
        let fixture = fixture();
        let job = job_for("succeed", "bs-redeliver", 5_000);
        let job_id = job.id;
        fixture.transport.submit_job(&job).await.unwrap();

        // First worker dequeues and crashes before acking.
        let _lost = fixture.transport.next_job().await.unwrap().unwrap();
        fixture.transport.redeliver_unacked();

        // Second worker picks the job up and completes it.
        let delivered = fixture.transport.next_job().await.unwrap().unwrap();
        process_scan_job(
            fixture.transport.clone(),
            fixture.store.clone(),
            fixture.pool.clone(),
            Duration::from_millis(250),
            delivered,
        )
        .await
        .unwrap();

        let results = fixture.store.results_in("db", "results");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, job_id);
        let by_id = fixture
            .store
            .get_scan_result_by_id("db", "results", job_id)
            .await
            .unwrap();
        assert!(by_id.is_some());
    }
}
