//! Publishing a bulk scan: expansion, submission and completion tracking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dragnet_common::bulkscan::{BulkScan, ScanResult};
use dragnet_common::denylist::Denylist;
use dragnet_common::job::{
    BulkScanInfo, JobStatus, ScanConfig, ScanJobDescription, ScanTarget,
};
use dragnet_common::orchestration::OrchestrationProvider;
use dragnet_common::persistence::PersistenceProvider;
use dragnet_common::targets::{RawTarget, TargetListProvider};
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::default_expansion_parallelism;
use crate::error::ControllerError;
use crate::progress::spawn_progress_monitor;
use crate::tracker::CompletionTracker;

/// Everything one `PublishBulkScan` firing needs to know.
#[derive(Clone)]
pub struct PublishSettings {
    /// Names the bulk scan and its database.
    pub name: String,
    pub db_name: String,
    pub collection_name: String,
    pub scan_config: ScanConfig,
    pub default_port: u16,
    pub monitored: bool,
    pub monitor_interval: Duration,
    pub done_poll_interval: Duration,
    pub expansion_parallelism: usize,
}

impl PublishSettings {
    pub fn new(name: &str, collection_name: &str, scan_config: ScanConfig) -> Self {
        Self {
            name: name.to_owned(),
            db_name: name.to_owned(),
            collection_name: collection_name.to_owned(),
            scan_config,
            default_port: 443,
            monitored: true,
            monitor_interval: Duration::from_secs(10),
            done_poll_interval: Duration::from_millis(250),
            expansion_parallelism: default_expansion_parallelism(),
        }
    }
}

/// A live bulk scan as seen from the controller after publication
/// returned. Completion is driven by done-notification arrivals, not by
/// the publishing call.
pub struct BulkScanHandle {
    pub bulk_scan_id: String,
    tracker: Arc<CompletionTracker>,
    finished: CancellationToken,
}

impl BulkScanHandle {
    /// Wait until the bulk scan finalises.
    pub async fn wait_finished(&self) {
        self.finished.cancelled().await;
    }

    pub fn is_finished(&self) -> bool {
        self.tracker.is_finished()
    }

    pub fn snapshot(&self) -> BulkScan {
        self.tracker.snapshot()
    }
}

pub struct Controller {
    transport: Arc<dyn OrchestrationProvider>,
    store: Arc<dyn PersistenceProvider>,
    targets: Arc<dyn TargetListProvider>,
    denylist: Arc<Denylist>,
    settings: PublishSettings,
}

impl Controller {
    pub fn new(
        transport: Arc<dyn OrchestrationProvider>,
        store: Arc<dyn PersistenceProvider>,
        targets: Arc<dyn TargetListProvider>,
        denylist: Arc<Denylist>,
        settings: PublishSettings,
    ) -> Self {
        Self {
            transport,
            store,
            targets,
            denylist,
            settings,
        }
    }

    /// Execute one complete bulk scan publication.
    ///
    /// Returns once every target has been expanded and submitted; the
    /// returned handle tracks completion, which arrives asynchronously as
    /// workers report done.
    pub async fn publish_bulk_scan(&self) -> Result<BulkScanHandle, ControllerError> {
        let bulk_scan = BulkScan::new(
            &self.settings.name,
            self.settings.scan_config.clone(),
            self.settings.monitored,
        );
        let bulk_scan_id = bulk_scan.id.clone();
        info!(%bulk_scan_id, name = %self.settings.name, "publishing bulk scan");

        self.store
            .insert_bulk_scan(&self.settings.db_name, &bulk_scan)
            .await?;

        let info = BulkScanInfo {
            bulk_scan_id: bulk_scan_id.clone(),
            db_name: self.settings.db_name.clone(),
            collection_name: self.settings.collection_name.clone(),
            scan_config: self.settings.scan_config.clone(),
        };
        let tracker = Arc::new(CompletionTracker::new(bulk_scan));
        let finished = CancellationToken::new();

        // Subscribe before the first submission so early notifications are
        // never lost.
        tokio::spawn(drain_done_notifications(
            self.transport.clone(),
            self.store.clone(),
            self.settings.db_name.clone(),
            tracker.clone(),
            self.settings.done_poll_interval,
            finished.clone(),
        ));

        let emitted = AtomicU64::new(0);
        let target_lines = self.targets.fetch().await?;
        stream::iter(target_lines)
            .map(|line| {
                let emitted = &emitted;
                let info = &info;
                let tracker = &tracker;
                async move {
                    let raw = line?;
                    emitted.fetch_add(1, Ordering::SeqCst);
                    self.expand_target(raw, info, tracker).await
                }
            })
            .buffer_unordered(self.settings.expansion_parallelism.max(1))
            .try_for_each(|()| std::future::ready(Ok::<(), ControllerError>(())))
            .await?;

        let job_total = emitted.load(Ordering::SeqCst);
        tracker.set_job_total(job_total);
        self.store
            .update_bulk_scan(&self.settings.db_name, &tracker.snapshot())
            .await?;
        info!(%bulk_scan_id, job_total, "bulk scan submitted");

        // Covers the empty list and every job already reported done.
        if let Some(done) = tracker.try_finalize() {
            self.store
                .update_bulk_scan(&self.settings.db_name, &done)
                .await?;
            finished.cancel();
        }

        if self.settings.monitored {
            spawn_progress_monitor(
                tracker.clone(),
                self.settings.monitor_interval,
                finished.clone(),
            );
        }

        Ok(BulkScanHandle {
            bulk_scan_id,
            tracker,
            finished,
        })
    }

    /// Expand one raw line: parse, resolve, denylist-check, then either
    /// submit a job or terminate the target directly with a persisted
    /// result. One target's failure never touches another's status.
    async fn expand_target(
        &self,
        raw: RawTarget,
        info: &BulkScanInfo,
        tracker: &CompletionTracker,
    ) -> Result<(), ControllerError> {
        let mut target = match ScanTarget::parse(&raw.line, self.settings.default_port) {
            Ok(target) => target,
            Err(parse_error) => {
                let placeholder = ScanTarget {
                    hostname: Some(raw.line.clone()),
                    ip: None,
                    port: self.settings.default_port,
                    tranco_rank: raw.rank,
                };
                return self
                    .terminate_directly(
                        placeholder,
                        info,
                        tracker,
                        JobStatus::ResolutionError,
                        &parse_error.to_string(),
                    )
                    .await;
            }
        };
        target.tranco_rank = raw.rank;

        if let Err(resolve_error) = target.resolve().await {
            let message = resolve_error.to_string();
            return self
                .terminate_directly(target, info, tracker, JobStatus::Unresolvable, &message)
                .await;
        }

        if self.denylist.matches(&target) {
            return self
                .terminate_directly(
                    target,
                    info,
                    tracker,
                    JobStatus::Denylisted,
                    "target matches a denylist entry",
                )
                .await;
        }

        let job = ScanJobDescription::new(target, info.clone());
        self.transport.submit_job(&job).await?;
        Ok(())
    }

    /// Persist a terminal result for a target that never reaches a worker
    /// and fold it into the completion counters.
    async fn terminate_directly(
        &self,
        target: ScanTarget,
        info: &BulkScanInfo,
        tracker: &CompletionTracker,
        status: JobStatus,
        message: &str,
    ) -> Result<(), ControllerError> {
        warn!(target = %target, %status, "{message}");
        let mut job = ScanJobDescription::new(target, info.clone());
        job.advance(status);
        let result = ScanResult::error_document(&job, message);
        self.store.insert_scan_result(&result, &job).await?;
        tracker.record(job.id, status);
        metrics::counter!(
            "controller_targets_terminated",
            &[("status", status.to_string())]
        )
        .increment(1);
        Ok(())
    }
}

/// The done-notification consumer for one bulk scan: dedupe, count, and
/// finalise exactly once when the counters reach the job total.
async fn drain_done_notifications(
    transport: Arc<dyn OrchestrationProvider>,
    store: Arc<dyn PersistenceProvider>,
    db_name: String,
    tracker: Arc<CompletionTracker>,
    poll_interval: Duration,
    finished: CancellationToken,
) {
    let bulk_scan_id = tracker.bulk_scan_id();
    let mut interval = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = finished.cancelled() => return,
            _ = interval.tick() => {
                let notifications = match transport.next_done(&bulk_scan_id).await {
                    Ok(notifications) => notifications,
                    Err(error) => {
                        warn!(%bulk_scan_id, "failed to drain done notifications: {error}");
                        continue;
                    }
                };
                for job in notifications {
                    tracker.record(job.id, job.status);
                }
                if let Some(done) = tracker.try_finalize() {
                    info!(
                        %bulk_scan_id,
                        job_total = done.job_total,
                        "bulk scan finished"
                    );
                    if let Err(error) = store.update_bulk_scan(&db_name, &done).await {
                        warn!(%bulk_scan_id, "failed to persist finished bulk scan: {error}");
                    }
                    finished.cancel();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dragnet_common::orchestration::memory::MemoryTransport;
    use dragnet_common::persistence::memory::MemoryStore;
    use dragnet_common::persistence::ModuleRegistry;
    use dragnet_common::targets::{TargetError, TargetIter};
    use async_trait::async_trait;

    struct StaticTargets {
        lines: Vec<&'static str>,
    }

    #[async_trait]
    impl TargetListProvider for StaticTargets {
        async fn fetch(&self) -> Result<TargetIter, TargetError> {
            let items: Vec<Result<RawTarget, TargetError>> = self
                .lines
                .iter()
                .map(|line| Ok(RawTarget::plain(*line)))
                .collect();
            Ok(Box::new(items.into_iter()))
        }
    }

    struct Fixture {
        transport: Arc<MemoryTransport>,
        store: Arc<MemoryStore>,
    }

    fn fixture() -> Fixture {
        Fixture {
            transport: Arc::new(MemoryTransport::new(64)),
            store: Arc::new(MemoryStore::new(Arc::new(ModuleRegistry::new()))),
        }
    }

    fn settings() -> PublishSettings {
        let mut settings = PublishSettings::new("tls-nightly", "results", ScanConfig::default());
        settings.done_poll_interval = Duration::from_millis(10);
        settings.monitored = false;
        settings
    }

    fn controller(
        fixture: &Fixture,
        lines: Vec<&'static str>,
        denylist: Denylist,
    ) -> Controller {
        Controller::new(
            fixture.transport.clone(),
            fixture.store.clone(),
            Arc::new(StaticTargets { lines }),
            Arc::new(denylist),
            settings(),
        )
    }

    #[tokio::test]
    async fn empty_target_list_finishes_immediately() {
        let fixture = fixture();
        let controller = controller(&fixture, vec![], Denylist::empty());
        let handle = controller.publish_bulk_scan().await.unwrap();

        assert!(handle.is_finished());
        let stored = fixture
            .store
            .bulk_scan("tls-nightly", &handle.bulk_scan_id)
            .unwrap();
        assert!(stored.finished);
        assert_eq!(stored.job_total, 0);
        assert!(stored.end_time.is_some());
    }

    #[tokio::test]
    async fn denylisted_and_invalid_targets_terminate_directly() {
        let fixture = fixture();
        let denylist = Denylist::from_lines(["192.0.2.0/24", "198.51.100.9"]);
        let controller = controller(
            &fixture,
            vec![
                "192.0.2.17",        // denylisted by CIDR
                "198.51.100.9:8443", // denylisted by address
                "host:notanumber",   // unparseable port
                "203.0.113.5",       // clean: submitted
                "203.0.113.5:8443",  // clean: submitted
            ],
            denylist,
        );

        let handle = controller.publish_bulk_scan().await.unwrap();
        assert_eq!(handle.snapshot().job_total, 5);

        let results = fixture.store.results_in("tls-nightly", "results");
        assert_eq!(results.len(), 3);
        let denylisted = results
            .iter()
            .filter(|r| r.status == JobStatus::Denylisted)
            .count();
        assert_eq!(denylisted, 2);

        let resolution_error = results
            .iter()
            .find(|r| r.status == JobStatus::ResolutionError)
            .expect("bad port target recorded");
        let context = resolution_error.result_document["error"].as_str().unwrap();
        assert!(context.contains("notanumber"));
        assert!(context.contains("host:notanumber"));

        // Only the clean targets were submitted.
        let mut submitted = Vec::new();
        while let Some(job) = fixture.transport.next_job().await.unwrap() {
            submitted.push(job);
        }
        assert_eq!(submitted.len(), 2);
        for job in &submitted {
            assert_eq!(job.status, JobStatus::ToBeExecuted);
            assert_eq!(job.scan_target.ip, Some("203.0.113.5".parse().unwrap()));
        }
        let ports: Vec<u16> = submitted.iter().map(|j| j.scan_target.port).collect();
        assert!(ports.contains(&443));
        assert!(ports.contains(&8443));
    }

    #[tokio::test]
    async fn unresolvable_hostname_terminates_directly() {
        let fixture = fixture();
        // The .invalid TLD is reserved and never resolves.
        let controller = controller(
            &fixture,
            vec!["no-such-host.invalid"],
            Denylist::empty(),
        );

        let handle = controller.publish_bulk_scan().await.unwrap();
        assert!(handle.is_finished());

        let results = fixture.store.results_in("tls-nightly", "results");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, JobStatus::Unresolvable);
        assert!(fixture.transport.next_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn done_notifications_drive_finalisation() {
        let fixture = fixture();
        let controller = controller(
            &fixture,
            vec!["203.0.113.1", "203.0.113.2"],
            Denylist::empty(),
        );
        let handle = controller.publish_bulk_scan().await.unwrap();
        assert!(!handle.is_finished());

        // Play the worker: complete both jobs.
        while let Some(mut job) = fixture.transport.next_job().await.unwrap() {
            job.advance(JobStatus::Success);
            fixture.transport.notify_done(&job).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), handle.wait_finished())
            .await
            .expect("bulk scan should finalise");

        let stored = fixture
            .store
            .bulk_scan("tls-nightly", &handle.bulk_scan_id)
            .unwrap();
        assert!(stored.finished);
        assert_eq!(stored.job_total, 2);
        assert_eq!(stored.jobs_completed[&JobStatus::Success], 2);
    }

    #[tokio::test]
    async fn duplicate_done_notifications_do_not_overcount() {
        let fixture = fixture();
        let controller = controller(&fixture, vec!["203.0.113.1"], Denylist::empty());
        let handle = controller.publish_bulk_scan().await.unwrap();

        let mut job = fixture.transport.next_job().await.unwrap().unwrap();
        job.advance(JobStatus::Success);
        fixture.transport.notify_done(&job).await.unwrap();
        // A redelivered completion produces a second notification.
        fixture.transport.submit_job(&job).await.unwrap();
        let redelivered = fixture.transport.next_job().await.unwrap().unwrap();
        fixture.transport.notify_done(&redelivered).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.wait_finished())
            .await
            .expect("bulk scan should finalise");

        let stored = fixture
            .store
            .bulk_scan("tls-nightly", &handle.bulk_scan_id)
            .unwrap();
        assert_eq!(stored.completed_total(), 1);
        assert_eq!(stored.job_total, 1);
    }
}
