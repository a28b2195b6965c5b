//! Periodic progress reporting for a running bulk scan.
//!
//! Purely observational: logs the completion ratio and status histogram and
//! exports gauges. Disabled entirely when the bulk scan is not monitored.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::tracker::CompletionTracker;

pub fn spawn_progress_monitor(
    tracker: Arc<CompletionTracker>,
    interval: Duration,
    finished: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick would report before anything happened.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = finished.cancelled() => {
                    report(&tracker);
                    return;
                }
                _ = ticker.tick() => report(&tracker),
            }
        }
    })
}

fn report(tracker: &CompletionTracker) {
    let snapshot = tracker.snapshot();
    let completed = snapshot.completed_total();
    let ratio = if snapshot.job_total > 0 {
        completed as f64 / snapshot.job_total as f64
    } else {
        0.0
    };

    let histogram: Vec<String> = snapshot
        .jobs_completed
        .iter()
        .map(|(status, count)| format!("{status}={count}"))
        .collect();

    info!(
        bulk_scan_id = %snapshot.id,
        completed,
        job_total = snapshot.job_total,
        finished = snapshot.finished,
        "bulk scan progress {:.1}% [{}]",
        ratio * 100.0,
        histogram.join(" ")
    );

    let labels = [("bulk_scan", snapshot.id.clone())];
    metrics::gauge!("bulk_scan_completed_jobs", &labels).set(completed as f64);
    metrics::gauge!("bulk_scan_completion_ratio", &labels).set(ratio);
}

#[cfg(test)]
mod tests {
    use super::*;
    use dragnet_common::bulkscan::BulkScan;
    use dragnet_common::job::{JobStatus, ScanConfig};
    use uuid::Uuid;

    #[tokio::test]
    async fn monitor_stops_when_the_bulk_scan_finishes() {
        let tracker = Arc::new(CompletionTracker::new(BulkScan::new(
            "nightly",
            ScanConfig::default(),
            true,
        )));
        let finished = CancellationToken::new();
        let monitor = spawn_progress_monitor(
            tracker.clone(),
            Duration::from_millis(10),
            finished.clone(),
        );

        tracker.record(Uuid::now_v7(), JobStatus::Success);
        tracker.set_job_total(1);
        assert!(tracker.try_finalize().is_some());
        finished.cancel();

        tokio::time::timeout(Duration::from_secs(5), monitor)
            .await
            .expect("monitor should exit")
            .expect("monitor should not panic");
    }
}
