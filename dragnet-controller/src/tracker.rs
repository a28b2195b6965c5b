//! Completion tracking for one bulk scan.
//!
//! All counter mutations funnel through this tracker, whether they come
//! from the done-notification drain loop or from targets the controller
//! terminated directly during expansion. The transport may deliver the same
//! done notification twice, so arrivals are deduplicated by job id; the
//! seen set never outgrows the job total.

use std::collections::HashSet;
use std::sync::Mutex;

use dragnet_common::bulkscan::BulkScan;
use dragnet_common::job::JobStatus;
use uuid::Uuid;

struct TrackerInner {
    bulk_scan: BulkScan,
    seen: HashSet<Uuid>,
    total_known: bool,
}

pub struct CompletionTracker {
    inner: Mutex<TrackerInner>,
}

impl CompletionTracker {
    pub fn new(bulk_scan: BulkScan) -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                bulk_scan,
                seen: HashSet::new(),
                total_known: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        self.inner.lock().expect("completion tracker lock poisoned")
    }

    pub fn bulk_scan_id(&self) -> String {
        self.lock().bulk_scan.id.clone()
    }

    /// Record one terminal job. Returns false for duplicates.
    pub fn record(&self, job_id: Uuid, status: JobStatus) -> bool {
        debug_assert!(status.is_terminal(), "recorded a non-terminal status");
        let mut inner = self.lock();
        if !inner.seen.insert(job_id) {
            return false;
        }
        inner.bulk_scan.record_completion(status);
        true
    }

    /// Fix the job total once target expansion finishes.
    pub fn set_job_total(&self, total: u64) {
        let mut inner = self.lock();
        inner.bulk_scan.job_total = total;
        inner.total_known = true;
    }

    /// Finalise the bulk scan if every job is accounted for. Returns the
    /// finished document exactly once; later calls return `None`.
    pub fn try_finalize(&self) -> Option<BulkScan> {
        let mut inner = self.lock();
        if !inner.total_known || inner.bulk_scan.finished {
            return None;
        }
        let completed = inner.bulk_scan.completed_total();
        debug_assert!(
            completed <= inner.bulk_scan.job_total,
            "recorded more completions than jobs"
        );
        if completed == inner.bulk_scan.job_total {
            inner.bulk_scan.finish();
            Some(inner.bulk_scan.clone())
        } else {
            None
        }
    }

    pub fn is_finished(&self) -> bool {
        self.lock().bulk_scan.finished
    }

    pub fn snapshot(&self) -> BulkScan {
        self.lock().bulk_scan.clone()
    }
}
