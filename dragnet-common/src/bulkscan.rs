//! Per-run (`BulkScan`) and per-job (`ScanResult`) store documents.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{JobStatus, ScanConfig, ScanJobDescription, ScanTarget};

/// One end-to-end run over a configured target list, owned by one controller
/// firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkScan {
    pub id: String,
    pub name: String,
    pub scan_config: ScanConfig,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Set once after target expansion; counts submitted jobs plus targets
    /// the controller terminated directly.
    pub job_total: u64,
    /// Grows monotonically as done-notifications arrive. Keys are terminal
    /// statuses.
    pub jobs_completed: BTreeMap<JobStatus, u64>,
    pub monitored: bool,
    pub finished: bool,
}

impl BulkScan {
    pub fn new(name: &str, scan_config: ScanConfig, monitored: bool) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            name: name.to_owned(),
            scan_config,
            start_time: Utc::now(),
            end_time: None,
            job_total: 0,
            jobs_completed: BTreeMap::new(),
            monitored,
            finished: false,
        }
    }

    pub fn record_completion(&mut self, status: JobStatus) {
        *self.jobs_completed.entry(status).or_insert(0) += 1;
    }

    pub fn completed_total(&self) -> u64 {
        self.jobs_completed.values().sum()
    }

    /// Mark the bulk scan finished. `finished` is monotone; calling this
    /// twice keeps the first end time.
    pub fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.end_time = Some(Utc::now());
        }
    }
}

/// The persisted outcome of a single scan job. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Equal to the job id, which makes duplicate writes idempotent.
    pub id: Uuid,
    pub bulk_scan_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: JobStatus,
    pub target: ScanTarget,
    pub result_document: serde_json::Value,
}

impl ScanResult {
    /// Build a result carrying the job's current status.
    pub fn for_job(job: &ScanJobDescription, result_document: serde_json::Value) -> Self {
        Self {
            id: job.id,
            bulk_scan_id: job.bulk_scan_info.bulk_scan_id.clone(),
            timestamp: Utc::now(),
            status: job.status,
            target: job.scan_target.clone(),
            result_document,
        }
    }

    /// A minimal result wrapping an error message, used when the real
    /// payload is unavailable or could not be stored.
    pub fn error_document(job: &ScanJobDescription, message: &str) -> Self {
        Self::for_job(job, serde_json::json!({ "error": message }))
    }
}
