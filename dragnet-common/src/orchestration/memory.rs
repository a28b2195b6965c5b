//! An in-process transport for tests and single-process runs.
//!
//! Semantics mirror the Postgres transport: manual acknowledgement, a
//! prefetch bound on unacknowledged deliveries, and redelivery of jobs whose
//! consumer disappeared.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{OrchestrationError, OrchestrationProvider};
use crate::job::{DeliveryTag, ScanJobDescription};

#[derive(Default)]
struct Inner {
    ready: VecDeque<ScanJobDescription>,
    unacked: HashMap<u64, ScanJobDescription>,
    done: HashMap<String, VecDeque<ScanJobDescription>>,
}

pub struct MemoryTransport {
    inner: Mutex<Inner>,
    prefetch: usize,
    tag_counter: AtomicU64,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new(prefetch: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            prefetch: prefetch.max(1),
            tag_counter: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory transport lock poisoned")
    }

    fn ensure_open(&self) -> Result<(), OrchestrationError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(OrchestrationError::Closed)
        } else {
            Ok(())
        }
    }

    /// Push all unacknowledged deliveries back onto the ready queue, as a
    /// broker would after losing the consumer connection.
    pub fn redeliver_unacked(&self) {
        let mut inner = self.lock();
        let unacked: Vec<ScanJobDescription> = inner.unacked.drain().map(|(_, j)| j).collect();
        for job in unacked {
            inner.ready.push_front(job);
        }
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }
}

#[async_trait]
impl OrchestrationProvider for MemoryTransport {
    async fn submit_job(&self, job: &ScanJobDescription) -> Result<(), OrchestrationError> {
        self.ensure_open()?;
        // Mimic the wire: a queued job carries no delivery tag.
        let mut queued = job.clone();
        queued.strip_delivery_tag();
        self.lock().ready.push_back(queued);
        Ok(())
    }

    async fn next_job(&self) -> Result<Option<ScanJobDescription>, OrchestrationError> {
        self.ensure_open()?;
        let mut inner = self.lock();
        if inner.unacked.len() >= self.prefetch {
            return Ok(None);
        }
        match inner.ready.pop_front() {
            Some(job) => {
                let tag = self.tag_counter.fetch_add(1, Ordering::SeqCst);
                // Keep the undelivered form for redelivery; the caller gets
                // a tagged copy.
                inner.unacked.insert(tag, job.clone());
                let mut delivered = job;
                delivered.set_delivery_tag(DeliveryTag::new(tag));
                Ok(Some(delivered))
            }
            None => Ok(None),
        }
    }

    async fn notify_done(&self, job: &ScanJobDescription) -> Result<(), OrchestrationError> {
        self.ensure_open()?;
        let tag = job
            .delivery_tag()
            .ok_or(OrchestrationError::MissingDeliveryTag(job.id))?;
        let mut inner = self.lock();
        inner
            .done
            .entry(job.bulk_scan_info.bulk_scan_id.clone())
            .or_default()
            .push_back(job.clone());
        inner.unacked.remove(&tag.value());
        Ok(())
    }

    async fn next_done(
        &self,
        bulk_scan_id: &str,
    ) -> Result<Vec<ScanJobDescription>, OrchestrationError> {
        self.ensure_open()?;
        let mut inner = self.lock();
        Ok(inner
            .done
            .get_mut(bulk_scan_id)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default())
    }

    async fn close(&self) -> Result<(), OrchestrationError> {
        self.closed.store(true, Ordering::SeqCst);
        self.redeliver_unacked();
        Ok(())
    }
}
