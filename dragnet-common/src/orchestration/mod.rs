//! The durable, at-least-once job transport between controller and workers.
//!
//! Two logical streams exist per deployment: a *job* stream fanned out to
//! workers and a *done-notification* stream consumed by the controller that
//! owns each bulk scan. Delivery is at-least-once; a worker that crashes
//! between dequeuing and acknowledging causes redelivery. Idempotent result
//! writes keyed by the stable job id make the duplicates harmless.

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::job::ScanJobDescription;

/// Enumeration of errors for operations on the orchestration transport.
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("connection failed with: {error}")]
    Connection {
        #[source]
        error: sqlx::Error,
    },
    #[error("{command} query failed with: {error}")]
    Query {
        command: String,
        #[source]
        error: sqlx::Error,
    },
    #[error("failed to encode job {id}: {error}")]
    Encode {
        id: Uuid,
        #[source]
        error: serde_json::Error,
    },
    #[error("failed to decode a job payload: {error}")]
    Decode {
        #[source]
        error: serde_json::Error,
    },
    #[error("job {0} carries no delivery tag to acknowledge")]
    MissingDeliveryTag(Uuid),
    #[error("the transport connection is closed")]
    Closed,
}

/// A durable bidirectional queue: jobs flow controller → worker, done
/// notifications flow worker → controller.
#[async_trait]
pub trait OrchestrationProvider: Send + Sync {
    /// Enqueue a job. Must survive broker and consumer restarts. Transient
    /// failures are retried internally with exponential backoff; once the
    /// retry budget is exhausted the error reaches the caller and is fatal
    /// for the enclosing bulk scan attempt.
    async fn submit_job(&self, job: &ScanJobDescription) -> Result<(), OrchestrationError>;

    /// Dequeue the next job, assigning its delivery tag. Returns `None` when
    /// no job is ready or when this consumer already holds its configured
    /// prefetch budget of unacknowledged deliveries.
    async fn next_job(&self) -> Result<Option<ScanJobDescription>, OrchestrationError>;

    /// Publish the job's terminal status on the done stream of its bulk scan
    /// and acknowledge the delivery. Both happen or neither does; after a
    /// failure the job is redelivered and the notification sent again, so
    /// done consumers must tolerate duplicates.
    async fn notify_done(&self, job: &ScanJobDescription) -> Result<(), OrchestrationError>;

    /// Drain pending done notifications for one bulk scan.
    async fn next_done(
        &self,
        bulk_scan_id: &str,
    ) -> Result<Vec<ScanJobDescription>, OrchestrationError>;

    /// Release resources. Outstanding unacknowledged jobs become
    /// redeliverable.
    async fn close(&self) -> Result<(), OrchestrationError>;
}
