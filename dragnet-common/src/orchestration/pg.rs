//! A transport implemented on top of two PostgreSQL tables.
//!
//! Jobs live in `scan_jobs` and are claimed with a `FOR UPDATE SKIP LOCKED`
//! update so that any number of workers can poll the same queue without
//! stepping on each other. Done notifications are appended to `scan_done`
//! and drained by the controller owning the bulk scan. The schema is in the
//! workspace `migrations/` directory.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::debug;

use super::{OrchestrationError, OrchestrationProvider};
use crate::job::{DeliveryTag, ScanJobDescription};
use crate::retry::{with_backoff, RetryPolicy};

pub struct PgQueueTransport {
    /// A name to identify this queue as multiple deployments may share the
    /// tables.
    queue: String,
    /// The identifier of the consumer dequeuing from this transport.
    consumer: String,
    pool: PgPool,
    prefetch: usize,
    in_flight: AtomicUsize,
    retry_policy: RetryPolicy,
    closed: AtomicBool,
}

impl PgQueueTransport {
    pub async fn connect(
        url: &str,
        queue: &str,
        consumer: &str,
        prefetch: usize,
        max_connections: u32,
        retry_policy: RetryPolicy,
    ) -> Result<Self, OrchestrationError> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| OrchestrationError::Connection { error })?
            .application_name("dragnet");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self {
            queue: queue.to_owned(),
            consumer: consumer.to_owned(),
            pool,
            prefetch: prefetch.max(1),
            in_flight: AtomicUsize::new(0),
            retry_policy,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), OrchestrationError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(OrchestrationError::Closed)
        } else {
            Ok(())
        }
    }

    /// Reset `running` rows whose consumer went silent for longer than the
    /// visibility timeout back to `available`. This is what makes a job held
    /// by a crashed worker redeliverable. Returns the number of rows reaped.
    pub async fn reap_stalled(&self, visibility: Duration) -> Result<u64, OrchestrationError> {
        let reaped = sqlx::query(
            r#"
UPDATE scan_jobs
SET
    status = 'available',
    delivery_tag = NULL
WHERE
    queue = $1
    AND status = 'running'
    AND attempted_at < NOW() - make_interval(secs => $2)
            "#,
        )
        .bind(&self.queue)
        .bind(visibility.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|error| OrchestrationError::Query {
            command: "UPDATE".to_owned(),
            error,
        })?
        .rows_affected();

        if reaped > 0 {
            debug!(reaped, "returned stalled scan jobs to the queue");
        }
        Ok(reaped)
    }
}

#[async_trait]
impl OrchestrationProvider for PgQueueTransport {
    async fn submit_job(&self, job: &ScanJobDescription) -> Result<(), OrchestrationError> {
        self.ensure_open()?;
        let payload =
            serde_json::to_value(job).map_err(|error| OrchestrationError::Encode {
                id: job.id,
                error,
            })?;

        // Submitting the same job id twice is a no-op: redundant submissions
        // after a controller retry must not duplicate work.
        let query = r#"
INSERT INTO scan_jobs
    (id, queue, status, payload, created_at)
VALUES
    ($1, $2, 'available', $3, NOW())
ON CONFLICT (id) DO NOTHING
        "#;

        let id = job.id;
        let queue = self.queue.as_str();
        let payload = &payload;
        let pool = &self.pool;
        with_backoff(&self.retry_policy, "submit_job", || async move {
            sqlx::query(query)
                .bind(id)
                .bind(queue)
                .bind(payload)
                .execute(pool)
                .await
                .map_err(|error| OrchestrationError::Query {
                    command: "INSERT".to_owned(),
                    error,
                })?;
            Ok(())
        })
        .await
    }

    async fn next_job(&self) -> Result<Option<ScanJobDescription>, OrchestrationError> {
        self.ensure_open()?;
        if self.in_flight.load(Ordering::SeqCst) >= self.prefetch {
            return Ok(None);
        }

        // The query that follows uses a FOR UPDATE SKIP LOCKED clause so
        // concurrent workers never claim the same row.
        let query = r#"
WITH available_in_queue AS (
    SELECT
        id
    FROM
        scan_jobs
    WHERE
        queue = $1
        AND status = 'available'
    ORDER BY
        created_at
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    scan_jobs
SET
    status = 'running',
    attempt = scan_jobs.attempt + 1,
    attempted_at = NOW(),
    attempted_by = array_append(scan_jobs.attempted_by, $2::text),
    delivery_tag = nextval('scan_delivery_tag_seq')
FROM
    available_in_queue
WHERE
    scan_jobs.id = available_in_queue.id
RETURNING
    scan_jobs.payload,
    scan_jobs.delivery_tag
        "#;

        let row: Option<(sqlx::types::Json<ScanJobDescription>, i64)> =
            sqlx::query_as(query)
                .bind(&self.queue)
                .bind(&self.consumer)
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| OrchestrationError::Query {
                    command: "UPDATE".to_owned(),
                    error,
                })?;

        match row {
            Some((sqlx::types::Json(mut job), tag)) => {
                job.set_delivery_tag(DeliveryTag::new(tag as u64));
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn notify_done(&self, job: &ScanJobDescription) -> Result<(), OrchestrationError> {
        self.ensure_open()?;
        let tag = job
            .delivery_tag()
            .ok_or(OrchestrationError::MissingDeliveryTag(job.id))?;
        let payload =
            serde_json::to_value(job).map_err(|error| OrchestrationError::Encode {
                id: job.id,
                error,
            })?;

        // Publishing the notification and acknowledging the delivery happen
        // in one transaction: both or neither.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| OrchestrationError::Connection { error })?;

        sqlx::query(
            r#"
INSERT INTO scan_done
    (bulk_scan_id, payload, created_at)
VALUES
    ($1, $2, NOW())
            "#,
        )
        .bind(&job.bulk_scan_info.bulk_scan_id)
        .bind(&payload)
        .execute(&mut *tx)
        .await
        .map_err(|error| OrchestrationError::Query {
            command: "INSERT".to_owned(),
            error,
        })?;

        sqlx::query(
            r#"
UPDATE scan_jobs
SET
    status = 'acked',
    acked_at = NOW()
WHERE
    delivery_tag = $1
    AND status = 'running'
            "#,
        )
        .bind(tag.value() as i64)
        .execute(&mut *tx)
        .await
        .map_err(|error| OrchestrationError::Query {
            command: "UPDATE".to_owned(),
            error,
        })?;

        tx.commit()
            .await
            .map_err(|error| OrchestrationError::Connection { error })?;

        // Saturating: an acknowledgement for a reaped delivery must not
        // underflow the prefetch window.
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            });
        Ok(())
    }

    async fn next_done(
        &self,
        bulk_scan_id: &str,
    ) -> Result<Vec<ScanJobDescription>, OrchestrationError> {
        self.ensure_open()?;
        let query = r#"
UPDATE scan_done
SET consumed = TRUE
WHERE tag IN (
    SELECT tag
    FROM scan_done
    WHERE bulk_scan_id = $1 AND consumed = FALSE
    ORDER BY tag
    LIMIT 256
    FOR UPDATE SKIP LOCKED
)
RETURNING payload
        "#;

        let rows: Vec<(sqlx::types::Json<ScanJobDescription>,)> = sqlx::query_as(query)
            .bind(bulk_scan_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| OrchestrationError::Query {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(rows.into_iter().map(|(sqlx::types::Json(job),)| job).collect())
    }

    async fn close(&self) -> Result<(), OrchestrationError> {
        self.closed.store(true, Ordering::SeqCst);
        self.pool.close().await;
        Ok(())
    }
}
