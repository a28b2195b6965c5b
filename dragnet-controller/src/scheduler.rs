//! Cron and one-shot scheduling of bulk scan publications.
//!
//! The scheduler holds one job: publishing a bulk scan. It fires either
//! once after a fixed delay or repeatedly on a cron expression. When a
//! firing errors, or when no triggers remain, the scheduler shuts down.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::ControllerError;

/// When the scheduler's job fires.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Fire once, `delay` after the scheduler starts.
    Once { delay: Duration },
    /// Fire on every upcoming occurrence of the expression.
    Cron {
        expression: String,
        schedule: Schedule,
    },
}

impl Trigger {
    pub fn once_after(delay: Duration) -> Self {
        Trigger::Once { delay }
    }

    pub fn cron(expression: &str) -> Result<Self, ControllerError> {
        Ok(Trigger::Cron {
            expression: expression.to_owned(),
            schedule: Schedule::from_str(expression)?,
        })
    }

    fn describe(&self) -> String {
        match self {
            Trigger::Once { delay } => format!("once after {delay:?}"),
            Trigger::Cron { expression, .. } => format!("cron {expression}"),
        }
    }

    /// Time until the next firing, or `None` when the trigger is spent.
    fn time_to_next_fire(&self) -> Option<Duration> {
        match self {
            Trigger::Once { delay } => Some(*delay),
            Trigger::Cron { schedule, .. } => {
                let next = schedule.upcoming(Utc).next()?;
                (next - Utc::now()).to_std().ok().or(Some(Duration::ZERO))
            }
        }
    }
}

pub struct Scheduler {
    triggers: std::sync::Mutex<Vec<Trigger>>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(triggers: Vec<Trigger>) -> Self {
        Self {
            triggers: std::sync::Mutex::new(triggers),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn trigger_descriptions(&self) -> Vec<String> {
        self.triggers
            .lock()
            .expect("scheduler lock poisoned")
            .iter()
            .map(Trigger::describe)
            .collect()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run the schedule until shutdown: sleep to the next trigger, fire the
    /// job, drop spent one-shot triggers. A job error shuts the scheduler
    /// down and surfaces to the caller.
    pub async fn run<F, Fut>(&self, job: F) -> Result<(), ControllerError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<(), ControllerError>>,
    {
        self.started.store(true, Ordering::SeqCst);
        info!(triggers = ?self.trigger_descriptions(), "scheduler started");

        loop {
            // The soonest trigger decides the sleep; firing consumes
            // one-shot triggers.
            let next = {
                let triggers = self.triggers.lock().expect("scheduler lock poisoned");
                triggers
                    .iter()
                    .enumerate()
                    .filter_map(|(index, trigger)| {
                        trigger.time_to_next_fire().map(|delay| (index, delay))
                    })
                    .min_by_key(|(_, delay)| *delay)
            };

            let Some((index, delay)) = next else {
                info!("no triggers remain; scheduler shutting down");
                self.shutdown.cancel();
                return Ok(());
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("scheduler stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if let Err(job_error) = job().await {
                error!("scheduled bulk scan publication failed: {job_error}");
                self.shutdown.cancel();
                return Err(job_error);
            }

            let mut triggers = self.triggers.lock().expect("scheduler lock poisoned");
            if matches!(triggers.get(index), Some(Trigger::Once { .. })) {
                triggers.remove(index);
            }
            if triggers.is_empty() {
                drop(triggers);
                info!("all triggers fired; scheduler shutting down");
                self.shutdown.cancel();
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[tokio::test]
    async fn one_shot_trigger_fires_once_and_stops() {
        let scheduler = Scheduler::new(vec![Trigger::once_after(Duration::from_millis(10))]);
        assert!(!scheduler.is_started());

        let fired = Arc::new(AtomicU32::new(0));
        let fired_in_job = fired.clone();
        scheduler
            .run(move || {
                let fired = fired_in_job.clone();
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert!(scheduler.is_started());
        assert!(scheduler.is_shutdown());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(scheduler.trigger_descriptions().is_empty());
    }

    #[tokio::test]
    async fn job_error_shuts_the_scheduler_down() {
        let scheduler = Scheduler::new(vec![Trigger::once_after(Duration::from_millis(5))]);
        let result = scheduler
            .run(|| async {
                Err(ControllerError::Schedule(
                    Schedule::from_str("not a cron expression").unwrap_err(),
                ))
            })
            .await;

        assert!(result.is_err());
        assert!(scheduler.is_shutdown());
    }

    #[tokio::test]
    async fn cron_trigger_keeps_firing() {
        // Seconds-resolution expression: fires every second.
        let scheduler = Arc::new(Scheduler::new(vec![
            Trigger::cron("* * * * * *").unwrap()
        ]));
        let fired = Arc::new(AtomicU32::new(0));

        let run_scheduler = scheduler.clone();
        let fired_in_job = fired.clone();
        let run = tokio::spawn(async move {
            run_scheduler
                .run(move || {
                    let fired = fired_in_job.clone();
                    async move {
                        fired.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await
        });

        for _ in 0..100 {
            if fired.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(fired.load(Ordering::SeqCst) >= 2, "cron trigger should refire");
        assert_eq!(scheduler.trigger_descriptions().len(), 1);

        scheduler.shutdown();
        run.await.unwrap().unwrap();
    }

    #[test]
    fn invalid_cron_expressions_are_rejected() {
        assert!(Trigger::cron("definitely not cron").is_err());
        assert!(Trigger::cron("0 0 3 * * *").is_ok());
    }
}
