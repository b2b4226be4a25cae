//! Background cron scheduler.
//!
//! [`CronScheduler`] keeps a list of recurring jobs and sends a [`CronEvent`]
//! through a tokio channel whenever one is due. Expressions are evaluated in
//! a fixed UTC offset, so `0 0 * * *` means local midnight of that offset.
//! Five-field input is normalized by prepending a `0` seconds field.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, warn};

use crate::error::SchedulerError;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A recurring job registered with the [`CronScheduler`].
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    /// Identifier carried on every [`CronEvent`] the job emits.
    pub id: String,
    /// Human-readable name, used in logs.
    pub name: String,
    /// Parsed cron schedule, evaluated in the scheduler's UTC offset.
    pub schedule: cron::Schedule,
    /// When the job last fired, if ever.
    pub last_run: Option<DateTime<Utc>>,
    /// Next time the job is due. `None` once the schedule is exhausted.
    pub next_run: Option<DateTime<Utc>>,
}

/// Sent through the event channel when a job fires.
#[derive(Debug, Clone)]
pub struct CronEvent {
    /// The [`ScheduledJob::id`] of the job that fired.
    pub job_id: String,
    /// The [`ScheduledJob::name`] of the job that fired.
    pub job_name: String,
    /// Scheduler tick at which the job was found due.
    pub fired_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn normalize_cron_expr(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Parse a 5-, 6- or 7-field cron expression.
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule, SchedulerError> {
    cron::Schedule::from_str(&normalize_cron_expr(expr)).map_err(|e| {
        SchedulerError::InvalidCronExpression {
            expression: expr.to_string(),
            reason: e.to_string(),
        }
    })
}

/// Next occurrence strictly after `after`, evaluated in `offset`.
pub fn next_run_after(
    schedule: &cron::Schedule,
    offset: FixedOffset,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&offset))
        .next()
        .map(|next| next.with_timezone(&Utc))
}

/// Fire every job due at `now`, advancing its `next_run`.
fn fire_due(
    jobs: &mut [ScheduledJob],
    offset: FixedOffset,
    now: DateTime<Utc>,
    event_tx: &mpsc::UnboundedSender<CronEvent>,
) -> usize {
    let mut fired = 0;
    for job in jobs.iter_mut() {
        if !job.next_run.is_some_and(|next| next <= now) {
            continue;
        }

        debug!(job_id = %job.id, job_name = %job.name, "cron job fired");
        let event = CronEvent {
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            fired_at: now,
        };
        if let Err(e) = event_tx.send(event) {
            error!(job_id = %job.id, error = %e, "failed to send cron event");
        }

        job.last_run = Some(now);
        job.next_run = next_run_after(&job.schedule, offset, now);
        fired += 1;
    }
    fired
}

// ---------------------------------------------------------------------------
// CronScheduler
// ---------------------------------------------------------------------------

/// Checks jobs every second and emits [`CronEvent`]s when they are due.
pub struct CronScheduler {
    offset: FixedOffset,
    jobs: Arc<RwLock<Vec<ScheduledJob>>>,
    running: Arc<AtomicBool>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl CronScheduler {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            offset,
            jobs: Arc::new(RwLock::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Register a job. The expression is validated immediately.
    pub async fn add_job(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        cron_expr: &str,
    ) -> Result<(), SchedulerError> {
        let id = id.into();
        let name = name.into();
        let schedule = parse_schedule(cron_expr)?;
        let next_run = next_run_after(&schedule, self.offset, Utc::now());

        info!(job_id = %id, job_name = %name, cron = %cron_expr, next_run = ?next_run, "adding cron job");

        self.jobs.write().await.push(ScheduledJob {
            id,
            name,
            schedule,
            last_run: None,
            next_run,
        });
        Ok(())
    }

    /// Start the once-a-second loop.
    pub fn start(
        &mut self,
        event_tx: mpsc::UnboundedSender<CronEvent>,
    ) -> Result<(), SchedulerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let running = Arc::clone(&self.running);
        let jobs = Arc::clone(&self.jobs);
        let offset = self.offset;

        self.handle = Some(tokio::spawn(async move {
            info!(%offset, "cron scheduler started");
            while running.load(Ordering::SeqCst) {
                {
                    let mut job_list = jobs.write().await;
                    fire_due(&mut job_list, offset, Utc::now(), &event_tx);
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            info!("cron scheduler stopped");
        }));
        Ok(())
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("stop called but scheduler is not running");
            return;
        }

        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            error!(error = %e, "scheduler task panicked during shutdown");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn kyiv() -> FixedOffset {
        FixedOffset::east_opt(3 * 3600).unwrap()
    }

    fn job(expr: &str, next_run: Option<DateTime<Utc>>) -> ScheduledJob {
        ScheduledJob {
            id: "j".into(),
            name: "job".into(),
            schedule: parse_schedule(expr).unwrap(),
            last_run: None,
            next_run,
        }
    }

    #[test]
    fn five_and_six_field_expressions_parse() {
        assert!(parse_schedule("0 0 * * *").is_ok());
        assert!(parse_schedule("0 30 9 * * 1-5").is_ok());
        assert!(matches!(
            parse_schedule("not a cron"),
            Err(SchedulerError::InvalidCronExpression { .. })
        ));
    }

    #[test]
    fn midnight_is_evaluated_in_the_offset() {
        let schedule = parse_schedule("0 0 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();
        let next = next_run_after(&schedule, kyiv(), after).unwrap();
        // 00:00 at +03:00 is 21:00 UTC the previous day.
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 10, 16, 21, 0, 0).unwrap());
    }

    #[test]
    fn due_jobs_fire_once_and_advance() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let due = Utc.with_ymd_and_hms(2026, 10, 16, 21, 0, 0).unwrap();
        let mut jobs = vec![job("0 0 * * *", Some(due))];

        let before = due - chrono::Duration::seconds(1);
        assert_eq!(fire_due(&mut jobs, kyiv(), before, &tx), 0);

        assert_eq!(fire_due(&mut jobs, kyiv(), due, &tx), 1);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.job_id, "j");
        assert_eq!(event.fired_at, due);
        assert_eq!(jobs[0].last_run, Some(due));
        assert_eq!(jobs[0].next_run, Some(due + chrono::Duration::days(1)));

        assert_eq!(fire_due(&mut jobs, kyiv(), due, &tx), 0);
    }

    #[tokio::test]
    async fn add_job_validates_and_schedules() {
        let scheduler = CronScheduler::new(kyiv());
        scheduler.add_job("a", "first", "* * * * *").await.unwrap();
        assert!(scheduler.add_job("b", "bad", "nope").await.is_err());

        let jobs = scheduler.jobs.read().await;
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].next_run.is_some_and(|next| next > Utc::now()));
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut scheduler = CronScheduler::new(kyiv());

        scheduler.start(tx.clone()).unwrap();
        assert!(matches!(
            scheduler.start(tx.clone()),
            Err(SchedulerError::AlreadyRunning)
        ));

        scheduler.stop().await;
        assert!(scheduler.handle.is_none());
        scheduler.start(tx).unwrap();
        scheduler.stop().await;
    }
}
