//! Daily floor replenishment, driven by the cron scheduler.
//!
//! Each sweep is keyed by the calendar day in the configured offset, so the
//! cron tick, a startup catch-up run, and a manual `alice replenish` all
//! collapse into one application per day.

use alice_store::{CreditLedger, ReplenishOutcome, ReplenishStats, StoreResult};
use chrono::{DateTime, FixedOffset, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::SchedulerError;
use crate::scheduler::{CronEvent, CronScheduler};

/// Scheduler job id of the sweep.
pub const REPLENISH_JOB_ID: &str = "daily-replenish";

#[derive(Clone)]
pub struct ReplenishJob {
    ledger: CreditLedger,
    floor: i64,
    offset: FixedOffset,
}

impl ReplenishJob {
    pub fn new(ledger: CreditLedger, floor: i64, offset: FixedOffset) -> Self {
        Self {
            ledger,
            floor,
            offset,
        }
    }

    pub fn floor(&self) -> i64 {
        self.floor
    }

    /// `YYYY-MM-DD` of `now` in the configured offset.
    pub fn day_key(&self, now: DateTime<Utc>) -> String {
        now.with_timezone(&self.offset).format("%Y-%m-%d").to_string()
    }

    /// Apply the sweep for the day containing `now`, unless already applied.
    pub async fn run_once(&self, now: DateTime<Utc>) -> StoreResult<ReplenishOutcome> {
        self.ledger
            .replenish_for_day(&self.day_key(now), self.floor)
            .await
    }

    /// Sweep regardless of the day marker.
    pub async fn force(&self) -> StoreResult<ReplenishStats> {
        self.ledger.daily_replenish_floor(self.floor).await
    }
}

/// Consume cron events and run the sweep for each replenish tick.
pub fn spawn_replenish_worker(
    job: ReplenishJob,
    mut events: mpsc::UnboundedReceiver<CronEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if event.job_id != REPLENISH_JOB_ID {
                continue;
            }
            match job.run_once(event.fired_at).await {
                Ok(ReplenishOutcome::Ran(stats)) => info!(
                    replenished = stats.accounts_replenished,
                    added = stats.credits_added,
                    "scheduled replenishment done"
                ),
                Ok(ReplenishOutcome::AlreadyRan) => {
                    info!("scheduled replenishment skipped, already applied today")
                }
                Err(e) => error!(error = %e, "scheduled replenishment failed"),
            }
        }
        info!("replenish worker stopped");
    })
}

/// Register the sweep on `scheduler`, start it, and spawn the worker.
pub async fn start_daily_replenish(
    scheduler: &mut CronScheduler,
    job: ReplenishJob,
    cron_expr: &str,
) -> Result<JoinHandle<()>, SchedulerError> {
    scheduler
        .add_job(REPLENISH_JOB_ID, "daily credit replenishment", cron_expr)
        .await?;
    let (tx, rx) = mpsc::unbounded_channel();
    scheduler.start(tx)?;
    Ok(spawn_replenish_worker(job, rx))
}

#[cfg(test)]
mod tests {
    use alice_store::Database;
    use chrono::TimeZone;

    use super::*;

    async fn setup() -> (ReplenishJob, CreditLedger) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let ledger = CreditLedger::new(db, 10);
        let job = ReplenishJob::new(ledger.clone(), 10, FixedOffset::east_opt(3 * 3600).unwrap());
        (job, ledger)
    }

    #[tokio::test]
    async fn day_key_uses_the_offset() {
        let (job, _) = setup().await;
        let late_utc = Utc.with_ymd_and_hms(2026, 10, 16, 22, 30, 0).unwrap();
        assert_eq!(job.day_key(late_utc), "2026-10-17");
        let early_utc = Utc.with_ymd_and_hms(2026, 10, 16, 20, 59, 59).unwrap();
        assert_eq!(job.day_key(early_utc), "2026-10-16");
    }

    #[tokio::test]
    async fn once_per_day_but_force_always_runs() {
        let (job, ledger) = setup().await;
        ledger.initialize_if_absent(1).await.unwrap();
        for _ in 0..10 {
            ledger.debit_one(1).await.unwrap();
        }

        let day = Utc.with_ymd_and_hms(2026, 10, 16, 21, 0, 0).unwrap();
        assert!(matches!(job.run_once(day).await.unwrap(), ReplenishOutcome::Ran(_)));
        assert_eq!(ledger.get_balance(1).await.unwrap(), 10);

        ledger.debit_one(1).await.unwrap();
        assert_eq!(job.run_once(day).await.unwrap(), ReplenishOutcome::AlreadyRan);
        assert_eq!(ledger.get_balance(1).await.unwrap(), 9);

        let stats = job.force().await.unwrap();
        assert_eq!(stats.credits_added, 1);
        assert_eq!(ledger.get_balance(1).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn worker_runs_on_replenish_events_only() {
        let (job, ledger) = setup().await;
        ledger.initialize_if_absent(1).await.unwrap();
        ledger.debit_one(1).await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = spawn_replenish_worker(job, rx);

        let fired_at = Utc.with_ymd_and_hms(2026, 10, 16, 21, 0, 0).unwrap();
        tx.send(CronEvent {
            job_id: "something-else".into(),
            job_name: "other".into(),
            fired_at,
        })
        .unwrap();
        tx.send(CronEvent {
            job_id: REPLENISH_JOB_ID.into(),
            job_name: "daily".into(),
            fired_at,
        })
        .unwrap();
        drop(tx);
        worker.await.unwrap();

        assert_eq!(ledger.get_balance(1).await.unwrap(), 10);
    }
}
