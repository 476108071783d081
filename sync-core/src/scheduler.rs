//! Scheduler (C7, §4.6): a fixed periodic tick over enabled jobs, deciding
//! per-job "is this due" against the job's own cron + IANA timezone, and
//! handing due jobs off to the runtime over a channel.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::gateway::{ConfigStoreGateway, GatewayError};
use crate::id::Id;
use crate::model::SyncJob;

#[derive(Debug, Clone, Copy)]
pub struct ExecuteEvent {
    pub job_id: Id,
    pub manual: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Parses `cron_expr` (standard 5-field `m h dom mon dow`) and timezone,
/// then decides whether the job is due: the first occurrence strictly after
/// `last_run_at` (or epoch) falls at or before `now`. This also catches
/// missed occurrences — if several periods elapsed since the last run, the
/// earliest of them is still `<= now` and the job is due (§4.6 step 3).
pub fn is_due(cron_expr: &str, tz: Tz, last_run_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<bool, cron::error::Error> {
    // The `cron` crate parses Quartz-style 6/7-field expressions; a
    // standard 5-field spec maps onto it with a leading `0` seconds field.
    let schedule = Schedule::from_str(&format!("0 {cron_expr}"))?;
    let now_tz = now.with_timezone(&tz);
    let last_tz = last_run_at.unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap()).with_timezone(&tz);
    Ok(schedule.after(&last_tz).next().is_some_and(|next| next <= now_tz))
}

fn resolve_timezone(name: &str) -> Tz {
    name.parse().unwrap_or_else(|_| {
        log::warn!("unrecognized timezone `{name}`, falling back to UTC");
        chrono_tz::UTC
    })
}

async fn evaluate_job(job: &SyncJob, now: DateTime<Utc>) -> bool {
    let tz = resolve_timezone(&job.schedule.timezone);
    match is_due(&job.schedule.cron, tz, job.last_run_at, now) {
        Ok(due) => due,
        Err(e) => {
            log::error!("job {} has an invalid cron expression `{}`: {e}", job.id, job.schedule.cron);
            false
        }
    }
}

/// One tick (§4.6 steps 1-4): loads enabled jobs, emits `ExecuteEvent` for
/// each due one with a cumulative 0-5s scheduling jitter between them.
pub async fn tick_once(gateway: &ConfigStoreGateway, tx: &mpsc::Sender<ExecuteEvent>) -> Result<(), SchedulerError> {
    let jobs = gateway.list_enabled_jobs().await?;
    let now = Utc::now();
    for job in jobs {
        if evaluate_job(&job, now).await {
            let jitter_ms = rand::thread_rng().r#gen::<u64>() % 5_000;
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            if tx.send(ExecuteEvent { job_id: job.id, manual: false }).await.is_err() {
                log::warn!("job {} due but runtime channel is closed; will retry next tick", job.id);
            }
        }
    }
    Ok(())
}

/// Spawns the tick loop at `tick_interval` (design default 60s, §6
/// `SYNCD_TICK_SECS`).
pub fn spawn(gateway: Arc<ConfigStoreGateway>, tx: mpsc::Sender<ExecuteEvent>, tick_interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = tick_once(&gateway, &tx).await {
                log::error!("scheduler tick failed: {e}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn due_when_never_run_and_cron_matches_past() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        // every day at 09:00
        assert!(is_due("0 9 * * *", chrono_tz::UTC, None, now).unwrap());
    }

    #[test]
    fn not_due_before_first_occurrence() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 59, 0).unwrap();
        assert!(!is_due("0 9 * * *", chrono_tz::UTC, None, now).unwrap());
    }

    #[test]
    fn not_due_again_immediately_after_last_run() {
        let last = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap();
        assert!(!is_due("0 9 * * *", chrono_tz::UTC, Some(last), now).unwrap());
    }

    #[test]
    fn catches_missed_occurrence_after_downtime() {
        let last = Utc.with_ymd_and_hms(2024, 5, 30, 9, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        assert!(is_due("0 9 * * *", chrono_tz::UTC, Some(last), now).unwrap());
    }

    #[test]
    fn invalid_cron_expression_is_an_error() {
        assert!(is_due("not a cron", chrono_tz::UTC, None, Utc::now()).is_err());
    }
}
