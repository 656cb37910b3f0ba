//! Cron scheduling for `cron` workflow triggers.
//!
//! Wraps `tokio-cron-scheduler`. Schedules may be 5/6-field cron expressions
//! or short English phrases ("every day at 06:00"), normalized to 6-field
//! cron. Missed runs are detected with `croner`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler error: {0}")]
    Job(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("no cron job registered for definition {0}")]
    NotScheduled(Uuid),
}

// ---------------------------------------------------------------------------
// Schedule normalization
// ---------------------------------------------------------------------------

/// Normalize a schedule string to a 6-field cron expression (with seconds).
///
/// Accepted, case-insensitive:
/// - 5-field cron (seconds field `0` is prepended) or 6-field cron
/// - "every minute" / "minutely", "every hour" / "hourly", "every day" / "daily"
/// - "every N seconds|minutes|hours"
/// - "every day at HH:MM"
/// - "every weekday at HH:MM" (Monday to Friday)
/// - "every month" / "monthly" (first day of the month, midnight)
///
/// The result is parsed with `croner`, so a malformed expression is rejected
/// here rather than when the job is added.
pub fn normalize_schedule(input: &str) -> Result<String, SchedulerError> {
    let expr = to_cron(input)?;
    expr.parse::<croner::Cron>()
        .map_err(|e| SchedulerError::InvalidSchedule(format!("{input}: {e}")))?;
    Ok(expr)
}

fn to_cron(input: &str) -> Result<String, SchedulerError> {
    let trimmed = input.trim();
    let invalid = || SchedulerError::InvalidSchedule(input.to_string());

    match trimmed.split_whitespace().count() {
        5 => return Ok(format!("0 {trimmed}")),
        6 => return Ok(trimmed.to_string()),
        _ => {}
    }

    let lower = trimmed.to_lowercase();
    match lower.as_str() {
        "every minute" | "minutely" => return Ok("0 * * * * *".to_string()),
        "every hour" | "hourly" => return Ok("0 0 * * * *".to_string()),
        "every day" | "daily" => return Ok("0 0 0 * * *".to_string()),
        "every month" | "monthly" => return Ok("0 0 0 1 * *".to_string()),
        _ => {}
    }

    let rest = lower.strip_prefix("every ").ok_or_else(invalid)?;
    if let Some(at) = rest.strip_prefix("day at ") {
        let (hour, minute) = parse_clock(at).ok_or_else(invalid)?;
        return Ok(format!("0 {minute} {hour} * * *"));
    }
    if let Some(at) = rest.strip_prefix("weekday at ") {
        let (hour, minute) = parse_clock(at).ok_or_else(invalid)?;
        return Ok(format!("0 {minute} {hour} * * Mon-Fri"));
    }

    let words: Vec<&str> = rest.split_whitespace().collect();
    let [count, unit] = words.as_slice() else {
        return Err(invalid());
    };
    let n: u32 = count.parse().map_err(|_| invalid())?;
    if n == 0 {
        return Err(SchedulerError::InvalidSchedule(
            "interval must be > 0".to_string(),
        ));
    }
    match unit.trim_end_matches('s') {
        "second" => Ok(format!("*/{n} * * * * *")),
        "minute" => Ok(format!("0 */{n} * * * *")),
        "hour" => Ok(format!("0 0 */{n} * * *")),
        _ => Err(invalid()),
    }
}

fn parse_clock(text: &str) -> Option<(u32, u32)> {
    let (hour, minute) = text.trim().split_once(':')?;
    let hour: u32 = hour.trim().parse().ok()?;
    let minute: u32 = minute.trim().parse().ok()?;
    (hour < 24 && minute < 60).then_some((hour, minute))
}

/// Scheduled occurrences strictly after `since` and before `now`.
pub fn missed_runs(
    schedule: &str,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
    let expr = normalize_schedule(schedule)?;
    let cron = expr
        .parse::<croner::Cron>()
        .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;
    Ok(cron
        .iter_after(since)
        .take_while(|at| *at < now)
        .collect())
}

// ---------------------------------------------------------------------------
// CronScheduler
// ---------------------------------------------------------------------------

/// Invoked with the definition id and fire time whenever a job fires.
pub type CronCallback = Arc<dyn Fn(Uuid, DateTime<Utc>) -> BoxFuture<'static, ()> + Send + Sync>;

struct ScheduledJob {
    job_id: Uuid,
    schedule: String,
    last_fired: Arc<std::sync::Mutex<Option<DateTime<Utc>>>>,
}

/// Per-definition cron jobs on top of a `JobScheduler`.
pub struct CronScheduler {
    inner: RwLock<Option<JobScheduler>>,
    jobs: RwLock<HashMap<Uuid, Vec<ScheduledJob>>>,
}

impl CronScheduler {
    /// Create a scheduler; call `start` before scheduling.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::Job(e.to_string()))?;
        scheduler
            .start()
            .await
            .map_err(|e| SchedulerError::Job(e.to_string()))?;
        *self.inner.write().await = Some(scheduler);
        tracing::info!("cron scheduler started");
        Ok(())
    }

    /// Shut the scheduler down and forget every job.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if let Some(mut scheduler) = self.inner.write().await.take() {
            scheduler
                .shutdown()
                .await
                .map_err(|e| SchedulerError::Job(e.to_string()))?;
            tracing::info!("cron scheduler stopped");
        }
        self.jobs.write().await.clear();
        Ok(())
    }

    /// Add a job for `definition_id`. A definition may carry several.
    pub async fn schedule(
        &self,
        definition_id: Uuid,
        schedule: &str,
        callback: CronCallback,
    ) -> Result<(), SchedulerError> {
        let cron_expr = normalize_schedule(schedule)?;
        let inner = self.inner.read().await;
        let scheduler = inner
            .as_ref()
            .ok_or_else(|| SchedulerError::Job("scheduler not started".to_string()))?;

        let last_fired = Arc::new(std::sync::Mutex::new(None));
        let fired = Arc::clone(&last_fired);
        let job = Job::new_async(cron_expr.as_str(), move |_job_id, _lock| {
            let callback = Arc::clone(&callback);
            let fired = Arc::clone(&fired);
            Box::pin(async move {
                let now = Utc::now();
                if let Ok(mut last) = fired.lock() {
                    *last = Some(now);
                }
                tracing::debug!(%definition_id, fired_at = %now, "cron trigger fired");
                callback(definition_id, now).await;
            })
        })
        .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;

        let job_id = job.guid();
        scheduler
            .add(job)
            .await
            .map_err(|e| SchedulerError::Job(e.to_string()))?;
        self.jobs
            .write()
            .await
            .entry(definition_id)
            .or_default()
            .push(ScheduledJob {
                job_id,
                schedule: cron_expr.clone(),
                last_fired,
            });
        tracing::info!(%definition_id, %job_id, cron = %cron_expr, "cron trigger scheduled");
        Ok(())
    }

    /// Remove every job of `definition_id`.
    pub async fn unschedule(&self, definition_id: Uuid) -> Result<(), SchedulerError> {
        let jobs = self
            .jobs
            .write()
            .await
            .remove(&definition_id)
            .ok_or(SchedulerError::NotScheduled(definition_id))?;
        if let Some(scheduler) = self.inner.read().await.as_ref() {
            for job in jobs {
                scheduler
                    .remove(&job.job_id)
                    .await
                    .map_err(|e| SchedulerError::Job(e.to_string()))?;
            }
        }
        tracing::info!(%definition_id, "cron triggers removed");
        Ok(())
    }

    /// Occurrences that should have fired since each job's last recorded
    /// fire but did not (e.g. the runtime was stalled or suspended).
    pub async fn check_missed_runs(&self, now: DateTime<Utc>) -> Vec<(Uuid, Vec<DateTime<Utc>>)> {
        let jobs = self.jobs.read().await;
        let mut missed = Vec::new();
        for (definition_id, scheduled) in jobs.iter() {
            for job in scheduled {
                let since = job.last_fired.lock().ok().and_then(|last| *last);
                let Some(since) = since else {
                    continue;
                };
                let Ok(times) = missed_runs(&job.schedule, since, now) else {
                    continue;
                };
                if !times.is_empty() {
                    tracing::warn!(%definition_id, count = times.len(), "detected missed cron runs");
                    missed.push((*definition_id, times));
                }
            }
        }
        missed
    }

    /// Number of definitions with at least one job.
    pub async fn scheduled_count(&self) -> usize {
        self.jobs.read().await.len()
    }
}

impl Default for CronScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    // -------------------------------------------------------------------
    // normalize_schedule
    // -------------------------------------------------------------------

    #[test]
    fn test_normalize_cron_expressions() {
        assert_eq!(normalize_schedule("0 6 * * 1").unwrap(), "0 0 6 * * 1");
        assert_eq!(normalize_schedule("30 */5 * * * *").unwrap(), "30 */5 * * * *");
    }

    #[test]
    fn test_normalize_phrases() {
        assert_eq!(normalize_schedule("Every 5 Minutes").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize_schedule("every 1 hour").unwrap(), "0 0 */1 * * *");
        assert_eq!(normalize_schedule("hourly").unwrap(), "0 0 * * * *");
        assert_eq!(normalize_schedule("monthly").unwrap(), "0 0 0 1 * *");
        assert_eq!(normalize_schedule("every day at 06:00").unwrap(), "0 0 6 * * *");
        assert_eq!(
            normalize_schedule("every weekday at 9:30").unwrap(),
            "0 30 9 * * Mon-Fri"
        );
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_schedule("whenever payroll feels like it").is_err());
        assert!(normalize_schedule("0 99 * * *").is_err());
        assert!(normalize_schedule("a b c d e f").is_err());
        assert!(normalize_schedule("every 0 minutes").is_err());
        assert!(normalize_schedule("every day at 25:00").is_err());
        assert!(normalize_schedule("every 3 fortnights").is_err());
    }

    // -------------------------------------------------------------------
    // missed_runs
    // -------------------------------------------------------------------

    #[test]
    fn test_missed_runs_between_bounds() {
        let since = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 30).unwrap();
        let now = since + Duration::minutes(10);
        let missed = missed_runs("every minute", since, now).unwrap();
        assert_eq!(missed.len(), 10);
        assert_eq!(missed[0], Utc.with_ymd_and_hms(2030, 1, 1, 0, 1, 0).unwrap());
    }

    #[test]
    fn test_no_missed_runs_inside_one_period() {
        let since = Utc.with_ymd_and_hms(2030, 1, 1, 6, 0, 0).unwrap();
        let now = since + Duration::hours(3);
        assert!(missed_runs("every day at 06:00", since, now).unwrap().is_empty());
    }

    // -------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_schedule_requires_started_scheduler() {
        let scheduler = CronScheduler::new();
        let cb: CronCallback = Arc::new(|_, _| Box::pin(async {}));
        assert!(scheduler.schedule(Uuid::now_v7(), "daily", cb).await.is_err());
    }

    #[tokio::test]
    async fn test_schedule_and_unschedule() {
        let scheduler = CronScheduler::new();
        scheduler.start().await.unwrap();
        let id = Uuid::now_v7();
        let cb: CronCallback = Arc::new(|_, _| Box::pin(async {}));

        scheduler.schedule(id, "every 5 minutes", cb.clone()).await.unwrap();
        scheduler.schedule(id, "0 6 1 * *", cb).await.unwrap();
        assert_eq!(scheduler.scheduled_count().await, 1);
        assert!(scheduler.check_missed_runs(Utc::now()).await.is_empty());

        scheduler.unschedule(id).await.unwrap();
        assert_eq!(scheduler.scheduled_count().await, 0);
        assert!(matches!(
            scheduler.unschedule(id).await,
            Err(SchedulerError::NotScheduled(_))
        ));
        scheduler.stop().await.unwrap();
    }
}
