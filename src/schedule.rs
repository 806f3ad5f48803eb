use std::{
    collections::BTreeMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{
    collect::contract::Frequency,
    config::ReleaseCalendars,
    error::{CropcastResult, ScheduleError},
};

// ================================================================================================
// Scheduled Tasks
// ================================================================================================

/// One scheduled data pull. `next_run` is recomputed after every execution
/// from the frequency rule; the invariant `next_run > last_run` holds for
/// every enabled task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    pub source: String,
    pub description: String,
    pub frequency: Frequency,
    pub day_of_month: u32,
    pub day_of_week: u32,
    pub hour: u32,
    pub minute: u32,
    pub enabled: bool,
    /// Release days are local to the publishing agency.
    pub timezone: String,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Day offsets retried after a release-day miss before a failure counts.
    pub retry_offsets: Vec<i64>,
    pub retries_used: usize,
}

impl ScheduledTask {
    fn monthly(
        task_id: &str,
        source: &str,
        day_of_month: u32,
        timezone: &str,
        retry_offsets: Vec<i64>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            source: source.to_string(),
            description: format!("Monthly data pull for {source}"),
            frequency: Frequency::Monthly,
            day_of_month,
            day_of_week: 0,
            hour: 8,
            minute: 0,
            enabled: true,
            timezone: timezone.to_string(),
            last_run: None,
            last_success: None,
            next_run: None,
            consecutive_failures: 0,
            retry_offsets,
            retries_used: 0,
        }
    }
}

/// Outcome the control loop records for one execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskOutcome {
    pub success: bool,
    /// The upstream has not published the target period yet.
    pub not_published: bool,
    pub records_loaded: usize,
}

/// Executes one due task for its derived target period.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &ScheduledTask, year: i32, month: u32) -> TaskOutcome;
}

// ================================================================================================
// Scheduler
// ================================================================================================

/// Release-calendar-aware scheduler: derives which period each source should
/// fetch on a given date and drives the cron-like check loop.
pub struct Scheduler {
    calendars: ReleaseCalendars,
    tasks: RwLock<BTreeMap<String, ScheduledTask>>,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(calendars: ReleaseCalendars) -> Self {
        let mut tasks = BTreeMap::new();
        let now = Utc::now();
        for (code, calendar) in &calendars.calendars {
            let task_id = format!("monthly_{}", code.to_lowercase());
            let mut task = ScheduledTask::monthly(
                &task_id,
                code,
                calendar.release_day_of_month,
                &calendar.timezone,
                calendar.retry_days.clone(),
            );
            task.next_run = Some(Self::compute_next_run(&task, now));
            tasks.insert(task_id, task);
        }
        Self {
            calendars,
            tasks: RwLock::new(tasks),
            running: AtomicBool::new(false),
        }
    }

    /// Which (year, month) a run on `run_date` should fetch for `source`,
    /// accounting for the publication lag. Unknown sources default to the
    /// previous month.
    pub fn target_period(&self, source: &str, run_date: NaiveDate) -> (i32, u32) {
        let lag = self
            .calendars
            .calendars
            .get(source)
            .map(|c| c.release_lag_months)
            .unwrap_or(1);
        let target = run_date
            .checked_sub_months(Months::new(lag))
            .unwrap_or(run_date);
        (target.year(), target.month())
    }

    /// ISO (year, week) for weekly lineup reports.
    pub fn target_iso_week(run_date: NaiveDate) -> (i32, u32) {
        let iso = run_date.iso_week();
        (iso.year(), iso.week())
    }

    fn compute_next_run(task: &ScheduledTask, now: DateTime<Utc>) -> DateTime<Utc> {
        // Release slots are expressed in the publisher's local time.
        let tz: Tz = task.timezone.parse().unwrap_or(chrono_tz::UTC);
        let local_now = now.with_timezone(&tz);

        match task.frequency {
            Frequency::Monthly => {
                let this_month = clamped_day(local_now.year(), local_now.month(), task.day_of_month)
                    .and_hms_opt(task.hour, task.minute, 0)
                    .and_then(|dt| tz.from_local_datetime(&dt).earliest())
                    .map(|dt| dt.with_timezone(&Utc));
                match this_month {
                    Some(candidate) if candidate > now => candidate,
                    _ => {
                        let (year, month) = if local_now.month() == 12 {
                            (local_now.year() + 1, 1)
                        } else {
                            (local_now.year(), local_now.month() + 1)
                        };
                        let date = clamped_day(year, month, task.day_of_month);
                        date.and_hms_opt(task.hour, task.minute, 0)
                            .and_then(|dt| tz.from_local_datetime(&dt).earliest())
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or(now + chrono::Duration::days(30))
                    }
                }
            }
            Frequency::Weekly => {
                let target = Weekday::try_from(task.day_of_week as u8).unwrap_or(Weekday::Mon);
                let mut days_ahead =
                    (target.num_days_from_monday() as i64) - (now.weekday().num_days_from_monday() as i64);
                if days_ahead <= 0 {
                    days_ahead += 7;
                }
                let date = now.date_naive() + chrono::Duration::days(days_ahead);
                Utc.from_utc_datetime(
                    &date
                        .and_hms_opt(task.hour, task.minute, 0)
                        .unwrap_or_default(),
                )
            }
            _ => {
                // Everything else behaves daily: next occurrence of hour:minute.
                let today = now
                    .date_naive()
                    .and_hms_opt(task.hour, task.minute, 0)
                    .map(|dt| Utc.from_utc_datetime(&dt))
                    .unwrap_or(now);
                if today > now {
                    today
                } else {
                    today + chrono::Duration::days(1)
                }
            }
        }
    }

    /// Tasks due at `now`, in id order.
    pub fn pending_tasks(&self, now: DateTime<Utc>) -> Vec<ScheduledTask> {
        self.tasks
            .read()
            .map(|tasks| {
                tasks
                    .values()
                    .filter(|t| t.enabled && t.next_run.is_some_and(|n| n <= now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Record an execution outcome and advance `next_run`.
    ///
    /// A not-published outcome schedules the next retry offset instead of the
    /// next calendar slot and counts as a failure only once the retry window
    /// is exhausted.
    pub fn record_outcome(&self, task_id: &str, outcome: TaskOutcome) -> CropcastResult<()> {
        let mut tasks = self
            .tasks
            .write()
            .map_err(|_| ScheduleError::UnknownTask(task_id.to_string()))?;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| ScheduleError::UnknownTask(task_id.to_string()))?;

        let now = Utc::now();
        task.last_run = Some(now);

        if outcome.success {
            task.last_success = Some(now);
            task.consecutive_failures = 0;
            task.retries_used = 0;
            task.next_run = Some(Self::compute_next_run(task, now));
        } else if outcome.not_published {
            if task.retries_used < task.retry_offsets.len() {
                let offset = task.retry_offsets[task.retries_used];
                task.retries_used += 1;
                task.next_run = Some(now + chrono::Duration::days(offset));
            } else {
                task.consecutive_failures += 1;
                task.retries_used = 0;
                task.next_run = Some(Self::compute_next_run(task, now));
            }
        } else {
            task.consecutive_failures += 1;
            task.retries_used = 0;
            task.next_run = Some(Self::compute_next_run(task, now));
        }
        Ok(())
    }

    pub fn add_task(&self, task: ScheduledTask) {
        if let Ok(mut tasks) = self.tasks.write() {
            let mut task = task;
            if task.next_run.is_none() {
                task.next_run = Some(Self::compute_next_run(&task, Utc::now()));
            }
            tasks.insert(task.task_id.clone(), task);
        }
    }

    pub fn set_enabled(&self, task_id: &str, enabled: bool) -> CropcastResult<()> {
        let mut tasks = self
            .tasks
            .write()
            .map_err(|_| ScheduleError::UnknownTask(task_id.to_string()))?;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| ScheduleError::UnknownTask(task_id.to_string()))?;
        task.enabled = enabled;
        if enabled {
            task.next_run = Some(Self::compute_next_run(task, Utc::now()));
        }
        Ok(())
    }

    pub fn status(&self) -> Vec<ScheduledTask> {
        self.tasks
            .read()
            .map(|tasks| tasks.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal the loop to exit. The task currently in flight finishes first.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// The control loop: every `check_interval`, run all due tasks in order
    /// against their derived target periods.
    pub async fn run_loop(
        self: Arc<Self>,
        runner: Arc<dyn TaskRunner>,
        check_interval: Duration,
    ) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("scheduler already running");
            return;
        }
        tracing::info!("scheduler started");

        while self.running.load(Ordering::SeqCst) {
            let due = self.pending_tasks(Utc::now());
            for task in due {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                let (year, month) =
                    self.target_period(&task.source, Utc::now().date_naive());
                tracing::info!(task = %task.task_id, period = %format!("{year}-{month:02}"), "executing scheduled task");

                let outcome = runner.run(&task, year, month).await;
                if let Err(e) = self.record_outcome(&task.task_id, outcome) {
                    tracing::error!(task = %task.task_id, "failed to record outcome: {e}");
                }
            }
            tokio::time::sleep(check_interval).await;
        }
        tracing::info!("scheduler stopped");
    }
}

fn clamped_day(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day)
        .or_else(|| NaiveDate::from_ymd_opt(year, month, 28))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> Scheduler {
        Scheduler::new(ReleaseCalendars::default())
    }

    #[test]
    fn target_period_respects_lag() {
        let s = scheduler();
        let run_date = NaiveDate::from_ymd_opt(2024, 9, 8).unwrap();
        assert_eq!(s.target_period("BRA", run_date), (2024, 8));
        assert_eq!(s.target_period("PRY", run_date), (2024, 7));
        // January wraps into the previous year.
        let january = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(s.target_period("ARG", january), (2023, 12));
    }

    #[test]
    fn next_run_advances_after_each_outcome() {
        let s = scheduler();
        let before = s.status();
        let task_id = &before[0].task_id.clone();

        s.record_outcome(task_id, TaskOutcome { success: true, ..Default::default() })
            .unwrap();
        let after: Vec<_> = s
            .status()
            .into_iter()
            .filter(|t| &t.task_id == task_id)
            .collect();
        let task = &after[0];
        assert!(task.next_run.unwrap() > task.last_run.unwrap());
        assert_eq!(task.consecutive_failures, 0);
        assert!(task.last_success.is_some());
    }

    #[test]
    fn not_published_uses_retry_window_before_counting_failure() {
        let s = scheduler();
        let task_id = "monthly_bra";
        let miss = TaskOutcome {
            success: false,
            not_published: true,
            records_loaded: 0,
        };

        // Three retry offsets before a failure counts.
        for expected_failures in [0, 0, 0, 1] {
            s.record_outcome(task_id, miss).unwrap();
            let task = s
                .status()
                .into_iter()
                .find(|t| t.task_id == task_id)
                .unwrap();
            assert_eq!(task.consecutive_failures, expected_failures);
            assert!(task.next_run.unwrap() > task.last_run.unwrap());
        }
    }

    #[test]
    fn disabled_tasks_are_never_pending() {
        let s = scheduler();
        s.set_enabled("monthly_bra", false).unwrap();
        let far_future = Utc::now() + chrono::Duration::days(400);
        assert!(
            s.pending_tasks(far_future)
                .iter()
                .all(|t| t.task_id != "monthly_bra")
        );
    }

    #[test]
    fn iso_week_targets() {
        let date = NaiveDate::from_ymd_opt(2025, 2, 12).unwrap();
        assert_eq!(Scheduler::target_iso_week(date), (2025, 7));
    }
}
