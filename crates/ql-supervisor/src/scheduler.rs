//! Cron-driven scheduling with missed-run recovery.
//!
//! Schedules come in two forms: simple `HH:MM` (translated to
//! `<m> <h> * * *`) and 5-field cron. Matching is at minute granularity
//! against local time. One tokio task per enabled app sleeps to the next
//! matching minute; jobs are cancelled and reinstalled on any config
//! change. On startup, apps with `runIfMissed` whose time-of-day already
//! passed today (and whose last run was not today) are executed
//! immediately.

use crate::config::AppConfig;
use crate::lifecycle::Supervisor;
use crate::table::{ProcessKey, ProcessStatus};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, Timelike};
use parking_lot::Mutex;
use ql_common::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One cron field: any value, or an allowed set.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CronField {
    Any,
    Values(Vec<u32>),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Values(values) => values.contains(&value),
        }
    }

    fn single(&self) -> Option<u32> {
        match self {
            CronField::Values(values) if values.len() == 1 => Some(values[0]),
            _ => None,
        }
    }
}

fn parse_field(spec: &str, expr: &str, min: u32, max: u32) -> Result<CronField> {
    if spec == "*" {
        return Ok(CronField::Any);
    }

    let mut values = Vec::new();
    for part in spec.split(',') {
        if let Some(step) = part.strip_prefix("*/") {
            let step: u32 = step
                .parse()
                .map_err(|_| Error::invalid_schedule(expr, format!("bad step '{}'", part)))?;
            if step == 0 {
                return Err(Error::invalid_schedule(expr, "step of zero"));
            }
            values.extend((min..=max).step_by(step as usize));
        } else if let Some((lo, hi)) = part.split_once('-') {
            let lo: u32 = lo
                .parse()
                .map_err(|_| Error::invalid_schedule(expr, format!("bad range '{}'", part)))?;
            let hi: u32 = hi
                .parse()
                .map_err(|_| Error::invalid_schedule(expr, format!("bad range '{}'", part)))?;
            if lo > hi || hi > max || lo < min {
                return Err(Error::invalid_schedule(expr, format!("range '{}' out of bounds", part)));
            }
            values.extend(lo..=hi);
        } else {
            let value: u32 = part
                .parse()
                .map_err(|_| Error::invalid_schedule(expr, format!("bad value '{}'", part)))?;
            // Both 0 and 7 mean Sunday in the day-of-week field.
            let value = if max == 6 && value == 7 { 0 } else { value };
            if value < min || value > max {
                return Err(Error::invalid_schedule(expr, format!("value '{}' out of bounds", part)));
            }
            values.push(value);
        }
    }
    values.sort_unstable();
    values.dedup();
    Ok(CronField::Values(values))
}

/// A parsed schedule, matched at minute granularity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSpec {
    expr: String,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl ScheduleSpec {
    /// Parse `HH:MM` or a 5-field cron expression.
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();

        if let Some((hh, mm)) = expr.split_once(':') {
            if !expr.contains(' ') {
                let hour: u32 = hh
                    .parse()
                    .map_err(|_| Error::invalid_schedule(expr, "bad hour"))?;
                let minute: u32 = mm
                    .parse()
                    .map_err(|_| Error::invalid_schedule(expr, "bad minute"))?;
                if hour > 23 || minute > 59 {
                    return Err(Error::invalid_schedule(expr, "time out of range"));
                }
                return Ok(Self {
                    expr: expr.to_string(),
                    minute: CronField::Values(vec![minute]),
                    hour: CronField::Values(vec![hour]),
                    day_of_month: CronField::Any,
                    month: CronField::Any,
                    day_of_week: CronField::Any,
                });
            }
        }

        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::invalid_schedule(
                expr,
                format!("expected 5 fields, got {}", fields.len()),
            ));
        }

        Ok(Self {
            expr: expr.to_string(),
            minute: parse_field(fields[0], expr, 0, 59)?,
            hour: parse_field(fields[1], expr, 0, 23)?,
            day_of_month: parse_field(fields[2], expr, 1, 31)?,
            month: parse_field(fields[3], expr, 1, 12)?,
            day_of_week: parse_field(fields[4], expr, 0, 6)?,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// Whether `t`'s minute matches this schedule.
    pub fn matches(&self, t: &DateTime<Local>) -> bool {
        if !(self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.month.matches(t.month()))
        {
            return false;
        }

        let dom = self.day_of_month.matches(t.day());
        let dow = self
            .day_of_week
            .matches(t.weekday().num_days_from_sunday());
        // Standard cron: when both day fields are restricted, either may
        // match.
        match (&self.day_of_month, &self.day_of_week) {
            (CronField::Any, CronField::Any) => true,
            (CronField::Values(_), CronField::Any) => dom,
            (CronField::Any, CronField::Values(_)) => dow,
            (CronField::Values(_), CronField::Values(_)) => dom || dow,
        }
    }

    /// Next matching minute strictly after `t`.
    pub fn next_after(&self, t: &DateTime<Local>) -> Option<DateTime<Local>> {
        let mut candidate = (*t + ChronoDuration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;
        // Two years of minutes bounds the search for any satisfiable spec.
        for _ in 0..(2 * 366 * 24 * 60) {
            if self.matches(&candidate) {
                return Some(candidate);
            }
            candidate += ChronoDuration::minutes(1);
        }
        None
    }

    /// Most recent matching minute today at or before `now`.
    pub fn prev_today(&self, now: &DateTime<Local>) -> Option<DateTime<Local>> {
        let mut candidate = now.with_second(0)?.with_nanosecond(0)?;
        let midnight = candidate.with_hour(0)?.with_minute(0)?;
        while candidate >= midnight {
            if self.matches(&candidate) {
                return Some(candidate);
            }
            candidate -= ChronoDuration::minutes(1);
        }
        None
    }

    /// Human description of the schedule.
    pub fn describe(&self) -> String {
        if let (Some(minute), Some(hour)) = (self.minute.single(), self.hour.single()) {
            if self.day_of_month == CronField::Any
                && self.month == CronField::Any
                && self.day_of_week == CronField::Any
            {
                let (display_hour, meridiem) = match hour {
                    0 => (12, "AM"),
                    1..=11 => (hour, "AM"),
                    12 => (12, "PM"),
                    _ => (hour - 12, "PM"),
                };
                return format!("Daily at {}:{:02} {}", display_hour, minute, meridiem);
            }
        }
        if let Some(minute) = self.minute.single() {
            if self.hour == CronField::Any
                && self.day_of_month == CronField::Any
                && self.month == CronField::Any
                && self.day_of_week == CronField::Any
            {
                return format!("Hourly at :{:02}", minute);
            }
        }
        format!("Cron: {}", self.expr)
    }
}

/// Wire shape for schedule queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleInfo {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    pub schedule_enabled: bool,
    pub run_if_missed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Local>>,
    pub state: crate::schedule_state::ScheduleState,
}

struct ScheduledJob {
    handle: JoinHandle<()>,
}

/// The scheduler: one background job per enabled scheduled app.
pub struct Scheduler {
    supervisor: Arc<Supervisor>,
    jobs: Mutex<HashMap<String, ScheduledJob>>,
}

impl Scheduler {
    pub fn new(supervisor: Arc<Supervisor>) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    /// Install jobs for every enabled scheduled app.
    pub fn install_all(self: &Arc<Self>) {
        for app in self.supervisor.config.snapshot().apps {
            if app.schedule.is_some() && app.schedule_enabled {
                self.install(&app);
            }
        }
    }

    /// Cancel-and-reinstall for one app (after any config change).
    pub fn reinstall(self: &Arc<Self>, app_id: &str) {
        self.cancel(app_id);
        if let Some(app) = self.supervisor.config.app(app_id) {
            if app.schedule.is_some() && app.schedule_enabled {
                self.install(&app);
            }
        }
    }

    pub fn cancel(&self, app_id: &str) {
        if let Some(job) = self.jobs.lock().remove(app_id) {
            job.handle.abort();
            debug!("Schedule job cancelled for {}", app_id);
        }
    }

    fn install(self: &Arc<Self>, app: &AppConfig) {
        let Some(expr) = &app.schedule else {
            return;
        };
        let spec = match ScheduleSpec::parse(expr) {
            Ok(spec) => spec,
            Err(e) => {
                warn!("Invalid schedule for {}: {}", app.id, e);
                return;
            }
        };

        info!("Schedule installed for {}: {}", app.id, spec.describe());

        let scheduler = Arc::clone(self);
        let app_id = app.id.clone();
        let job_id = app_id.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = spec.next_after(&Local::now()) else {
                    warn!("Schedule for {} never fires, stopping job", app_id);
                    return;
                };
                let wait = (next - Local::now()).to_std().unwrap_or_default();
                debug!("{} sleeps {:?} until {}", app_id, wait, next);
                tokio::time::sleep(wait).await;

                // Re-read config at fire time; the app may have been
                // disabled or deleted since the job was installed.
                let Some(app) = scheduler.supervisor.config.app(&app_id) else {
                    return;
                };
                if !app.schedule_enabled {
                    return;
                }

                match scheduler.supervisor.execute_scheduled_app(&app_id, false) {
                    Ok(run) => info!("Scheduled run fired for {} ({})", app_id, run.key),
                    Err(Error::SyncInProgress { key }) => {
                        warn!("Skipping scheduled run for {}: {} still running", app_id, key)
                    }
                    Err(e) => warn!("Scheduled run failed to start for {}: {}", app_id, e),
                }
            }
        });

        let mut jobs = self.jobs.lock();
        if let Some(old) = jobs.insert(job_id, ScheduledJob { handle }) {
            old.handle.abort();
        }
    }

    /// Missed-run recovery at startup.
    pub fn run_missed(self: &Arc<Self>) {
        let now = Local::now();
        for app in self.supervisor.config.snapshot().apps {
            if !(app.schedule_enabled && app.run_if_missed) {
                continue;
            }
            let Some(expr) = &app.schedule else { continue };
            let Ok(spec) = ScheduleSpec::parse(expr) else {
                continue;
            };

            if !missed_run_due(
                &spec,
                &now,
                self.supervisor.schedule_state.get(&app.id).last_run,
            ) {
                continue;
            }

            info!("Missed scheduled run detected for {}, executing now", app.id);
            match self.supervisor.execute_scheduled_app(&app.id, false) {
                Ok(run) => info!("Missed run started for {} ({})", app.id, run.key),
                Err(e) => warn!("Missed run failed to start for {}: {}", app.id, e),
            }
        }
    }

    /// Schedule info for one app.
    pub fn info(&self, app_id: &str) -> Result<ScheduleInfo> {
        let app = self
            .supervisor
            .config
            .app(app_id)
            .ok_or_else(|| Error::app_not_found(app_id))?;
        Ok(self.info_for(&app))
    }

    fn info_for(&self, app: &AppConfig) -> ScheduleInfo {
        let spec = app
            .schedule
            .as_deref()
            .and_then(|expr| ScheduleSpec::parse(expr).ok());
        ScheduleInfo {
            id: app.id.clone(),
            name: app.name.clone(),
            schedule: app.schedule.clone(),
            schedule_enabled: app.schedule_enabled,
            run_if_missed: app.run_if_missed,
            schedule_command: app.schedule_command.clone(),
            description: spec.as_ref().map(|s| s.describe()),
            next_run: if app.schedule_enabled {
                spec.as_ref().and_then(|s| s.next_after(&Local::now()))
            } else {
                None
            },
            state: self.supervisor.schedule_state.get(&app.id),
        }
    }

    /// Schedule info for every app that declares a schedule.
    pub fn all_info(&self) -> Vec<ScheduleInfo> {
        self.supervisor
            .config
            .snapshot()
            .apps
            .iter()
            .filter(|app| app.schedule.is_some())
            .map(|app| self.info_for(app))
            .collect()
    }

    /// Live status of the scheduled run, if one is in the table.
    pub fn run_status(&self, app_id: &str) -> Option<(ProcessStatus, Vec<crate::table::LogLine>)> {
        let app = self.supervisor.config.app(app_id)?;
        let key = if app.schedule_command.is_some() {
            ProcessKey::sync(app_id)
        } else {
            ProcessKey::app(app_id)
        };
        let entry = self.supervisor.table.get(&key)?;
        Some((entry.status, entry.recent_logs(20)))
    }
}

/// Whether a missed run is due: the schedule's time-of-day already passed
/// today and the last run (if any) was on an earlier calendar day.
fn missed_run_due(
    spec: &ScheduleSpec,
    now: &DateTime<Local>,
    last_run: Option<DateTime<chrono::Utc>>,
) -> bool {
    if spec.prev_today(now).is_none() {
        return false;
    }
    match last_run {
        None => true,
        Some(last) => last.with_timezone(&Local).date_naive() != now.date_naive(),
    }
}
