//! Schedule arithmetic
//!
//! Cron expressions accept the classic five-field form (`min hour dom month dow`)
//! as well as the six/seven-field form with seconds understood by the `cron`
//! crate. They are evaluated in the configured timezone.

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use corral_store::ScheduleType;
use cron::Schedule;
use std::str::FromStr;

/// Why a schedule could not be accepted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid schedule type '{0}', expected cron, interval or once")]
    InvalidType(String),

    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("invalid interval '{0}': must be a positive number of milliseconds")]
    InvalidInterval(String),

    #[error("invalid timestamp '{0}': expected ISO 8601, e.g. 2026-02-01T15:30:00")]
    InvalidTimestamp(String),

    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),

    #[error("schedule '{0}' lands outside the storable range (years up to 9999)")]
    OutOfRange(String),
}

/// Intervals longer than ten years are refused
pub const MAX_INTERVAL_MS: i64 = 10 * 366 * 24 * 60 * 60 * 1000;

/// Latest instant the store can represent as a plain RFC 3339 timestamp
fn latest_storable() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn storable(at: DateTime<Utc>, value: &str) -> Result<DateTime<Utc>, ScheduleError> {
    if at > latest_storable() || at.year() < 0 {
        return Err(ScheduleError::OutOfRange(value.to_string()));
    }
    Ok(at)
}

fn after_interval(now: DateTime<Utc>, value: &str) -> Result<DateTime<Utc>, ScheduleError> {
    let at = now
        .checked_add_signed(parse_interval(value)?)
        .ok_or_else(|| ScheduleError::OutOfRange(value.to_string()))?;
    storable(at, value)
}

/// Parse an IANA timezone name such as `UTC` or `Europe/Berlin`
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    Tz::from_str(name.trim()).map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

pub fn parse_schedule_type(raw: &str) -> Result<ScheduleType, ScheduleError> {
    raw.parse()
        .map_err(|_| ScheduleError::InvalidType(raw.to_string()))
}

/// Parse a cron expression, prefixing a zero seconds field to five-field input
pub fn parse_cron(expr: &str) -> Result<Schedule, ScheduleError> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };

    Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

pub fn parse_interval(value: &str) -> Result<Duration, ScheduleError> {
    match value.trim().parse::<i64>() {
        Ok(ms) if ms > 0 && ms <= MAX_INTERVAL_MS => Ok(Duration::milliseconds(ms)),
        _ => Err(ScheduleError::InvalidInterval(value.to_string())),
    }
}

/// Parse a one-shot instant; naive timestamps are local to `tz`
pub fn parse_once(value: &str, tz: Tz) -> Result<DateTime<Utc>, ScheduleError> {
    let value_trimmed = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value_trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }

    const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"];
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value_trimmed, fmt).ok())
        .and_then(|naive| tz.from_local_datetime(&naive).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| ScheduleError::InvalidTimestamp(value.to_string()))
}

fn next_cron_fire(schedule: &Schedule, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    schedule
        .after(&now.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc))
}

/// First occurrence of a newly created task
pub fn first_run(
    schedule_type: ScheduleType,
    value: &str,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<DateTime<Utc>, ScheduleError> {
    match schedule_type {
        ScheduleType::Cron => {
            let schedule = parse_cron(value)?;
            let next = next_cron_fire(&schedule, now, tz).ok_or_else(|| ScheduleError::InvalidCron {
                expr: value.to_string(),
                reason: "expression never fires".to_string(),
            })?;
            storable(next, value)
        }
        ScheduleType::Interval => after_interval(now, value),
        ScheduleType::Once => storable(parse_once(value, tz)?, value),
    }
}

/// Next occurrence after a run finished at `now`; `None` means the task is done
pub fn next_run_after(
    schedule_type: ScheduleType,
    value: &str,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    match schedule_type {
        ScheduleType::Cron => next_cron_fire(&parse_cron(value)?, now, tz)
            .map(|next| storable(next, value))
            .transpose(),
        ScheduleType::Interval => after_interval(now, value).map(Some),
        ScheduleType::Once => Ok(None),
    }
}

/// Generate a collision-free task identifier
pub fn new_task_id() -> String {
    format!("task-{}", uuid::Uuid::new_v4().simple())
}

/// The `last_result` summary stored after a run
pub fn summarize_result(result: Option<&str>, error: Option<&str>) -> String {
    if let Some(error) = error {
        return format!("Error: {}", error);
    }
    match result {
        Some(text) if !text.is_empty() => text.chars().take(200).collect(),
        _ => "Completed".to_string(),
    }
}
