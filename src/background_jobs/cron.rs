//! Cadence parsing: 5-field cron expressions plus the `every 4h` and
//! `daily 06:00` shorthands used in the `[jobs]` config section.
//!
//! Expressions are evaluated in UTC by `croner`; the shorthands are mapped
//! onto an interval or a cron expression here.

use super::job::JobSchedule;
use chrono::{DateTime, Utc};
use croner::Cron;
use std::fmt;
use std::time::Duration as StdDuration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid cadence '{expression}': {reason}")]
pub struct CadenceError {
    pub expression: String,
    pub reason: String,
}

impl CadenceError {
    fn new(expression: &str, reason: impl Into<String>) -> Self {
        Self {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

/// A parsed 5-field cron expression (`minute hour day-of-month month day-of-week`).
///
/// When both day fields are restricted a day matching either one fires. A day
/// field starting with `*` (such as `*/2`) counts as unrestricted, so it is
/// combined with the other day field.
#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    cron: Cron,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CadenceError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CadenceError::new(
                expression,
                format!("expected 5 fields, got {}", fields.len()),
            ));
        }
        let normalized = fields.join(" ");

        let day_field_starred = fields[2].starts_with('*') || fields[4].starts_with('*');
        let parsed = if day_field_starred {
            Cron::new(&normalized).with_dom_and_dow().parse()
        } else {
            Cron::new(&normalized).parse()
        };
        let cron = parsed.map_err(|e| CadenceError::new(expression, e.to_string()))?;

        Ok(Self {
            expression: normalized,
            cron,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The first matching minute strictly after `after`, or `None` when the
    /// expression can never fire.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron.find_next_occurrence(&after, false).ok()
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for CronSchedule {}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Parses a cadence string from configuration.
///
/// Returns `Ok(None)` for `"off"`, which disables the job's schedule.
pub fn parse_cadence(cadence: &str) -> Result<Option<JobSchedule>, CadenceError> {
    let trimmed = cadence.trim();
    let lower = trimmed.to_ascii_lowercase();

    if lower == "off" {
        return Ok(None);
    }

    if let Some(rest) = lower.strip_prefix("every ") {
        let rest = rest.trim();
        let (number, unit) = rest.split_at(rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len()));
        let n: u64 = number
            .parse()
            .map_err(|_| CadenceError::new(cadence, "expected 'every <n>h' or 'every <n>m'"))?;
        if n == 0 {
            return Err(CadenceError::new(cadence, "interval must be positive"));
        }
        let secs = match unit.trim() {
            "h" | "hour" | "hours" => n * 3600,
            "m" | "min" | "mins" | "minutes" => n * 60,
            other => {
                return Err(CadenceError::new(
                    cadence,
                    format!("unknown interval unit '{}'", other),
                ))
            }
        };
        return Ok(Some(JobSchedule::Interval(StdDuration::from_secs(secs))));
    }

    if let Some(time) = lower.strip_prefix("daily ") {
        let (hour, minute) = time
            .trim()
            .split_once(':')
            .ok_or_else(|| CadenceError::new(cadence, "expected 'daily HH:MM'"))?;
        let hour: u32 = hour
            .parse()
            .map_err(|_| CadenceError::new(cadence, "bad hour"))?;
        let minute: u32 = minute
            .parse()
            .map_err(|_| CadenceError::new(cadence, "bad minute"))?;
        if hour > 23 || minute > 59 {
            return Err(CadenceError::new(cadence, "time out of range"));
        }
        let cron = CronSchedule::parse(&format!("{} {} * * *", minute, hour))?;
        return Ok(Some(JobSchedule::Cron(cron)));
    }

    CronSchedule::parse(trimmed).map(|cron| Some(JobSchedule::Cron(cron)))
}
