use crate::error::OrchaError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed cron expression.
///
/// Accepts the classic 5-field form (`min hour dom month dow`, Sunday is 0 or 7)
/// as well as the 6/7-field form with a leading seconds field (and optional
/// trailing year), which uses the `cron` crate's numbering (Sunday is 1).
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    inner: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, OrchaError> {
        let trimmed = expr.trim();
        let invalid = |reason: String| OrchaError::InvalidCron {
            expr: expr.to_string(),
            reason,
        };
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let normalized = match fields.as_slice() {
            [minute, hour, dom, month, dow] => {
                let dow = classic_day_of_week(dow).map_err(invalid)?;
                format!("0 {minute} {hour} {dom} {month} {dow}")
            }
            f if f.len() == 6 || f.len() == 7 => trimmed.to_string(),
            f => return Err(invalid(format!("expected 5, 6 or 7 fields, got {}", f.len()))),
        };
        let inner = cron::Schedule::from_str(&normalized).map_err(|e| OrchaError::InvalidCron {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            expr: trimmed.to_string(),
            inner,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Latest occurrence strictly before `t`.
    pub fn prev_before(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.inner.after(&t).next_back()
    }

    /// Earliest occurrence strictly after `t`.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.inner.after(&t).next()
    }

    /// Gap between the next two occurrences after `t`.
    pub fn interval(&self, t: DateTime<Utc>) -> Option<Duration> {
        let mut upcoming = self.inner.after(&t);
        let first = upcoming.next()?;
        let second = upcoming.next()?;
        Some(second - first)
    }
}

/// Rewrite a 5-field day-of-week field (0-7, Sunday as 0 or 7, names allowed)
/// as a list of day names.
fn classic_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }
    let mut days = [false; 7];
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: usize = step
                    .parse()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("invalid day-of-week step in '{item}'"))?;
                (base, Some(step))
            }
            None => (item, None),
        };
        let (start, end) = match base {
            "*" => (0, 6),
            _ => match base.split_once('-') {
                Some((a, b)) => (day_number(a)?, day_number(b)?),
                None => {
                    let day = day_number(base)?;
                    (day, if step.is_some() { 7 } else { day })
                }
            },
        };
        if start > end {
            return Err(format!("day-of-week range '{base}' runs backwards"));
        }
        for day in (start..=end).step_by(step.unwrap_or(1)) {
            days[day % 7] = true;
        }
    }
    let names: Vec<&str> = DAY_NAMES
        .iter()
        .zip(days)
        .filter_map(|(name, on)| on.then_some(*name))
        .collect();
    Ok(names.join(","))
}

fn day_number(value: &str) -> Result<usize, String> {
    if let Ok(n) = value.parse::<usize>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("day of week must be 0-7, got {n}"))
        };
    }
    DAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(value))
        .ok_or_else(|| format!("unknown day of week '{value}'"))
}

/// A cron schedule attached to a task, with the config handed to every run it creates.
///
/// `set_idk` stays `None` until the set is attached to a task, which lets the
/// same cron expression be reused across tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSet {
    pub set_idk: Option<String>,
    pub cron_schedule: String,
    #[serde(default = "empty_config")]
    pub config: Value,
}

fn empty_config() -> Value {
    Value::Object(Default::default())
}

impl ScheduleSet {
    pub fn new(cron_schedule: impl Into<String>, config: Value) -> Self {
        Self {
            set_idk: None,
            cron_schedule: cron_schedule.into(),
            config,
        }
    }

    pub fn with_key(set_idk: impl Into<String>, cron_schedule: impl Into<String>, config: Value) -> Self {
        Self {
            set_idk: Some(set_idk.into()),
            cron_schedule: cron_schedule.into(),
            config,
        }
    }

    /// Key a set the way tasks do: `{task_idk}_{cron_schedule}`.
    pub fn keyed_for(&self, task_idk: &str) -> Self {
        Self::with_key(
            format!("{task_idk}_{}", self.cron_schedule),
            self.cron_schedule.clone(),
            self.config.clone(),
        )
    }

    pub fn cron(&self) -> Result<CronSchedule, OrchaError> {
        CronSchedule::parse(&self.cron_schedule)
    }

    pub fn key(&self) -> Result<&str, OrchaError> {
        self.set_idk
            .as_deref()
            .ok_or(OrchaError::ScheduleSetWithoutKey)
    }
}
