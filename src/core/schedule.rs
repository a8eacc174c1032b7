//! Schedule parsing and next occurrence calculation.
//!
//! Two schedule families are supported:
//! - Standard 5-field cron: `minute hour day-of-month month day-of-week`
//! - Fixed intervals: `every <N>h` or `every <N>m`

use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when parsing or using schedules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Empty schedule string.
    #[error("schedule cannot be empty")]
    Empty,

    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid interval expression.
    #[error("invalid interval expression: {0}")]
    InvalidInterval(String),

    /// The computed time does not fit in the calendar range.
    #[error("next run out of range")]
    OutOfRange,

    /// No more occurrences.
    #[error("no more occurrences")]
    NoMoreOccurrences,
}

/// The family a schedule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Calendar-based cron expression.
    Cron,
    /// Fixed interval between runs.
    Interval,
}

#[derive(Debug, Clone)]
enum ParsedSchedule {
    /// One schedule, or two when day-of-month and day-of-week are both
    /// restricted and a day matching either fires.
    Cron(Vec<CronSchedule>),
    Interval(TimeDelta),
}

/// A parsed schedule for one policy task type.
///
/// Serializes as its original expression and re-parses on deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Schedule {
    /// The original expression string.
    expression: String,
    parsed: ParsedSchedule,
}

/// Bounds for one cron field.
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    /// Upper bound used when expanding `*`; differs from `max` only for
    /// day-of-week, where 7 is an alias for Sunday.
    wildcard_max: u32,
}

const CRON_FIELDS: [FieldSpec; 5] = [
    FieldSpec { name: "minute", min: 0, max: 59, wildcard_max: 59 },
    FieldSpec { name: "hour", min: 0, max: 23, wildcard_max: 23 },
    FieldSpec { name: "day-of-month", min: 1, max: 31, wildcard_max: 31 },
    FieldSpec { name: "month", min: 1, max: 12, wildcard_max: 12 },
    FieldSpec { name: "day-of-week", min: 0, max: 7, wildcard_max: 6 },
];

const DAY_OF_MONTH_FIELD: usize = 2;
const DAY_OF_WEEK_FIELD: usize = 4;

impl Schedule {
    /// Parse a schedule string.
    ///
    /// Strings starting with `every` are parsed as intervals, everything else
    /// as a 5-field cron expression. Leading or trailing whitespace is
    /// rejected.
    pub fn parse(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let trimmed = expression.trim();

        if trimmed.is_empty() {
            return Err(ScheduleError::Empty);
        }

        let is_interval = trimmed.starts_with("every");
        if trimmed.len() != expression.len() {
            let message = format!("surrounding whitespace in {:?}", expression);
            return Err(if is_interval {
                ScheduleError::InvalidInterval(message)
            } else {
                ScheduleError::InvalidCron(message)
            });
        }

        let parsed = if is_interval {
            Self::parse_interval(&expression)?
        } else {
            Self::parse_cron(&expression)?
        };

        Ok(Self { expression, parsed })
    }

    /// Parse `every <N><unit>` where unit is `h` or `m`.
    fn parse_interval(expression: &str) -> Result<ParsedSchedule, ScheduleError> {
        let invalid = || ScheduleError::InvalidInterval(expression.to_string());

        let rest = expression.strip_prefix("every").ok_or_else(invalid)?;
        if !rest.starts_with(char::is_whitespace) {
            return Err(invalid());
        }
        let rest = rest.trim_start();

        let unit = rest.chars().last().ok_or_else(invalid)?;
        let digits = &rest[..rest.len() - unit.len_utf8()];
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let value: i64 = digits.parse().map_err(|_| invalid())?;

        let seconds_per_unit = match unit {
            'h' => 3600,
            'm' => 60,
            _ => {
                return Err(ScheduleError::InvalidInterval(format!(
                    "unknown unit '{}' in {}",
                    unit, expression
                )));
            }
        };

        if value == 0 {
            return Err(ScheduleError::InvalidInterval(format!(
                "interval must be positive: {}",
                expression
            )));
        }

        let delta = value
            .checked_mul(seconds_per_unit)
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(invalid)?;

        Ok(ParsedSchedule::Interval(delta))
    }

    /// Parse and validate a 5-field cron expression.
    fn parse_cron(expression: &str) -> Result<ParsedSchedule, ScheduleError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != CRON_FIELDS.len() {
            return Err(ScheduleError::InvalidCron(format!(
                "expected 5 fields, got {}",
                fields.len()
            )));
        }

        // Each field is validated against the calendar here, then handed to
        // the cron crate as `*` or an explicit list. The crate numbers weekdays
        // 1-7 from Sunday, so day-of-week values are shifted.
        let mut normalized = vec!["0".to_string()];
        for (index, (field, spec)) in fields.iter().zip(CRON_FIELDS.iter()).enumerate() {
            if *field == "*" {
                normalized.push("*".to_string());
                continue;
            }

            let mut values = expand_field(field, spec)?;
            if index == DAY_OF_WEEK_FIELD {
                values = values.into_iter().map(|day| day % 7 + 1).collect();
            }

            let list: Vec<String> = values.iter().map(u32::to_string).collect();
            normalized.push(list.join(","));
        }

        // Standard cron matches a day when either restricted day field does.
        // `normalized` is offset by one for its leading seconds field.
        let days_restricted =
            fields[DAY_OF_MONTH_FIELD] != "*" && fields[DAY_OF_WEEK_FIELD] != "*";
        let variants = if days_restricted {
            let mut by_month_day = normalized.clone();
            by_month_day[DAY_OF_WEEK_FIELD + 1] = "*".to_string();
            let mut by_weekday = normalized;
            by_weekday[DAY_OF_MONTH_FIELD + 1] = "*".to_string();
            vec![by_month_day, by_weekday]
        } else {
            vec![normalized]
        };

        let schedules = variants
            .iter()
            .map(|variant| {
                CronSchedule::from_str(&variant.join(" "))
                    .map_err(|e| ScheduleError::InvalidCron(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ParsedSchedule::Cron(schedules))
    }

    fn next_cron(schedules: &[CronSchedule], after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        schedules
            .iter()
            .filter_map(|schedule| schedule.after(&after).next())
            .min()
    }

    /// Next occurrence strictly after `now`.
    ///
    /// For intervals with no prior run this is `now + interval`.
    pub fn next_run(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        match &self.parsed {
            ParsedSchedule::Cron(schedules) => {
                Self::next_cron(schedules, now).ok_or(ScheduleError::NoMoreOccurrences)
            }
            ParsedSchedule::Interval(delta) => now
                .checked_add_signed(*delta)
                .ok_or(ScheduleError::OutOfRange),
        }
    }

    /// Next occurrence given the most recent run.
    ///
    /// Intervals are anchored on `last_run`, but when `last_run + interval` is
    /// not after `now` the missed windows collapse into a single re-anchored
    /// `now + interval`. Cron schedules ignore `last_run`.
    pub fn next_run_with_last(
        &self,
        now: DateTime<Utc>,
        last_run: Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        match (&self.parsed, last_run) {
            (ParsedSchedule::Interval(delta), Some(last_run)) => {
                let next = last_run
                    .checked_add_signed(*delta)
                    .ok_or(ScheduleError::OutOfRange)?;
                if next > now {
                    Ok(next)
                } else {
                    self.next_run(now)
                }
            }
            _ => self.next_run(now),
        }
    }

    /// Get the next N occurrences after the given time.
    pub fn next_n_after(
        &self,
        after: DateTime<Utc>,
        n: usize,
    ) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
        let mut results = Vec::with_capacity(n);
        let mut current = after;
        for _ in 0..n {
            current = match self.next_run(current) {
                Ok(next) => next,
                Err(ScheduleError::NoMoreOccurrences) => break,
                Err(e) => return Err(e),
            };
            results.push(current);
        }
        Ok(results)
    }

    /// Which family this schedule belongs to.
    pub fn kind(&self) -> ScheduleKind {
        match self.parsed {
            ParsedSchedule::Cron(_) => ScheduleKind::Cron,
            ParsedSchedule::Interval(_) => ScheduleKind::Interval,
        }
    }

    /// The fixed interval, for interval schedules.
    pub fn interval(&self) -> Option<TimeDelta> {
        match self.parsed {
            ParsedSchedule::Interval(delta) => Some(delta),
            ParsedSchedule::Cron(_) => None,
        }
    }

    /// Get the original expression string.
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

/// Expand one cron field (`*/n`, `a`, `a-b`, `a-b/n`, comma lists) into the
/// set of values it matches, rejecting anything outside the field's range.
fn expand_field(field: &str, spec: &FieldSpec) -> Result<BTreeSet<u32>, ScheduleError> {
    let mut values = BTreeSet::new();

    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| {
                    ScheduleError::InvalidCron(format!("invalid step '{}' in {}", step, spec.name))
                })?;
                if step == 0 {
                    return Err(ScheduleError::InvalidCron(format!(
                        "step must be positive in {}",
                        spec.name
                    )));
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.wildcard_max)
        } else if let Some((start, end)) = range.split_once('-') {
            let start = parse_value(start, spec)?;
            let end = parse_value(end, spec)?;
            if start > end {
                return Err(ScheduleError::InvalidCron(format!(
                    "{} range {}-{} is reversed",
                    spec.name, start, end
                )));
            }
            (start, end)
        } else {
            let value = parse_value(range, spec)?;
            // `a/n` means "from a to the end of the range, every n".
            if item.contains('/') {
                (value, spec.wildcard_max.max(value))
            } else {
                (value, value)
            }
        };

        values.extend((start..=end).step_by(step as usize));
    }

    Ok(values)
}

fn parse_value(text: &str, spec: &FieldSpec) -> Result<u32, ScheduleError> {
    let value: u32 = text.parse().map_err(|_| {
        ScheduleError::InvalidCron(format!("invalid {} value '{}'", spec.name, text))
    })?;
    if value < spec.min || value > spec.max {
        return Err(ScheduleError::InvalidCron(format!(
            "{} value {} out of range {}-{}",
            spec.name, value, spec.min, spec.max
        )));
    }
    Ok(value)
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Schedule {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Schedule> for String {
    fn from(schedule: Schedule) -> Self {
        schedule.expression
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}
