//! Recurrence handling for scheduled scaling and scheduled node deletion.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScaleError;

/// Launch time layout accepted by the scaling service, always UTC.
pub const TIME_LAYOUT: &str = "%Y-%m-%dT%H:%MZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecurrenceType {
    Daily,
    Weekly,
    Monthly,
}

impl RecurrenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurrenceType::Daily => "Daily",
            RecurrenceType::Weekly => "Weekly",
            RecurrenceType::Monthly => "Monthly",
        }
    }
}

impl fmt::Display for RecurrenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecurrenceType {
    type Err = ScaleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(RecurrenceType::Daily),
            "weekly" => Ok(RecurrenceType::Weekly),
            "monthly" => Ok(RecurrenceType::Monthly),
            other => Err(ScaleError::InvalidRequest(format!(
                "unknown recurrence type '{other}'"
            ))),
        }
    }
}

pub fn parse_launch_time(value: &str) -> Result<DateTime<Utc>, ScaleError> {
    NaiveDateTime::parse_from_str(value.trim(), TIME_LAYOUT)
        .map(|naive| naive.and_utc())
        .map_err(|err| {
            ScaleError::InvalidRequest(format!("invalid launch time '{value}': {err}"))
        })
}

pub fn format_launch_time(time: DateTime<Utc>) -> String {
    time.format(TIME_LAYOUT).to_string()
}

fn valid_field(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || c == ',' || c == '-')
        && !value.starts_with([',', '-'])
        && !value.ends_with([',', '-'])
}

/// Five-field cron expression firing at the launch time's minute and hour,
/// on the days the recurrence selects.
///
/// - Daily: `value` is the day interval (`*` for every day)
/// - Weekly: `value` lists weekdays, e.g. `0,6`
/// - Monthly: `value` lists or ranges month days, e.g. `1-5`
pub fn cron_expression(
    launch_time: DateTime<Utc>,
    recurrence: RecurrenceType,
    value: &str,
) -> Result<String, ScaleError> {
    let minute = launch_time.minute();
    let hour = launch_time.hour();
    let value = value.trim();

    let expr = match recurrence {
        RecurrenceType::Daily => {
            let every: u32 = value.parse().map_err(|_| {
                ScaleError::InvalidRequest(format!("invalid daily recurrence value '{value}'"))
            })?;
            if every <= 1 {
                format!("{minute} {hour} * * *")
            } else {
                format!("{minute} {hour} */{every} * *")
            }
        }
        RecurrenceType::Weekly => {
            if !valid_field(value) {
                return Err(ScaleError::InvalidRequest(format!(
                    "invalid weekly recurrence value '{value}'"
                )));
            }
            format!("{minute} {hour} * * {value}")
        }
        RecurrenceType::Monthly => {
            if !valid_field(value) {
                return Err(ScaleError::InvalidRequest(format!(
                    "invalid monthly recurrence value '{value}'"
                )));
            }
            format!("{minute} {hour} {value} * *")
        }
    };

    Ok(expr)
}
