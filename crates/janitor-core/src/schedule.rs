//! Wall-clock recurrence for the policy tick

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 15:00 UTC every day, which is 08:00 in US Pacific daylight time.
pub const DAILY_AT_EIGHT_AM: &str = "0 0 15 * * *";

/// Schedule parse errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("expected 6 fields (second minute hour day month weekday), got {0}")]
    FieldCount(usize),

    #[error("invalid {field} field '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("{field} field must be '*' for a daily schedule, got '{value}'")]
    NotDaily { field: &'static str, value: String },
}

/// Anything that can say when the next tick is due
pub trait Recurrence: Send + Sync {
    /// First occurrence strictly after `after`
    fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc>;
}

/// Fires once per calendar day at a fixed UTC time of day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    at: NaiveTime,
}

impl DailySchedule {
    pub fn new(hour: u32, minute: u32, second: u32) -> Result<Self, ScheduleError> {
        let at = NaiveTime::from_hms_opt(hour, minute, second).ok_or_else(|| {
            ScheduleError::InvalidField {
                field: "time",
                value: format!("{:02}:{:02}:{:02}", hour, minute, second),
            }
        })?;
        Ok(Self { at })
    }

    /// Parse `second minute hour day month weekday`, where the last three are `*`
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let [second, minute, hour, day, month, weekday] = fields[..] else {
            return Err(ScheduleError::FieldCount(fields.len()));
        };

        for (field, value) in [("day", day), ("month", month), ("weekday", weekday)] {
            if value != "*" {
                return Err(ScheduleError::NotDaily {
                    field,
                    value: value.to_string(),
                });
            }
        }

        Self::new(
            parse_field("hour", hour, 23)?,
            parse_field("minute", minute, 59)?,
            parse_field("second", second, 59)?,
        )
    }

    pub fn time_of_day(&self) -> NaiveTime {
        self.at
    }
}

fn parse_field(field: &'static str, value: &str, max: u32) -> Result<u32, ScheduleError> {
    value
        .parse::<u32>()
        .ok()
        .filter(|v| *v <= max)
        .ok_or_else(|| ScheduleError::InvalidField {
            field,
            value: value.to_string(),
        })
}

impl Recurrence for DailySchedule {
    fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let today = Utc.from_utc_datetime(&after.date_naive().and_time(self.at));
        if today > after {
            today
        } else {
            today + Duration::days(1)
        }
    }
}

impl FromStr for DailySchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DailySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use chrono::Timelike;
        write!(
            f,
            "{} {} {} * * *",
            self.at.second(),
            self.at.minute(),
            self.at.hour()
        )
    }
}
