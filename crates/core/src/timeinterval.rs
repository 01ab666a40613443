//! Mute/active time intervals.
//!
//! Routes reference named intervals; the pipeline checks whether a flush's
//! `now` falls inside any of them. An interval is a union of
//! [`TimeRange`]s, each a conjunction of time-of-day, weekday and
//! day-of-month constraints evaluated in UTC.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Minutes in a day; the exclusive upper bound for time-of-day ranges.
const MINUTES_PER_DAY: u32 = 24 * 60;

/// A half-open `[start, end)` range of minutes within a day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDayRange {
    pub start_minute: u32,
    pub end_minute: u32,
}

impl TimeOfDayRange {
    /// Build a range from minute offsets, validating the bounds.
    pub fn new(start_minute: u32, end_minute: u32) -> Result<Self, ValidationError> {
        if start_minute >= end_minute || end_minute > MINUTES_PER_DAY {
            return Err(ValidationError::InvalidTimeRange(format!(
                "time of day range {start_minute}..{end_minute} is out of order or past midnight"
            )));
        }
        Ok(Self {
            start_minute,
            end_minute,
        })
    }

    fn contains(self, minute_of_day: u32) -> bool {
        (self.start_minute..self.end_minute).contains(&minute_of_day)
    }
}

/// An inclusive weekday range, `0` = Sunday through `6` = Saturday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekdayRange {
    pub begin: u32,
    pub end: u32,
}

impl WeekdayRange {
    /// Build a weekday range; `begin == end` selects a single day.
    pub fn new(begin: u32, end: u32) -> Result<Self, ValidationError> {
        if begin > 6 || end > 6 || begin > end {
            return Err(ValidationError::InvalidTimeRange(format!(
                "weekday range {begin}..={end} is invalid"
            )));
        }
        Ok(Self { begin, end })
    }

    fn contains(self, weekday_from_sunday: u32) -> bool {
        (self.begin..=self.end).contains(&weekday_from_sunday)
    }
}

/// An inclusive day-of-month range. Negative values count back from the
/// end of the month, `-1` being the last day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayOfMonthRange {
    pub begin: i32,
    pub end: i32,
}

impl DayOfMonthRange {
    pub fn new(begin: i32, end: i32) -> Result<Self, ValidationError> {
        if begin == 0 || end == 0 || begin.abs() > 31 || end.abs() > 31 {
            return Err(ValidationError::InvalidTimeRange(format!(
                "day of month range {begin}..={end} is invalid"
            )));
        }
        Ok(Self { begin, end })
    }

    fn contains(self, day: u32, days_in_month: u32) -> bool {
        let resolve = |bound: i32| -> i64 {
            if bound < 0 {
                i64::from(days_in_month) + 1 + i64::from(bound)
            } else {
                i64::from(bound)
            }
        };
        let (lo, hi) = (resolve(self.begin), resolve(self.end));
        (lo..=hi).contains(&i64::from(day))
    }
}

/// One conjunction of constraints. Empty constraint lists match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeRange {
    pub times: Vec<TimeOfDayRange>,
    pub weekdays: Vec<WeekdayRange>,
    pub days_of_month: Vec<DayOfMonthRange>,
}

impl TimeRange {
    fn contains(&self, t: DateTime<Utc>) -> bool {
        let minute = t.hour() * 60 + t.minute();
        if !self.times.is_empty() && !self.times.iter().any(|r| r.contains(minute)) {
            return false;
        }
        let weekday = t.weekday().num_days_from_sunday();
        if !self.weekdays.is_empty() && !self.weekdays.iter().any(|r| r.contains(weekday)) {
            return false;
        }
        if !self.days_of_month.is_empty() {
            let dim = days_in_month(t.year(), t.month());
            if !self
                .days_of_month
                .iter()
                .any(|r| r.contains(t.day(), dim))
            {
                return false;
            }
        }
        true
    }
}

/// A union of time ranges, as referenced by name from routes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeInterval(pub Vec<TimeRange>);

impl TimeInterval {
    /// Whether `t` falls inside any of the interval's ranges.
    #[must_use]
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.0.iter().any(|r| r.contains(t))
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 {
                29
            } else {
                28
            }
        }
        _ => 0,
    }
}
