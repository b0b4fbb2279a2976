//! Calendar windows used by the reservation sync.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp layout expected by the data-source and destination APIs.
pub const API_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Granularity of a synchronised window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Day,
    Month,
    Year,
}

impl PeriodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodType::Day => "day",
            PeriodType::Month => "month",
            PeriodType::Year => "year",
        }
    }
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeriodType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "day" | "daily" => Ok(PeriodType::Day),
            "month" | "monthly" => Ok(PeriodType::Month),
            "year" | "yearly" => Ok(PeriodType::Year),
            other => Err(format!("Period type '{}' is not supported", other)),
        }
    }
}

/// Inclusive window from the first instant of its first day to
/// 23:59:59.999999 of its last day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub kind: PeriodType,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    /// The window of type `kind` that contains `at`.
    pub fn containing(kind: PeriodType, at: DateTime<Utc>) -> Self {
        let date = at.date_naive();
        let (first, last) = match kind {
            PeriodType::Day => (date, date),
            PeriodType::Month => {
                let first = first_of_month(date.year(), date.month());
                (first, last_of_month(date.year(), date.month()))
            }
            PeriodType::Year => (
                first_of_month(date.year(), 1),
                last_of_month(date.year(), 12),
            ),
        };

        Self {
            kind,
            start: start_of_day(first),
            end: end_of_day(last),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }

    pub fn start_param(&self) -> String {
        format_api_timestamp(self.start)
    }

    pub fn end_param(&self) -> String {
        format_api_timestamp(self.end)
    }
}

pub fn format_api_timestamp(at: DateTime<Utc>) -> String {
    at.format(API_TIMESTAMP_FORMAT).to_string()
}

pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    let end: NaiveDateTime = date
        .and_hms_micro_opt(23, 59, 59, 999_999)
        .unwrap_or_else(|| date.and_time(chrono::NaiveTime::MIN));
    end.and_utc()
}

fn first_of_month(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN)
}

fn last_of_month(year: i32, month: u32) -> NaiveDate {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    first_of_month(next_year, next_month)
        .pred_opt()
        .unwrap_or(NaiveDate::MIN)
}
