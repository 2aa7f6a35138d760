//! Splits a historical interval into bounded sub-windows for backfills.

use chrono::{DateTime, Months, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain::TimeWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SplitUnit {
    Hours,
    Days,
    Months,
    Years,
}

impl fmt::Display for SplitUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hours => "hours",
            Self::Days => "days",
            Self::Months => "months",
            Self::Years => "years",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SplitError {
    #[error("split step must be at least 1")]
    ZeroStep,

    #[error("unrecognized date `{0}` (expected YYYY-MM-DD, YYYY-MM, YYYY or RFC 3339)")]
    BadDate(String),
}

/// Cut `[start, end)` into consecutive windows of `step` units.
///
/// The last window is truncated at `end`. Months and years advance on the
/// calendar, so Jan 31 + 1 month is the last day of February.
pub fn split(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    unit: SplitUnit,
    step: u32,
) -> Result<Vec<TimeWindow>, SplitError> {
    if step == 0 {
        return Err(SplitError::ZeroStep);
    }

    let mut windows = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = advance(cursor, unit, step).map_or(end, |next| next.min(end));
        match TimeWindow::new(cursor, next) {
            Some(window) => windows.push(window),
            None => break,
        }
        cursor = next;
    }
    Ok(windows)
}

// None on overflow past chrono's representable range
fn advance(cursor: DateTime<Utc>, unit: SplitUnit, step: u32) -> Option<DateTime<Utc>> {
    match unit {
        SplitUnit::Hours => cursor.checked_add_signed(TimeDelta::try_hours(i64::from(step))?),
        SplitUnit::Days => cursor.checked_add_signed(TimeDelta::try_days(i64::from(step))?),
        SplitUnit::Months => cursor.checked_add_months(Months::new(step)),
        SplitUnit::Years => cursor.checked_add_months(Months::new(step.checked_mul(12)?)),
    }
}

/// Parse a loose date into UTC midnight (or the exact instant for RFC 3339).
///
/// Accepts `YYYY-MM-DD`, `YYYY/MM/DD`, `YYYY-MM`, `YYYY/MM` and `YYYY`; the
/// shorter forms mean the first day of the month or year.
pub fn parse_date(input: &str) -> Result<DateTime<Utc>, SplitError> {
    let input = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }

    let date = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(input, "%Y/%m/%d"))
        .or_else(|_| NaiveDate::parse_from_str(&format!("{input}-01"), "%Y-%m-%d"))
        .or_else(|_| NaiveDate::parse_from_str(&format!("{input}/01"), "%Y/%m/%d"))
        .ok()
        .or_else(|| {
            if input.len() == 4 {
                input
                    .parse::<i32>()
                    .ok()
                    .and_then(|year| NaiveDate::from_ymd_opt(year, 1, 1))
            } else {
                None
            }
        })
        .ok_or_else(|| SplitError::BadDate(input.to_string()))?;

    Ok(date.and_time(NaiveTime::MIN).and_utc())
}
