//! Date ranges and semester windows.

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, RollcallError};

/// Inclusive range of calendar dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Create a validated range (`start <= end`).
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(RollcallError::validation(format!(
                "start date {} is after end date {}",
                start, end
            ))
            .with_context("start_date", start)
            .with_context("end_date", end));
        }
        Ok(Self { start, end })
    }

    /// Range ending at `today` and covering `days` days before it.
    pub fn trailing_days(today: NaiveDate, days: i64) -> Self {
        Self {
            start: today - Duration::days(days),
            end: today,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Number of days covered, both ends included.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Academic semester. The odd semester (`Ganjil`) runs July to December and
/// the even semester (`Genap`) January to June of the same calendar year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Semester {
    #[serde(alias = "ganjil")]
    Ganjil,
    #[serde(alias = "genap")]
    Genap,
}

impl Semester {
    /// Resolve the fixed half-year window for `year`.
    pub fn date_range(&self, year: i32) -> Result<DateRange> {
        let (start, end) = match self {
            Self::Ganjil => (ymd(year, 7, 1)?, ymd(year, 12, 31)?),
            Self::Genap => (ymd(year, 1, 1)?, ymd(year, 6, 30)?),
        };
        DateRange::new(start, end)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ganjil => "Ganjil",
            Self::Genap => "Genap",
        }
    }
}

impl fmt::Display for Semester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Semester {
    type Err = RollcallError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ganjil" | "odd" | "1" => Ok(Self::Ganjil),
            "genap" | "even" | "2" => Ok(Self::Genap),
            other => Err(RollcallError::validation(format!("unknown semester '{}'", other))),
        }
    }
}

/// Years accepted for semester scopes.
pub const MIN_YEAR: i32 = 2000;
pub const MAX_YEAR: i32 = 2100;

pub fn validate_year(year: i32) -> Result<()> {
    if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
        return Err(RollcallError::validation(format!(
            "year {} is outside {}..={}",
            year, MIN_YEAR, MAX_YEAR
        )));
    }
    Ok(())
}

/// First date that is *not* archived when data older than `months` is aged out.
/// Calendar months are subtracted and the day is clamped to the month's end.
pub fn cutoff_for_age(today: NaiveDate, months: u32) -> NaiveDate {
    let total = today.year() * 12 + today.month0() as i32 - months as i32;
    let year = total.div_euclid(12);
    let month = total.rem_euclid(12) as u32 + 1;
    let mut day = today.day();
    loop {
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            return date;
        }
        day -= 1;
    }
}

fn ymd(year: i32, month: u32, day: u32) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| RollcallError::validation(format!("invalid date {}-{}-{}", year, month, day)))
}
