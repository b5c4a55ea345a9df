//! Backup specifications and identifiers.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::calendar::{self, DateRange, Semester};
use crate::error::{ErrorCode, Result, RollcallError};

/// Earliest date covered by a full scheduled backup.
pub const FULL_BACKUP_START: (i32, u32, u32) = (2000, 1, 1);

/// Named schedules for recurring backups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// Yesterday and today
    Daily,
    /// The last 7 days
    Weekly,
    /// The last 30 days
    Monthly,
    /// Everything since 2000-01-01
    Full,
}

impl Schedule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Full => "full",
        }
    }

    pub fn date_range(&self, today: NaiveDate) -> Result<DateRange> {
        let range = match self {
            Self::Daily => DateRange::trailing_days(today, 1),
            Self::Weekly => DateRange::trailing_days(today, 7),
            Self::Monthly => DateRange::trailing_days(today, 30),
            Self::Full => {
                let (y, m, d) = FULL_BACKUP_START;
                let start = NaiveDate::from_ymd_opt(y, m, d)
                    .ok_or_else(|| RollcallError::internal("invalid full backup start date"))?;
                DateRange::new(start.min(today), today)?
            }
        };
        Ok(range)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Schedule {
    type Err = RollcallError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "full" => Ok(Self::Full),
            other => Err(RollcallError::validation(format!("unknown backup schedule '{}'", other))),
        }
    }
}

/// Kind of backup, as recorded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Semester,
    DateRange,
    Scheduled,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Semester => f.write_str("semester"),
            Self::DateRange => f.write_str("date_range"),
            Self::Scheduled => f.write_str("scheduled"),
        }
    }
}

/// What a backup covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackupSpec {
    Semester { semester: Semester, year: i32 },
    DateRange { start_date: NaiveDate, end_date: NaiveDate },
    Scheduled { name: String },
}

impl BackupSpec {
    pub fn semester(semester: Semester, year: i32) -> Self {
        Self::Semester { semester, year }
    }

    pub fn date_range(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self::DateRange { start_date, end_date }
    }

    pub fn scheduled(name: impl Into<String>) -> Self {
        Self::Scheduled { name: name.into() }
    }

    /// Prefix of the backup id.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Semester { .. } => "semester",
            Self::DateRange { .. } => "range",
            Self::Scheduled { .. } => "scheduled",
        }
    }

    pub fn backup_type(&self) -> BackupType {
        match self {
            Self::Semester { .. } => BackupType::Semester,
            Self::DateRange { .. } => BackupType::DateRange,
            Self::Scheduled { .. } => BackupType::Scheduled,
        }
    }

    /// Ad-hoc date-range backups never age out unrelated data.
    pub fn archives_old_data(&self) -> bool {
        !matches!(self, Self::DateRange { .. })
    }

    /// Resolve the effective date range.
    pub fn resolve(&self, today: NaiveDate) -> Result<DateRange> {
        match self {
            Self::Semester { semester, year } => {
                calendar::validate_year(*year)?;
                semester.date_range(*year)
            }
            Self::DateRange { start_date, end_date } => DateRange::new(*start_date, *end_date),
            Self::Scheduled { name } => name.parse::<Schedule>()?.date_range(today),
        }
    }

    /// The manifest's scope block.
    pub fn scope(&self, today: NaiveDate) -> Result<BackupScope> {
        let range = self.resolve(today)?;
        let mut scope = BackupScope {
            start_date: range.start,
            end_date: range.end,
            semester: None,
            year: None,
            schedule: None,
        };
        match self {
            Self::Semester { semester, year } => {
                scope.semester = Some(*semester);
                scope.year = Some(*year);
            }
            Self::Scheduled { name } => scope.schedule = Some(name.parse::<Schedule>()?),
            Self::DateRange { .. } => {}
        }
        Ok(scope)
    }
}

/// Date range plus the parameters it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupScope {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semester: Option<Semester>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
}

impl BackupScope {
    pub fn range(&self) -> Result<DateRange> {
        DateRange::new(self.start_date, self.end_date)
    }
}

/// `{tag}-{yyyymmdd-HHMMSSmmm}`
pub fn backup_id(spec: &BackupSpec, now: DateTime<Utc>) -> String {
    format!("{}-{}", spec.tag(), now.format("%Y%m%d-%H%M%S%3f"))
}

/// Backup ids become path components; only `[A-Za-z0-9_-]` is accepted.
pub fn validate_backup_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(RollcallError::new(
            ErrorCode::InvalidInput,
            format!("invalid backup id '{}'", id),
        ));
    }
    Ok(())
}

/// Today's date in UTC.
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Date `days` before `date`.
pub fn days_before(date: NaiveDate, days: i64) -> NaiveDate {
    date - Duration::days(days)
}
