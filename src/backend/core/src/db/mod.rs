//! Database layer for Rollcall.
//!
//! Every subsystem talks to the relational store through the [`Database`]
//! trait. Two implementations ship with the crate:
//!
//! - [`PgDatabase`]: PostgreSQL via sqlx, used in production
//! - [`SqliteDatabase`]: in-memory SQLite via sqlx, for tests and local runs
//!
//! Both send the statements built in [`sql`], so reports and archive moves
//! behave the same on either backend.
//!
//! Rows travel as ordered `(column, value)` pairs so that dumps keep the
//! table's column order.

pub mod postgres;
pub mod schema;
pub mod sql;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::calendar::DateRange;
use crate::error::Result;

pub use postgres::PgDatabase;
pub use sqlite::SqliteDatabase;

// ═══════════════════════════════════════════════════════════════════════════════
// Values and Rows
// ═══════════════════════════════════════════════════════════════════════════════

/// A single column value.
///
/// Dates and timestamps keep the textual form the store returned; whether
/// that text is a valid calendar value is decided by whoever encodes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(String),
    DateTime(String),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::Date(s) | Self::DateTime(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret the value as a calendar date (timestamps are truncated).
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(s) | Self::DateTime(s) | Self::Text(s) => parse_date_prefix(s),
            _ => None,
        }
    }

    pub fn date(value: NaiveDate) -> Self {
        Self::Date(value.format("%Y-%m-%d").to_string())
    }

    pub fn datetime(value: NaiveDateTime) -> Self {
        Self::DateTime(value.format("%Y-%m-%d %H:%M:%S").to_string())
    }

    pub fn timestamp(value: DateTime<Utc>) -> Self {
        Self::datetime(value.naive_utc())
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) | Self::Date(s) | Self::DateTime(s) => f.write_str(s),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

fn parse_date_prefix(s: &str) -> Option<NaiveDate> {
    let head = s.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// One row as ordered `(column, value)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    cells: Vec<(String, SqlValue)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.push(column, value);
        self
    }

    /// Set a column, replacing an existing value of the same name.
    pub fn push(&mut self, column: impl Into<String>, value: impl Into<SqlValue>) {
        let column = column.into();
        let value = value.into();
        match self.cells.iter_mut().find(|(c, _)| *c == column) {
            Some(cell) => cell.1 = value,
            None => self.cells.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.cells.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    /// Value for `column`, `Null` when absent.
    pub fn value(&self, column: &str) -> SqlValue {
        self.get(column).cloned().unwrap_or(SqlValue::Null)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(c, _)| c.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &SqlValue> {
        self.cells.iter().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.cells.iter().map(|(c, v)| (c.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queries
// ═══════════════════════════════════════════════════════════════════════════════

/// Inclusive date restriction on one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateFilter {
    pub column: String,
    pub range: DateRange,
}

impl DateFilter {
    pub fn new(column: impl Into<String>, range: DateRange) -> Self {
        Self {
            column: column.into(),
            range,
        }
    }
}

/// Named result sets the report layer can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportSource {
    /// Student attendance joined with student and class names
    StudentAttendance,
    /// Teacher attendance joined with teacher, class and subject names
    TeacherAttendance,
    /// Permission requests joined with the requesting user
    PermissionRequests,
    /// Counts by status for students and teachers
    AttendanceSummary,
    /// Per-student counts by status (semester recap)
    StudentRecap,
    Users,
    Classes,
    Subjects,
}

/// A report query: a source plus the caller's filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportQuery {
    pub source: ReportSource,
    pub range: Option<DateRange>,
    pub class_id: Option<i64>,
    pub teacher_id: Option<i64>,
}

impl ReportQuery {
    pub fn new(source: ReportSource) -> Self {
        Self {
            source,
            range: None,
            class_id: None,
            teacher_id: None,
        }
    }

    pub fn with_range(mut self, range: DateRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_class(mut self, class_id: Option<i64>) -> Self {
        self.class_id = class_id;
        self
    }

    pub fn with_teacher(mut self, teacher_id: Option<i64>) -> Self {
        self.teacher_id = teacher_id;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Database Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Interface to the relational store.
///
/// Read-only except for the archive operations and statement replay.
#[async_trait]
pub trait Database: Send + Sync {
    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// All user tables, sorted by name.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Structure statements for one table: `CREATE TABLE ...;` followed by
    /// its secondary indexes, each statement ending with `;` on its own line.
    async fn table_ddl(&self, table: &str) -> Result<String>;

    /// Statements that move id sequences past the rows of `table` once they
    /// have been reloaded.
    async fn sequence_resets(&self, _table: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Rows of `table` in primary-key order, optionally filtered by date.
    async fn fetch_rows(
        &self,
        table: &str,
        filter: Option<&DateFilter>,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Row>>;

    /// Row count of `table`, optionally filtered by date.
    async fn count_rows(&self, table: &str, filter: Option<&DateFilter>) -> Result<u64>;

    /// Execute a named report query.
    async fn query_report(&self, query: &ReportQuery) -> Result<Vec<Row>>;

    /// Create `archive` as a copy of `source`'s columns plus `archived_at`,
    /// unique on the source id, if it does not exist yet.
    async fn ensure_archive_table(&self, source: &str, archive: &str) -> Result<()>;

    /// Copy rows with `date_column < cutoff` into `archive`, ignoring rows
    /// already present. Returns the number of rows inserted.
    async fn copy_to_archive(
        &self,
        source: &str,
        archive: &str,
        date_column: &str,
        cutoff: NaiveDate,
        archived_at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Delete live rows with `date_column < cutoff` that exist in `archive`.
    async fn delete_archived(
        &self,
        source: &str,
        archive: &str,
        date_column: &str,
        cutoff: NaiveDate,
    ) -> Result<u64>;

    /// Execute one arbitrary statement.
    async fn execute(&self, statement: &str) -> Result<u64>;

    /// Execute all statements in one transaction.
    async fn execute_atomic(&self, statements: &[String]) -> Result<u64>;

    /// Approximate on-disk size of the database.
    async fn database_size_bytes(&self) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_preserves_order_and_replaces() {
        let mut row = Row::new().with("id", 1).with("name", "Ani").with("note", None::<String>);
        row.push("name", "Budi");
        let columns: Vec<&str> = row.columns().collect();
        assert_eq!(columns, vec!["id", "name", "note"]);
        assert_eq!(row.value("name"), SqlValue::text("Budi"));
        assert!(row.value("note").is_null());
        assert!(row.value("missing").is_null());
    }

    #[test]
    fn test_sql_value_accessors() {
        assert_eq!(SqlValue::Int(7).as_i64(), Some(7));
        assert_eq!(SqlValue::text(" 12 ").as_i64(), Some(12));
        assert_eq!(
            SqlValue::DateTime("2025-03-04 07:15:00".into()).as_date(),
            NaiveDate::from_ymd_opt(2025, 3, 4)
        );
        assert_eq!(SqlValue::Date("0000-00-00".into()).as_date(), None);
        assert_eq!(SqlValue::Null.to_string(), "");
    }
}
