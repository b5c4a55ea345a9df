//! Streaming SQL dump writer.
//!
//! Layout of a dump:
//!
//! ```text
//! -- Rollcall database dump
//! -- Backup: semester-20250102-030405067
//! -- Created: 2025-01-02T03:04:05.067+00:00
//! -- Range: 2024-07-01..2024-12-31
//!
//! -- Table: users
//! DROP TABLE IF EXISTS "users";
//! CREATE TABLE "users" (...);
//! CREATE INDEX "users_role_idx" ON "users" ("role");
//! INSERT INTO "users" ("id", "username") VALUES
//! (1, 'ani'),
//! (2, 'budi');
//! SELECT setval(pg_get_serial_sequence('"users"', 'id'), ...) FROM "users";
//! ```
//!
//! Secondary indexes come with the table structure; sequence resets, when
//! the backend has any, follow the rows.
//!
//! Every statement ends with `;` at the end of a line, which is what the
//! restore splitter keys on.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::calendar::DateRange;
use crate::db::sql::{quote_ident, quote_str};
use crate::db::{schema, Database, DateFilter, Row, SqlValue};
use crate::error::Result;

const WRITE_BUFFER: usize = 128 * 1024;

/// Rows written per table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpSummary {
    pub tables: BTreeMap<String, DumpedTable>,
    pub bytes: u64,
}

impl DumpSummary {
    pub fn total_rows(&self) -> u64 {
        self.tables.values().map(|t| t.rows).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpedTable {
    pub rows: u64,
    /// Restricted to the backup's date range
    pub filtered: bool,
}

/// Writes a database dump for one backup.
pub struct SqlDumpWriter<'a> {
    db: &'a dyn Database,
    batch_size: usize,
}

impl<'a> SqlDumpWriter<'a> {
    pub fn new(db: &'a dyn Database, batch_size: usize) -> Self {
        Self {
            db,
            batch_size: batch_size.max(1),
        }
    }

    /// Dump every table to `path`. Attendance-domain tables are restricted to
    /// `range`; everything else is dumped whole.
    pub async fn write(&self, path: &Path, backup_id: &str, range: DateRange) -> Result<DumpSummary> {
        let file = tokio::fs::File::create(path).await?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER, file);
        let mut summary = DumpSummary::default();

        let header = format!(
            "-- Rollcall database dump\n-- Backup: {}\n-- Created: {}\n-- Range: {}\n\n",
            backup_id,
            Utc::now().to_rfc3339(),
            range
        );
        writer.write_all(header.as_bytes()).await?;

        for table in self.db.list_tables().await? {
            let filter = schema::date_column_for(&table).map(|column| DateFilter::new(column, range));
            let rows = self.write_table(&mut writer, &table, filter.as_ref()).await?;
            tracing::debug!(table = %table, rows, filtered = filter.is_some(), "Table dumped");
            summary.tables.insert(
                table,
                DumpedTable {
                    rows,
                    filtered: filter.is_some(),
                },
            );
        }

        writer.write_all(b"-- End of dump\n").await?;
        writer.flush().await?;
        let file = writer.into_inner();
        file.sync_all().await?;
        summary.bytes = file.metadata().await?.len();
        Ok(summary)
    }

    async fn write_table<W>(&self, writer: &mut W, table: &str, filter: Option<&DateFilter>) -> Result<u64>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let ddl = self.db.table_ddl(table).await?;
        let mut block = format!("-- Table: {}\nDROP TABLE IF EXISTS {};\n", table, quote_ident(table));
        block.push_str(ddl.trim_end());
        if !block.ends_with(';') {
            block.push(';');
        }
        block.push('\n');
        writer.write_all(block.as_bytes()).await?;

        let mut offset = 0u64;
        loop {
            let rows = self
                .db
                .fetch_rows(table, filter, offset, self.batch_size as u64)
                .await?;
            if rows.is_empty() {
                break;
            }
            writer.write_all(insert_statement(table, &rows).as_bytes()).await?;
            offset += rows.len() as u64;
            if rows.len() < self.batch_size {
                break;
            }
        }
        for reset in self.db.sequence_resets(table).await? {
            writer.write_all(reset.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        writer.write_all(b"\n").await?;
        Ok(offset)
    }
}

/// One multi-row `INSERT` for `rows`, columns taken from the first row.
pub fn insert_statement(table: &str, rows: &[Row]) -> String {
    let Some(first) = rows.first() else {
        return String::new();
    };
    let columns: Vec<&str> = first.columns().collect();
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES\n",
        quote_ident(table),
        columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
    );
    for (i, row) in rows.iter().enumerate() {
        let values: Vec<String> = columns.iter().map(|c| sql_literal(&row.value(c))).collect();
        sql.push('(');
        sql.push_str(&values.join(", "));
        sql.push(')');
        sql.push_str(if i + 1 == rows.len() { ";\n" } else { ",\n" });
    }
    sql
}

/// Encode a value as a SQL literal.
///
/// Dates and timestamps that do not parse, or fall outside years
/// 1000..=9999, are written as `NULL`; so are non-finite floats.
pub fn sql_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Bool(true) => "TRUE".to_string(),
        SqlValue::Bool(false) => "FALSE".to_string(),
        SqlValue::Int(v) => v.to_string(),
        SqlValue::Float(v) if v.is_finite() => v.to_string(),
        SqlValue::Float(_) => "NULL".to_string(),
        SqlValue::Text(s) => quote_str(s),
        SqlValue::Date(s) => match valid_date(s) {
            true => quote_str(s),
            false => "NULL".to_string(),
        },
        SqlValue::DateTime(s) => match valid_datetime(s) {
            true => quote_str(s),
            false => "NULL".to_string(),
        },
    }
}

fn year_ok(year: i32) -> bool {
    (1000..=9999).contains(&year)
}

fn valid_date(s: &str) -> bool {
    use chrono::Datelike;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_or(false, |d| year_ok(d.year()))
}

/// Timestamps with or without a UTC offset. Values are written as read, so
/// an offset survives into the dump.
fn valid_datetime(s: &str) -> bool {
    use chrono::Datelike;
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return year_ok(dt.year());
    }
    let s = s.replacen('T', " ", 1);
    let zoned = ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%#z"]
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(&s, fmt).ok())
        .map(|dt| dt.naive_local());
    zoned
        .or_else(|| {
            ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(&s, fmt).ok())
        })
        .map_or(false, |dt| year_ok(dt.year()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDatabase;

    #[test]
    fn test_literals() {
        assert_eq!(sql_literal(&SqlValue::Null), "NULL");
        assert_eq!(sql_literal(&SqlValue::Bool(true)), "TRUE");
        assert_eq!(sql_literal(&SqlValue::Int(-4)), "-4");
        assert_eq!(sql_literal(&SqlValue::Float(2.5)), "2.5");
        assert_eq!(sql_literal(&SqlValue::Float(f64::NAN)), "NULL");
        assert_eq!(sql_literal(&SqlValue::text("O'Brien")), "'O''Brien'");
        assert_eq!(sql_literal(&SqlValue::Date("2025-01-31".into())), "'2025-01-31'");
        assert_eq!(sql_literal(&SqlValue::Date("0000-00-00".into())), "NULL");
        assert_eq!(sql_literal(&SqlValue::Date("0999-01-01".into())), "NULL");
        assert_eq!(
            sql_literal(&SqlValue::DateTime("2025-01-31 07:05:00".into())),
            "'2025-01-31 07:05:00'"
        );
        assert_eq!(sql_literal(&SqlValue::DateTime("not a time".into())), "NULL");
    }

    #[test]
    fn test_offset_timestamps_are_kept() {
        for stamp in [
            "2025-01-02 07:15:00.123+07:00",
            "2025-01-02 07:15:00+07",
            "2025-01-02T00:15:00Z",
            "2025-01-02T07:15:00.5-03:30",
        ] {
            assert_eq!(sql_literal(&SqlValue::DateTime(stamp.into())), quote_str(stamp), "{}", stamp);
        }
        assert_eq!(sql_literal(&SqlValue::DateTime("0999-01-02 07:15:00+07:00".into())), "NULL");

        // timestamptz as PostgreSQL's row_to_json renders it
        let cell = crate::db::sql::json_to_value(
            &serde_json::json!("2025-01-02T07:15:00.123+07:00"),
            "timestamp with time zone",
        );
        assert_eq!(sql_literal(&cell), "'2025-01-02 07:15:00.123+07:00'");
    }

    #[test]
    fn test_insert_statement_batches_rows() {
        let rows = vec![
            Row::new().with("id", 1).with("name", "a"),
            Row::new().with("id", 2).with("name", None::<String>),
        ];
        assert_eq!(
            insert_statement("classes", &rows),
            "INSERT INTO \"classes\" (\"id\", \"name\") VALUES\n(1, 'a'),\n(2, NULL);\n"
        );
        assert_eq!(insert_statement("classes", &[]), "");
    }

    #[tokio::test]
    async fn test_dump_filters_attendance_tables_only() {
        let db = SqliteDatabase::with_school_schema().await.unwrap();
        for id in 1..=3 {
            db.insert_row(
                "classes",
                Row::new().with("id", id).with("name", format!("7{}", id)),
            )
            .await
            .unwrap();
        }
        for (id, date) in [(1, "2025-01-05"), (2, "2025-02-05"), (3, "2024-12-31")] {
            db.insert_row(
                "student_attendance",
                Row::new()
                    .with("id", id)
                    .with("student_id", 1)
                    .with("class_id", 1)
                    .with("date", SqlValue::Date(date.into()))
                    .with("status", "present"),
            )
            .await
            .unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.sql");
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
        )
        .unwrap();
        let summary = SqlDumpWriter::new(&db, 2).write(&path, "range-test", range).await.unwrap();

        assert_eq!(summary.tables["classes"], DumpedTable { rows: 3, filtered: false });
        assert_eq!(summary.tables["student_attendance"], DumpedTable { rows: 1, filtered: true });
        assert_eq!(summary.tables["users"].rows, 0);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("-- Rollcall database dump\n-- Backup: range-test\n"));
        assert!(text.contains("DROP TABLE IF EXISTS \"classes\";"));
        // batch size 2 splits the three classes into two statements
        assert_eq!(text.matches("INSERT INTO \"classes\"").count(), 2);
        assert!(!text.contains("2025-02-05"));
        assert_eq!(summary.bytes, text.len() as u64);
    }

    #[tokio::test]
    async fn test_indexes_follow_their_table() {
        let db = SqliteDatabase::with_school_schema().await.unwrap();
        db.execute(r#"CREATE INDEX "attendance_day_idx" ON "student_attendance" ("date", "class_id");"#)
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.sql");
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
        )
        .unwrap();
        SqlDumpWriter::new(&db, 10).write(&path, "full-test", range).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let table = text.find("-- Table: student_attendance\n").unwrap();
        let index = text
            .find("CREATE INDEX \"attendance_day_idx\" ON \"student_attendance\" (\"date\", \"class_id\");\n")
            .unwrap();
        let next = text.find("-- Table: subjects\n").unwrap();
        assert!(table < index && index < next);
    }
}
