//! SQL text shared by the PostgreSQL and SQLite backends.
//!
//! Both backends send the same report, paging and archive statements; only
//! placeholders and the JSON row constructor differ between dialects. Rows
//! come back as JSON text and are mapped onto [`SqlValue`] here.

use chrono::NaiveDate;

use super::schema::{self, ARCHIVED_AT_COLUMN};
use super::{DateFilter, ReportQuery, ReportSource, Row, SqlValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Positional parameter `index` (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::Postgres => format!("${}", index),
            Self::Sqlite => format!("?{}", index),
        }
    }

    /// JSON object text built from `(key, expression)` pairs.
    pub fn json_object(self, pairs: &[(&str, String)]) -> String {
        let args = pairs
            .iter()
            .map(|(key, expr)| format!("{}, {}", quote_str(key), expr))
            .collect::<Vec<_>>()
            .join(", ");
        match self {
            Self::Postgres => format!("json_build_object({})::text", args),
            Self::Sqlite => format!("json_object({})", args),
        }
    }

    /// Whole row of `alias` as JSON text.
    fn row_json(self, alias: &str, columns: &[String]) -> String {
        match self {
            Self::Postgres => format!("row_to_json({})::text", alias),
            Self::Sqlite => {
                let pairs: Vec<(&str, String)> = columns
                    .iter()
                    .map(|c| (c.as_str(), format!("{}.{}", alias, quote_ident(c))))
                    .collect();
                self.json_object(&pairs)
            }
        }
    }

    /// Ordering used when a table has no primary key.
    fn fallback_order(self) -> &'static str {
        match self {
            Self::Postgres => "1",
            Self::Sqlite => "t.rowid",
        }
    }
}

/// A value bound to a positional parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Date(NaiveDate),
    Id(i64),
}

/// SQL text plus its parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Param>,
}

struct Binder {
    dialect: Dialect,
    params: Vec<Param>,
}

impl Binder {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, param: Param) -> String {
        self.params.push(param);
        self.dialect.placeholder(self.params.len())
    }

    fn finish(self, sql: String) -> Statement {
        Statement {
            sql,
            params: self.params,
        }
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn quote_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn where_clause(conditions: &[String]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Table Access
// ═══════════════════════════════════════════════════════════════════════════════

/// One page of `table` as JSON rows, in `order_by` order.
pub fn select_rows(
    dialect: Dialect,
    table: &str,
    columns: &[String],
    filter: Option<&DateFilter>,
    order_by: Option<&str>,
    offset: u64,
    limit: u64,
) -> Statement {
    let mut binder = Binder::new(dialect);
    let mut conditions = Vec::new();
    if let Some(f) = filter {
        let start = binder.bind(Param::Date(f.range.start));
        let end = binder.bind(Param::Date(f.range.end));
        conditions.push(format!("t.{} BETWEEN {} AND {}", quote_ident(&f.column), start, end));
    }
    let order = match order_by {
        Some(column) => format!("t.{}", quote_ident(column)),
        None => dialect.fallback_order().to_string(),
    };
    let sql = format!(
        "SELECT {} FROM {} t {} ORDER BY {} LIMIT {} OFFSET {}",
        dialect.row_json("t", columns),
        quote_ident(table),
        where_clause(&conditions),
        order,
        limit.min(i64::MAX as u64),
        offset
    );
    binder.finish(sql)
}

pub fn count_rows(dialect: Dialect, table: &str, filter: Option<&DateFilter>) -> Statement {
    let mut binder = Binder::new(dialect);
    let mut conditions = Vec::new();
    if let Some(f) = filter {
        let start = binder.bind(Param::Date(f.range.start));
        let end = binder.bind(Param::Date(f.range.end));
        conditions.push(format!("{} BETWEEN {} AND {}", quote_ident(&f.column), start, end));
    }
    let sql = format!("SELECT COUNT(*) FROM {} {}", quote_ident(table), where_clause(&conditions));
    binder.finish(sql)
}

/// Copy rows older than the cutoff (parameter 1) into the archive, stamping
/// them with parameter 2. Rows whose id is already archived are skipped.
pub fn copy_to_archive(dialect: Dialect, source: &str, archive: &str, columns: &[String], date_column: &str) -> String {
    let list = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    format!(
        "INSERT INTO {archive} ({list}, {archived}) SELECT {list}, {stamp} FROM {source} WHERE {date} < {cutoff} ON CONFLICT (\"id\") DO NOTHING",
        archive = quote_ident(archive),
        list = list,
        archived = quote_ident(ARCHIVED_AT_COLUMN),
        stamp = dialect.placeholder(2),
        source = quote_ident(source),
        date = quote_ident(date_column),
        cutoff = dialect.placeholder(1),
    )
}

/// Delete live rows older than the cutoff (parameter 1) that exist in the archive.
pub fn delete_archived(dialect: Dialect, source: &str, archive: &str, date_column: &str) -> String {
    let source = quote_ident(source);
    format!(
        "DELETE FROM {source} WHERE {date} < {cutoff} AND EXISTS (SELECT 1 FROM {archive} a WHERE a.\"id\" = {source}.\"id\")",
        source = source,
        date = quote_ident(date_column),
        cutoff = dialect.placeholder(1),
        archive = quote_ident(archive),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reports
// ═══════════════════════════════════════════════════════════════════════════════

/// Tables a report source reads.
pub fn report_tables(source: ReportSource) -> &'static [&'static str] {
    match source {
        ReportSource::StudentAttendance => &[schema::STUDENT_ATTENDANCE, schema::USERS, schema::CLASSES],
        ReportSource::TeacherAttendance => &[
            schema::TEACHER_ATTENDANCE,
            schema::USERS,
            schema::CLASSES,
            schema::SUBJECTS,
        ],
        ReportSource::PermissionRequests => &[schema::PERMISSION_REQUESTS, schema::USERS],
        ReportSource::AttendanceSummary => &[schema::STUDENT_ATTENDANCE, schema::TEACHER_ATTENDANCE],
        ReportSource::StudentRecap => &[schema::STUDENT_ATTENDANCE, schema::USERS, schema::CLASSES],
        ReportSource::Users => &[schema::USERS],
        ReportSource::Classes => &[schema::CLASSES],
        ReportSource::Subjects => &[schema::SUBJECTS],
    }
}

fn range_conditions(binder: &mut Binder, column: &str, query: &ReportQuery, out: &mut Vec<String>) {
    if let Some(range) = &query.range {
        let start = binder.bind(Param::Date(range.start));
        let end = binder.bind(Param::Date(range.end));
        out.push(format!("{} >= {}", column, start));
        out.push(format!("{} <= {}", column, end));
    }
}

fn id_condition(binder: &mut Binder, column: &str, id: Option<i64>, out: &mut Vec<String>) {
    if let Some(id) = id {
        let p = binder.bind(Param::Id(id));
        out.push(format!("{} = {}", column, p));
    }
}

fn pairs(items: &[(&'static str, &str)]) -> Vec<(&'static str, String)> {
    items.iter().map(|(k, e)| (*k, e.to_string())).collect()
}

/// The statement behind a named report.
pub fn report(dialect: Dialect, query: &ReportQuery) -> Statement {
    let mut b = Binder::new(dialect);
    let mut conditions = Vec::new();
    let sql = match query.source {
        ReportSource::StudentAttendance => {
            range_conditions(&mut b, "sa.date", query, &mut conditions);
            id_condition(&mut b, "sa.class_id", query.class_id, &mut conditions);
            format!(
                "SELECT {} FROM student_attendance sa \
                 LEFT JOIN users u ON u.id = sa.student_id \
                 LEFT JOIN classes c ON c.id = sa.class_id \
                 {} ORDER BY sa.date, c.name, u.full_name, sa.id",
                dialect.json_object(&pairs(&[
                    ("date", "sa.date"),
                    ("student_number", "u.identity_number"),
                    ("student_name", "u.full_name"),
                    ("class_name", "c.name"),
                    ("status", "sa.status"),
                    ("check_in", "sa.check_in"),
                    ("notes", "sa.notes"),
                ])),
                where_clause(&conditions)
            )
        }
        ReportSource::TeacherAttendance => {
            range_conditions(&mut b, "ta.date", query, &mut conditions);
            id_condition(&mut b, "ta.class_id", query.class_id, &mut conditions);
            id_condition(&mut b, "ta.teacher_id", query.teacher_id, &mut conditions);
            format!(
                "SELECT {} FROM teacher_attendance ta \
                 LEFT JOIN users u ON u.id = ta.teacher_id \
                 LEFT JOIN classes c ON c.id = ta.class_id \
                 LEFT JOIN subjects s ON s.id = ta.subject_id \
                 {} ORDER BY ta.date, u.full_name, ta.id",
                dialect.json_object(&pairs(&[
                    ("date", "ta.date"),
                    ("teacher_number", "u.identity_number"),
                    ("teacher_name", "u.full_name"),
                    ("class_name", "c.name"),
                    ("subject_name", "s.name"),
                    ("status", "ta.status"),
                    ("check_in", "ta.check_in"),
                    ("notes", "ta.notes"),
                ])),
                where_clause(&conditions)
            )
        }
        ReportSource::PermissionRequests => {
            range_conditions(&mut b, "p.request_date", query, &mut conditions);
            id_condition(&mut b, "u.class_id", query.class_id, &mut conditions);
            format!(
                "SELECT {} FROM permission_requests p \
                 LEFT JOIN users u ON u.id = p.user_id \
                 {} ORDER BY p.request_date, u.full_name, p.id",
                dialect.json_object(&pairs(&[
                    ("request_date", "p.request_date"),
                    ("requester_name", "u.full_name"),
                    ("role", "u.role"),
                    ("start_date", "p.start_date"),
                    ("end_date", "p.end_date"),
                    ("reason", "p.reason"),
                    ("status", "p.status"),
                ])),
                where_clause(&conditions)
            )
        }
        ReportSource::AttendanceSummary => {
            let mut branches = Vec::new();
            for (group, table) in [("student", schema::STUDENT_ATTENDANCE), ("teacher", schema::TEACHER_ATTENDANCE)] {
                let mut conditions = Vec::new();
                range_conditions(&mut b, "date", query, &mut conditions);
                id_condition(&mut b, "class_id", query.class_id, &mut conditions);
                branches.push(format!(
                    "SELECT '{}' AS g, status, COUNT(*) AS total FROM {} {} GROUP BY status",
                    group,
                    table,
                    where_clause(&conditions)
                ));
            }
            format!(
                "SELECT {} FROM ({}) counts ORDER BY g, status",
                dialect.json_object(&pairs(&[("group", "g"), ("status", "status"), ("total", "total")])),
                branches.join(" UNION ALL ")
            )
        }
        ReportSource::StudentRecap => {
            let mut join = vec!["sa.student_id = u.id".to_string()];
            range_conditions(&mut b, "sa.date", query, &mut join);
            conditions.push("u.role IN ('student', 'siswa')".to_string());
            id_condition(&mut b, "u.class_id", query.class_id, &mut conditions);

            let mut fields = vec![
                ("student_number", "u.identity_number".to_string()),
                ("student_name", "u.full_name".to_string()),
                ("class_name", "c.name".to_string()),
            ];
            for status in schema::STATUSES {
                fields.push((*status, format!("COUNT(CASE WHEN sa.status = {} THEN 1 END)", quote_str(status))));
            }
            fields.push(("total", "COUNT(sa.id)".to_string()));
            format!(
                "SELECT {} FROM users u \
                 LEFT JOIN classes c ON c.id = u.class_id \
                 LEFT JOIN student_attendance sa ON {} \
                 {} GROUP BY u.id, u.identity_number, u.full_name, c.name \
                 ORDER BY c.name, u.full_name, u.id",
                dialect.json_object(&fields),
                join.join(" AND "),
                where_clause(&conditions)
            )
        }
        ReportSource::Users => format!(
            "SELECT {} FROM users ORDER BY id",
            dialect.json_object(&pairs(&[
                ("id", "id"),
                ("username", "username"),
                ("full_name", "full_name"),
                ("role", "role"),
                ("identity_number", "identity_number"),
            ]))
        ),
        ReportSource::Classes => format!(
            "SELECT {} FROM classes ORDER BY id",
            dialect.json_object(&pairs(&[("id", "id"), ("name", "name"), ("grade", "grade")]))
        ),
        ReportSource::Subjects => format!(
            "SELECT {} FROM subjects ORDER BY id",
            dialect.json_object(&pairs(&[("id", "id"), ("code", "code"), ("name", "name")]))
        ),
    };
    b.finish(sql)
}

// ═══════════════════════════════════════════════════════════════════════════════
// JSON Rows
// ═══════════════════════════════════════════════════════════════════════════════

/// Map a JSON cell onto [`SqlValue`] given the column's SQL type name.
pub fn json_to_value(value: &serde_json::Value, data_type: &str) -> SqlValue {
    use serde_json::Value;
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Bool(*b),
        // SQLite stores booleans as 0/1
        Value::Number(n) if data_type == "boolean" => SqlValue::Bool(n.as_f64() != Some(0.0)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Int(i),
            None => n.as_f64().map(SqlValue::Float).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => {
            if data_type == "date" {
                SqlValue::Date(s.clone())
            } else if data_type.starts_with("timestamp") {
                // row_to_json renders timestamps as 2025-01-02T07:15:00
                SqlValue::DateTime(s.replacen('T', " ", 1))
            } else {
                SqlValue::Text(s.clone())
            }
        }
        other => SqlValue::Text(other.to_string()),
    }
}

/// Parse one JSON row, keeping `columns` order.
pub fn json_row(doc: &str, columns: &[(String, String)]) -> serde_json::Result<Row> {
    let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(doc)?;
    let mut row = Row::new();
    for (name, data_type) in columns {
        let value = object.get(name).unwrap_or(&serde_json::Value::Null);
        row.push(name.clone(), json_to_value(value, data_type));
    }
    Ok(row)
}

/// Report rows are read by key, so the object's key order does not matter.
pub fn json_report_row(doc: &str) -> serde_json::Result<Row> {
    let value: serde_json::Value = serde_json::from_str(doc)?;
    let mut row = Row::new();
    if let serde_json::Value::Object(map) = value {
        for (key, v) in &map {
            let data_type = if key.ends_with("date") {
                "date"
            } else if key == "check_in" {
                "timestamp"
            } else {
                "text"
            };
            row.push(key.clone(), json_to_value(v, data_type));
        }
    }
    Ok(row)
}
