//! SQLite implementation of [`Database`] on an in-memory sqlx pool.
//!
//! Runs the same report, paging and archive SQL as [`super::PgDatabase`],
//! rendered for SQLite. Used by the test suites and for local runs without
//! a PostgreSQL server.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row as _;
use std::collections::HashSet;
use tracing::debug;

use super::schema::{self, ARCHIVED_AT_COLUMN};
use super::sql::{self, quote_ident, Dialect, Param};
use super::{Database, DateFilter, ReportQuery, Row};
use crate::backup::dump::insert_statement;
use crate::error::{ErrorCode, Result, RollcallError};

/// Column as reported by `pragma_table_info`.
#[derive(Debug, Clone)]
struct ColumnInfo {
    name: String,
    declared: String,
    not_null: bool,
    default: Option<String>,
    primary_key: bool,
}

impl ColumnInfo {
    /// Type name understood by [`sql::json_to_value`].
    fn value_type(&self) -> &'static str {
        let t = self.declared.to_ascii_uppercase();
        if t.starts_with("TIMESTAMP") || t.starts_with("DATETIME") {
            "timestamp"
        } else if t.starts_with("DATE") {
            "date"
        } else if t.starts_with("BOOL") {
            "boolean"
        } else {
            "other"
        }
    }

    fn definition(&self) -> String {
        let mut def = format!("  {}", quote_ident(&self.name));
        if !self.declared.is_empty() {
            def.push(' ');
            def.push_str(&self.declared);
        }
        if let Some(default) = &self.default {
            def.push_str(" DEFAULT ");
            def.push_str(default);
        }
        if self.not_null {
            def.push_str(" NOT NULL");
        }
        def
    }
}

/// `source`'s columns plus `archived_at`, keyed like the source.
fn archive_table_sql(archive: &str, columns: &[ColumnInfo]) -> String {
    let mut parts: Vec<String> = columns.iter().map(ColumnInfo::definition).collect();
    parts.push(format!(
        "  {} TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP",
        quote_ident(ARCHIVED_AT_COLUMN)
    ));
    if let Some(pk) = columns.iter().find(|c| c.primary_key) {
        parts.push(format!("  PRIMARY KEY ({})", quote_ident(&pk.name)));
    }
    format!("CREATE TABLE IF NOT EXISTS {} (\n{}\n)", quote_ident(archive), parts.join(",\n"))
}

/// SQLite-backed store. Tables can be taken offline to simulate failures.
#[derive(Debug)]
pub struct SqliteDatabase {
    pool: SqlitePool,
    unavailable: RwLock<HashSet<String>>,
}

impl SqliteDatabase {
    /// Empty private database. The data lives in the pool's only
    /// connection, which is never recycled.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self::from_pool(pool))
    }

    /// In-memory database with the attendance schema and no rows.
    pub async fn with_school_schema() -> Result<Self> {
        let db = Self::in_memory().await?;
        for ddl in schema::SCHOOL_SCHEMA {
            db.execute(ddl).await?;
        }
        Ok(db)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            unavailable: RwLock::new(HashSet::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert one row with a plain `INSERT` statement.
    pub async fn insert_row(&self, table: &str, row: Row) -> Result<()> {
        self.execute(&insert_statement(table, std::slice::from_ref(&row))).await?;
        Ok(())
    }

    /// Every row of `table` in primary-key order; empty when the table is missing.
    pub async fn rows(&self, table: &str) -> Result<Vec<Row>> {
        if !self.has_table(table).await? {
            return Ok(Vec::new());
        }
        self.select(table, None, 0, u64::MAX).await
    }

    pub async fn has_table(&self, table: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .bind(table)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    /// Make every operation touching `table` fail until [`Self::restore_table`].
    pub fn make_unavailable(&self, table: &str) {
        self.unavailable.write().insert(table.to_string());
    }

    pub fn restore_table(&self, table: &str) {
        self.unavailable.write().remove(table);
    }

    fn check_available(&self, tables: &[&str]) -> Result<()> {
        let unavailable = self.unavailable.read();
        match tables.iter().find(|t| unavailable.contains(**t)) {
            Some(table) => Err(RollcallError::query_failed(format!(
                "relation \"{}\" is temporarily unavailable",
                table
            ))),
            None => Ok(()),
        }
    }

    async fn column_info(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows = sqlx::query(r#"SELECT name, type, "notnull", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid"#)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Err(RollcallError::query_failed(format!(
                "relation \"{}\" does not exist",
                table
            )));
        }
        rows.iter()
            .map(|r| {
                Ok(ColumnInfo {
                    name: r.try_get(0)?,
                    declared: r.try_get(1)?,
                    not_null: r.try_get::<i64, _>(2)? != 0,
                    default: r.try_get(3)?,
                    primary_key: r.try_get::<i64, _>(4)? == 1,
                })
            })
            .collect::<std::result::Result<_, sqlx::Error>>()
            .map_err(RollcallError::from)
    }

    async fn fetch_documents(&self, statement: &sql::Statement) -> Result<Vec<String>> {
        let mut query = sqlx::query_scalar::<_, String>(&statement.sql);
        for param in &statement.params {
            query = match param {
                Param::Date(date) => query.bind(*date),
                Param::Id(id) => query.bind(*id),
            };
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn select(&self, table: &str, filter: Option<&DateFilter>, offset: u64, limit: u64) -> Result<Vec<Row>> {
        let columns = self.column_info(table).await?;
        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let primary_key = columns.iter().find(|c| c.primary_key).map(|c| c.name.as_str());
        let statement = sql::select_rows(Dialect::Sqlite, table, &names, filter, primary_key, offset, limit);
        let documents = self.fetch_documents(&statement).await?;

        let types: Vec<(String, String)> = columns
            .iter()
            .map(|c| (c.name.clone(), c.value_type().to_string()))
            .collect();
        documents
            .iter()
            .map(|doc| Ok(sql::json_row(doc, &types)?))
            .collect()
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tables)
    }

    async fn table_ddl(&self, table: &str) -> Result<String> {
        self.check_available(&[table])?;
        let statements: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT sql FROM sqlite_master
            WHERE tbl_name = ?1 AND type IN ('table', 'index') AND sql IS NOT NULL
            ORDER BY CASE type WHEN 'table' THEN 0 ELSE 1 END, name
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        if statements.is_empty() {
            return Err(RollcallError::query_failed(format!(
                "relation \"{}\" does not exist",
                table
            )));
        }
        Ok(statements
            .iter()
            .map(|s| format!("{};", s.trim_end().trim_end_matches(';')))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn fetch_rows(
        &self,
        table: &str,
        filter: Option<&DateFilter>,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Row>> {
        self.check_available(&[table])?;
        self.select(table, filter, offset, limit).await
    }

    async fn count_rows(&self, table: &str, filter: Option<&DateFilter>) -> Result<u64> {
        self.check_available(&[table])?;
        let statement = sql::count_rows(Dialect::Sqlite, table, filter);
        let mut query = sqlx::query_scalar::<_, i64>(&statement.sql);
        for param in &statement.params {
            query = match param {
                Param::Date(date) => query.bind(*date),
                Param::Id(id) => query.bind(*id),
            };
        }
        let count = query.fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn query_report(&self, query: &ReportQuery) -> Result<Vec<Row>> {
        self.check_available(sql::report_tables(query.source))?;
        let statement = sql::report(Dialect::Sqlite, query);
        let documents = self.fetch_documents(&statement).await?;
        documents
            .iter()
            .map(|doc| Ok(sql::json_report_row(doc)?))
            .collect()
    }

    async fn ensure_archive_table(&self, source: &str, archive: &str) -> Result<()> {
        self.check_available(&[source, archive])?;
        let columns = self.column_info(source).await?;
        sqlx::query(&archive_table_sql(archive, &columns))
            .execute(&self.pool)
            .await?;
        let index = format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} (\"id\")",
            quote_ident(&format!("{}_id_key", archive)),
            quote_ident(archive)
        );
        sqlx::query(&index).execute(&self.pool).await?;
        debug!(source, archive, "Archive table ready");
        Ok(())
    }

    async fn copy_to_archive(
        &self,
        source: &str,
        archive: &str,
        date_column: &str,
        cutoff: NaiveDate,
        archived_at: DateTime<Utc>,
    ) -> Result<u64> {
        self.check_available(&[source, archive])?;
        let columns: Vec<String> = self
            .column_info(source)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();
        let statement = sql::copy_to_archive(Dialect::Sqlite, source, archive, &columns, date_column);
        let result = sqlx::query(&statement)
            .bind(cutoff)
            .bind(archived_at.naive_utc())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_archived(
        &self,
        source: &str,
        archive: &str,
        date_column: &str,
        cutoff: NaiveDate,
    ) -> Result<u64> {
        self.check_available(&[source, archive])?;
        let statement = sql::delete_archived(Dialect::Sqlite, source, archive, date_column);
        let result = sqlx::query(&statement).bind(cutoff).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn execute(&self, statement: &str) -> Result<u64> {
        let result = sqlx::query(statement).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn execute_atomic(&self, statements: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for (index, statement) in statements.iter().enumerate() {
            match sqlx::query(statement).execute(&mut *tx).await {
                Ok(result) => affected += result.rows_affected(),
                Err(e) => {
                    drop(tx);
                    return Err(RollcallError::with_internal(
                        ErrorCode::DatabaseTransactionFailed,
                        "Transaction rolled back",
                        format!("statement {}: {}", index + 1, e),
                    ));
                }
            }
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn database_size_bytes(&self) -> Result<u64> {
        let size: i64 = sqlx::query_scalar("SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()")
            .fetch_one(&self.pool)
            .await?;
        Ok(size.max(0) as u64)
    }
}
