//! PostgreSQL implementation of [`Database`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use sqlx::{postgres::PgPoolOptions, PgPool, Row as _};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::schema::ARCHIVED_AT_COLUMN;
use super::sql::{self, quote_ident, quote_str, Dialect, Param};
use super::{Database, DateFilter, ReportQuery, Row};
use crate::config::DatabaseConfig;
use crate::error::{ErrorCode, Result, RollcallError};

/// Column as reported by `information_schema.columns`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ColumnInfo {
    name: String,
    data_type: String,
    nullable: bool,
    default: Option<String>,
}

impl ColumnInfo {
    /// Integer column fed by its own sequence.
    fn is_serial(&self) -> bool {
        self.default.as_deref().map_or(false, |d| d.starts_with("nextval("))
            && matches!(self.data_type.as_str(), "smallint" | "integer" | "bigint")
    }
}

/// Database connection pool and operations.
#[derive(Debug)]
pub struct PgDatabase {
    pool: PgPool,
    slow_query: Duration,
    columns: RwLock<HashMap<String, Vec<ColumnInfo>>>,
}

impl PgDatabase {
    /// Create a new connection pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(RollcallError::new(
                ErrorCode::MissingConfiguration,
                "database.url is not set",
            ));
        }
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            url = %config.redacted_url(),
            "Connected to PostgreSQL"
        );

        Ok(Self::from_pool(pool, Duration::from_millis(config.slow_query_ms)))
    }

    pub fn from_pool(pool: PgPool, slow_query: Duration) -> Self {
        Self {
            pool,
            slow_query,
            columns: RwLock::new(HashMap::new()),
        }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check connectivity with a trivial query and return the round trip.
    pub async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(start.elapsed())
    }

    fn record_query(&self, started: Instant, label: &str) {
        let elapsed = started.elapsed();
        if elapsed > self.slow_query {
            warn!(
                query = label,
                duration_ms = elapsed.as_millis() as u64,
                threshold_ms = self.slow_query.as_millis() as u64,
                "Slow query detected"
            );
        }
    }

    async fn column_info(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        if let Some(cached) = self.columns.read().get(table) {
            return Ok(cached.clone());
        }
        let rows = sqlx::query(
            r#"
            SELECT column_name::text, data_type::text, is_nullable::text, column_default::text
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(RollcallError::query_failed(format!(
                "relation \"{}\" does not exist",
                table
            )));
        }

        let columns: Vec<ColumnInfo> = rows
            .iter()
            .map(|r| {
                Ok(ColumnInfo {
                    name: r.try_get(0)?,
                    data_type: r.try_get(1)?,
                    nullable: r.try_get::<String, _>(2)? == "YES",
                    default: r.try_get(3)?,
                })
            })
            .collect::<std::result::Result<_, sqlx::Error>>()?;
        self.columns.write().insert(table.to_string(), columns.clone());
        Ok(columns)
    }

    async fn primary_key(&self, table: &str) -> Result<Option<String>> {
        let key: Option<String> = sqlx::query_scalar(
            r#"
            SELECT kcu.column_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON tc.constraint_name = kcu.constraint_name
             AND tc.table_schema = kcu.table_schema
            WHERE tc.table_schema = current_schema()
              AND tc.table_name = $1
              AND tc.constraint_type = 'PRIMARY KEY'
            ORDER BY kcu.ordinal_position
            LIMIT 1
            "#,
        )
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;
        Ok(key)
    }

    /// `CREATE [UNIQUE] INDEX` statements for every index but the primary key's.
    /// Unique constraints come back as unique indexes.
    async fn index_definitions(&self, table: &str) -> Result<Vec<String>> {
        let definitions: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT pg_get_indexdef(i.indexrelid)
            FROM pg_index i
            JOIN pg_class t ON t.oid = i.indrelid
            JOIN pg_class ix ON ix.oid = i.indexrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            WHERE n.nspname = current_schema() AND t.relname = $1 AND NOT i.indisprimary
            ORDER BY ix.relname
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        Ok(definitions)
    }

    async fn fetch_documents(&self, statement: &sql::Statement, label: &str) -> Result<Vec<String>> {
        let started = Instant::now();
        let mut query = sqlx::query_scalar::<_, String>(&statement.sql);
        for param in &statement.params {
            query = match param {
                Param::Date(date) => query.bind(*date),
                Param::Id(id) => query.bind(*id),
            };
        }
        let documents = query.fetch_all(&self.pool).await?;
        self.record_query(started, label);
        Ok(documents)
    }
}

fn sql_type(info: &ColumnInfo) -> String {
    match info.data_type.as_str() {
        "character varying" => "VARCHAR".to_string(),
        "timestamp without time zone" => "TIMESTAMP".to_string(),
        "timestamp with time zone" => "TIMESTAMPTZ".to_string(),
        "smallint" if info.is_serial() => "SMALLSERIAL".to_string(),
        "integer" if info.is_serial() => "SERIAL".to_string(),
        "bigint" if info.is_serial() => "BIGSERIAL".to_string(),
        other => other.to_ascii_uppercase(),
    }
}

fn column_definition(info: &ColumnInfo) -> String {
    let mut def = format!("  {} {}", quote_ident(&info.name), sql_type(info));
    if let Some(default) = info.default.as_deref().filter(|_| !info.is_serial()) {
        def.push_str(" DEFAULT ");
        def.push_str(default);
    }
    if !info.nullable {
        def.push_str(" NOT NULL");
    }
    def
}

/// Table structure followed by its secondary indexes. Every statement ends
/// with `;` at the end of a line.
fn create_table_sql(table: &str, columns: &[ColumnInfo], primary_key: Option<&str>, indexes: &[String]) -> String {
    let mut parts: Vec<String> = columns.iter().map(column_definition).collect();
    if let Some(pk) = primary_key {
        parts.push(format!("  PRIMARY KEY ({})", quote_ident(pk)));
    }
    let mut ddl = format!("CREATE TABLE {} (\n{}\n);", quote_ident(table), parts.join(",\n"));
    for index in indexes {
        ddl.push('\n');
        ddl.push_str(index.trim_end_matches(';'));
        ddl.push(';');
    }
    ddl
}

/// Move a serial column's sequence past the highest loaded id.
fn sequence_reset_sql(table: &str, column: &str) -> String {
    format!(
        "SELECT setval(pg_get_serial_sequence({}, {}), COALESCE(MAX({}), 0) + 1, false) FROM {};",
        quote_str(&quote_ident(table)),
        quote_str(column),
        quote_ident(column),
        quote_ident(table)
    )
}

#[async_trait]
impl Database for PgDatabase {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let tables: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT table_name::text
            FROM information_schema.tables
            WHERE table_schema = current_schema() AND table_type = 'BASE TABLE'
            ORDER BY table_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tables)
    }

    async fn table_ddl(&self, table: &str) -> Result<String> {
        let columns = self.column_info(table).await?;
        let primary_key = self.primary_key(table).await?;
        let indexes = self.index_definitions(table).await?;
        Ok(create_table_sql(table, &columns, primary_key.as_deref(), &indexes))
    }

    async fn sequence_resets(&self, table: &str) -> Result<Vec<String>> {
        let columns = self.column_info(table).await?;
        Ok(columns
            .iter()
            .filter(|c| c.is_serial())
            .map(|c| sequence_reset_sql(table, &c.name))
            .collect())
    }

    async fn fetch_rows(
        &self,
        table: &str,
        filter: Option<&DateFilter>,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Row>> {
        let columns = self.column_info(table).await?;
        let primary_key = self.primary_key(table).await?;
        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let statement = sql::select_rows(
            Dialect::Postgres,
            table,
            &names,
            filter,
            primary_key.as_deref(),
            offset,
            limit,
        );
        let documents = self.fetch_documents(&statement, &statement.sql).await?;

        let types: Vec<(String, String)> = columns.into_iter().map(|c| (c.name, c.data_type)).collect();
        documents
            .iter()
            .map(|doc| Ok(sql::json_row(doc, &types)?))
            .collect()
    }

    async fn count_rows(&self, table: &str, filter: Option<&DateFilter>) -> Result<u64> {
        let statement = sql::count_rows(Dialect::Postgres, table, filter);
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
        let statement = sql::report(Dialect::Postgres, query);
        let documents = self.fetch_documents(&statement, "query_report").await?;
        documents
            .iter()
            .map(|doc| Ok(sql::json_report_row(doc)?))
            .collect()
    }

    async fn ensure_archive_table(&self, source: &str, archive: &str) -> Result<()> {
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (LIKE {} INCLUDING DEFAULTS)",
                quote_ident(archive),
                quote_ident(source)
            ),
            format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} TIMESTAMP NOT NULL DEFAULT NOW()",
                quote_ident(archive),
                quote_ident(ARCHIVED_AT_COLUMN)
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} (\"id\")",
                quote_ident(&format!("{}_id_key", archive)),
                quote_ident(archive)
            ),
        ];
        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        self.columns.write().remove(archive);
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
        let columns: Vec<String> = self
            .column_info(source)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();
        let statement = sql::copy_to_archive(Dialect::Postgres, source, archive, &columns, date_column);
        let started = Instant::now();
        let result = sqlx::query(&statement)
            .bind(cutoff)
            .bind(archived_at.naive_utc())
            .execute(&self.pool)
            .await?;
        self.record_query(started, "copy_to_archive");
        Ok(result.rows_affected())
    }

    async fn delete_archived(
        &self,
        source: &str,
        archive: &str,
        date_column: &str,
        cutoff: NaiveDate,
    ) -> Result<u64> {
        let statement = sql::delete_archived(Dialect::Postgres, source, archive, date_column);
        let result = sqlx::query(&statement).bind(cutoff).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn execute(&self, statement: &str) -> Result<u64> {
        let started = Instant::now();
        let result = sqlx::query(statement).execute(&self.pool).await?;
        self.record_query(started, "execute");
        self.columns.write().clear();
        Ok(result.rows_affected())
    }

    async fn execute_atomic(&self, statements: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            RollcallError::from(e).with_internal_message("failed to begin restore transaction")
        })?;
        let mut affected = 0;
        for (index, statement) in statements.iter().enumerate() {
            match sqlx::query(statement).execute(&mut *tx).await {
                Ok(result) => affected += result.rows_affected(),
                Err(e) => {
                    // Dropping the transaction rolls it back.
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
        self.columns.write().clear();
        Ok(affected)
    }

    async fn database_size_bytes(&self) -> Result<u64> {
        let size: i64 = sqlx::query_scalar("SELECT pg_database_size(current_database())")
            .fetch_one(&self.pool)
            .await?;
        Ok(size.max(0) as u64)
    }
}
