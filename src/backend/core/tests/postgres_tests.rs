//! Integration tests against a live PostgreSQL database.
//!
//! Tests cover:
//! - Table DDL keeps serial ids, defaults and indexes
//! - Sequence resets after replaying a table
//!
//! They run only when `ROLLCALL_TEST_DATABASE_URL` points at a disposable
//! database and are skipped otherwise.

use rollcall_core::backup::dump::insert_statement;
use rollcall_core::config::DatabaseConfig;
use rollcall_core::db::{Database, PgDatabase, SqlValue};
use rollcall_core::restore::split_statements;

async fn connect() -> Option<PgDatabase> {
    let url = std::env::var("ROLLCALL_TEST_DATABASE_URL").ok()?;
    let config = DatabaseConfig {
        url,
        max_connections: 2,
        min_connections: 1,
        ..DatabaseConfig::default()
    };
    Some(PgDatabase::connect(&config).await.unwrap())
}

fn unique_table(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

// ============================================================================
// DDL Round Trip
// ============================================================================

#[tokio::test]
async fn test_table_ddl_replays_with_sequence_and_indexes() {
    let Some(db) = connect().await else {
        return;
    };
    let table = unique_table("notices");

    db.execute(&format!(
        r#"CREATE TABLE "{t}" ("id" SERIAL PRIMARY KEY, "slug" TEXT NOT NULL UNIQUE, "status" TEXT NOT NULL DEFAULT 'draft')"#,
        t = table
    ))
    .await
    .unwrap();
    db.execute(&format!(r#"CREATE INDEX "{t}_status_idx" ON "{t}" ("status")"#, t = table))
        .await
        .unwrap();
    db.execute(&format!(r#"INSERT INTO "{}" ("slug") VALUES ('libur'), ('ujian')"#, table))
        .await
        .unwrap();

    let ddl = db.table_ddl(&table).await.unwrap();
    assert!(ddl.contains("SERIAL"), "{}", ddl);
    assert!(ddl.contains("DEFAULT 'draft'"), "{}", ddl);
    assert!(ddl.contains("CREATE UNIQUE INDEX"), "{}", ddl);
    assert!(ddl.contains(&format!("{}_status_idx", table)), "{}", ddl);

    let rows = db.fetch_rows(&table, None, 0, 100).await.unwrap();
    let resets = db.sequence_resets(&table).await.unwrap();
    assert_eq!(resets.len(), 1);

    let mut script = format!("DROP TABLE IF EXISTS \"{}\";\n{}\n", table, ddl);
    script.push_str(&insert_statement(&table, &rows));
    for reset in &resets {
        script.push_str(reset);
        script.push('\n');
    }
    let result = db.execute_atomic(&split_statements(&script)).await;

    let replayed = db.fetch_rows(&table, None, 0, 100).await;
    let inserted = db
        .execute(&format!(r#"INSERT INTO "{}" ("slug") VALUES ('rapat')"#, table))
        .await;
    let duplicate = db
        .execute(&format!(r#"INSERT INTO "{}" ("slug") VALUES ('libur')"#, table))
        .await;
    let after = db.fetch_rows(&table, None, 0, 100).await;
    db.execute(&format!(r#"DROP TABLE IF EXISTS "{}""#, table)).await.unwrap();

    result.unwrap();
    assert_eq!(replayed.unwrap(), rows);
    inserted.unwrap();
    assert!(duplicate.is_err());
    let after = after.unwrap();
    assert_eq!(after.len(), 3);
    assert_eq!(after[2].value("id"), SqlValue::Int(3));
    assert_eq!(after[2].value("status"), SqlValue::text("draft"));
}
