//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use rollcall_core::config::{BackupConfig, StorageConfig};
use rollcall_core::db::{Row, SqlValue, SqliteDatabase};
use std::path::Path;
use std::sync::Arc;

pub fn date(value: &str) -> SqlValue {
    SqlValue::Date(value.to_string())
}

/// A small school: one class, two students, one teacher and a few months of
/// attendance spread over 2023 and 2024.
pub async fn school() -> Arc<SqliteDatabase> {
    let db = SqliteDatabase::with_school_schema().await.unwrap();

    db.insert_row("classes", Row::new().with("id", 1).with("name", "7A").with("grade", "7"))
        .await
        .unwrap();
    db.insert_row("subjects", Row::new().with("id", 1).with("code", "MTK").with("name", "Matematika"))
        .await
        .unwrap();
    for (id, username, name, role, number) in [
        (1, "budi", "Budi Santoso", "student", "S-001"),
        (2, "ani", "Ani O'Hara", "student", "S-002"),
        (3, "sri", "Sri Wahyuni", "teacher", "T-001"),
    ] {
        let mut row = Row::new()
            .with("id", id)
            .with("username", username)
            .with("full_name", name)
            .with("role", role)
            .with("identity_number", number);
        if role == "student" {
            row.push("class_id", 1);
        }
        db.insert_row("users", row).await.unwrap();
    }

    let days = [
        (1, 1, "2023-02-14", "present"),
        (2, 2, "2023-02-14", "sick"),
        (3, 1, "2024-08-05", "late"),
        (4, 2, "2024-08-05", "present"),
        (5, 1, "2024-09-10", "absent"),
    ];
    for (id, student, day, status) in days {
        db.insert_row(
            "student_attendance",
            Row::new()
                .with("id", id)
                .with("student_id", student)
                .with("class_id", 1)
                .with("date", date(day))
                .with("status", status)
                .with("check_in", SqlValue::DateTime(format!("{} 07:0{}:00", day, id))),
        )
        .await
        .unwrap();
    }
    for (id, day) in [(1, "2023-03-01"), (2, "2024-08-06")] {
        db.insert_row(
            "teacher_attendance",
            Row::new()
                .with("id", id)
                .with("teacher_id", 3)
                .with("class_id", 1)
                .with("subject_id", 1)
                .with("date", date(day))
                .with("status", "present"),
        )
        .await
        .unwrap();
    }
    db.insert_row(
        "permission_requests",
        Row::new()
            .with("id", 1)
            .with("user_id", 2)
            .with("request_date", date("2024-08-04"))
            .with("start_date", date("2024-08-05"))
            .with("end_date", date("2024-08-06"))
            .with("reason", "family; wedding")
            .with("status", "approved"),
    )
    .await
    .unwrap();

    Arc::new(db)
}

pub fn storage(root: &Path) -> StorageConfig {
    StorageConfig::rooted_at(root)
}

pub fn backup_config(compress: bool) -> BackupConfig {
    BackupConfig {
        compress,
        ..BackupConfig::default()
    }
}
