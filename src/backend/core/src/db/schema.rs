//! Attendance schema: table names, date columns and archive pairs.

/// Live tables.
pub const USERS: &str = "users";
pub const CLASSES: &str = "classes";
pub const SUBJECTS: &str = "subjects";
pub const STUDENT_ATTENDANCE: &str = "student_attendance";
pub const TEACHER_ATTENDANCE: &str = "teacher_attendance";
pub const PERMISSION_REQUESTS: &str = "permission_requests";

/// Cold-storage tables.
pub const STUDENT_ATTENDANCE_ARCHIVE: &str = "student_attendance_archive";
pub const TEACHER_ATTENDANCE_ARCHIVE: &str = "teacher_attendance_archive";

/// Column added to every archive table.
pub const ARCHIVED_AT_COLUMN: &str = "archived_at";

/// Tables whose dump is restricted to the backup's date range, with the
/// column the range applies to. Everything else is dumped whole.
pub const ATTENDANCE_TABLES: &[(&str, &str)] = &[
    (STUDENT_ATTENDANCE, "date"),
    (TEACHER_ATTENDANCE, "date"),
    (PERMISSION_REQUESTS, "request_date"),
];

/// A live table and the archive table it migrates into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchivePair {
    pub source: &'static str,
    pub archive: &'static str,
    pub date_column: &'static str,
}

pub const ARCHIVE_PAIRS: &[ArchivePair] = &[
    ArchivePair {
        source: STUDENT_ATTENDANCE,
        archive: STUDENT_ATTENDANCE_ARCHIVE,
        date_column: "date",
    },
    ArchivePair {
        source: TEACHER_ATTENDANCE,
        archive: TEACHER_ATTENDANCE_ARCHIVE,
        date_column: "date",
    },
];

/// Date column of an attendance-domain table.
pub fn date_column_for(table: &str) -> Option<&'static str> {
    ATTENDANCE_TABLES
        .iter()
        .find(|(name, _)| *name == table)
        .map(|(_, column)| *column)
}

/// Attendance status values recorded by the application.
pub const STATUSES: &[&str] = &["present", "late", "permit", "sick", "absent"];

/// Table definitions for a fresh database, in dependency order.
pub const SCHOOL_SCHEMA: &[&str] = &[
    r#"CREATE TABLE "users" (
        "id" BIGINT PRIMARY KEY,
        "username" TEXT NOT NULL,
        "full_name" TEXT NOT NULL,
        "role" TEXT NOT NULL,
        "identity_number" TEXT,
        "class_id" BIGINT,
        "created_at" TIMESTAMP
    );"#,
    r#"CREATE TABLE "classes" (
        "id" BIGINT PRIMARY KEY,
        "name" TEXT NOT NULL,
        "grade" TEXT,
        "homeroom_teacher_id" BIGINT
    );"#,
    r#"CREATE TABLE "subjects" (
        "id" BIGINT PRIMARY KEY,
        "code" TEXT NOT NULL,
        "name" TEXT NOT NULL
    );"#,
    r#"CREATE TABLE "student_attendance" (
        "id" BIGINT PRIMARY KEY,
        "student_id" BIGINT NOT NULL,
        "class_id" BIGINT NOT NULL,
        "date" DATE NOT NULL,
        "status" TEXT NOT NULL,
        "check_in" TIMESTAMP,
        "notes" TEXT
    );"#,
    r#"CREATE TABLE "teacher_attendance" (
        "id" BIGINT PRIMARY KEY,
        "teacher_id" BIGINT NOT NULL,
        "class_id" BIGINT,
        "subject_id" BIGINT,
        "date" DATE NOT NULL,
        "status" TEXT NOT NULL,
        "check_in" TIMESTAMP,
        "notes" TEXT
    );"#,
    r#"CREATE TABLE "permission_requests" (
        "id" BIGINT PRIMARY KEY,
        "user_id" BIGINT NOT NULL,
        "request_date" DATE NOT NULL,
        "start_date" DATE NOT NULL,
        "end_date" DATE NOT NULL,
        "reason" TEXT,
        "status" TEXT NOT NULL,
        "created_at" TIMESTAMP
    );"#,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_columns() {
        assert_eq!(date_column_for(STUDENT_ATTENDANCE), Some("date"));
        assert_eq!(date_column_for(PERMISSION_REQUESTS), Some("request_date"));
        assert_eq!(date_column_for(USERS), None);
    }

    #[test]
    fn test_archive_pairs_cover_attendance_tables() {
        for pair in ARCHIVE_PAIRS {
            assert_eq!(date_column_for(pair.source), Some(pair.date_column));
            assert!(pair.archive.ends_with("_archive"));
        }
    }
}
