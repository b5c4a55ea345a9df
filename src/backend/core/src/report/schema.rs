//! Report kinds and their fixed column schemas.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::calendar::DateRange;
use crate::db::{ReportQuery, ReportSource};
use crate::error::{ErrorCode, Result, RollcallError};

/// How a column's values are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnFormat {
    Text,
    Number,
    Date,
}

/// One column: header text, key in the result row and format.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Column {
    pub header: &'static str,
    pub key: &'static str,
    pub format: ColumnFormat,
    pub width: f64,
}

const fn text(header: &'static str, key: &'static str, width: f64) -> Column {
    Column {
        header,
        key,
        format: ColumnFormat::Text,
        width,
    }
}

const fn number(header: &'static str, key: &'static str) -> Column {
    Column {
        header,
        key,
        format: ColumnFormat::Number,
        width: 10.0,
    }
}

const fn date(header: &'static str, key: &'static str) -> Column {
    Column {
        header,
        key,
        format: ColumnFormat::Date,
        width: 12.0,
    }
}

pub const STUDENT_ATTENDANCE_COLUMNS: &[Column] = &[
    date("Date", "date"),
    text("Student Number", "student_number", 16.0),
    text("Student Name", "student_name", 28.0),
    text("Class", "class_name", 14.0),
    text("Status", "status", 10.0),
    text("Check-in Time", "check_in", 20.0),
    text("Notes", "notes", 30.0),
];

pub const TEACHER_ATTENDANCE_COLUMNS: &[Column] = &[
    date("Date", "date"),
    text("Teacher Number", "teacher_number", 16.0),
    text("Teacher Name", "teacher_name", 28.0),
    text("Class", "class_name", 14.0),
    text("Subject", "subject_name", 20.0),
    text("Status", "status", 10.0),
    text("Check-in Time", "check_in", 20.0),
    text("Notes", "notes", 30.0),
];

pub const PERMISSION_REQUEST_COLUMNS: &[Column] = &[
    date("Request Date", "request_date"),
    text("Requester", "requester_name", 28.0),
    text("Role", "role", 10.0),
    date("Start Date", "start_date"),
    date("End Date", "end_date"),
    text("Reason", "reason", 36.0),
    text("Status", "status", 12.0),
];

pub const ANALYTICS_SUMMARY_COLUMNS: &[Column] = &[
    text("Group", "group", 12.0),
    text("Status", "status", 12.0),
    number("Total", "total"),
];

pub const SEMESTER_SUMMARY_COLUMNS: &[Column] = &[
    text("Student Number", "student_number", 16.0),
    text("Student Name", "student_name", 28.0),
    text("Class", "class_name", 14.0),
    number("Present", "present"),
    number("Late", "late"),
    number("Permit", "permit"),
    number("Sick", "sick"),
    number("Absent", "absent"),
    number("Total", "total"),
];

pub const USER_COLUMNS: &[Column] = &[
    number("ID", "id"),
    text("Username", "username", 18.0),
    text("Full Name", "full_name", 28.0),
    text("Role", "role", 10.0),
    text("Identity Number", "identity_number", 18.0),
];

pub const CLASS_COLUMNS: &[Column] = &[
    number("ID", "id"),
    text("Name", "name", 18.0),
    text("Grade", "grade", 10.0),
];

pub const SUBJECT_COLUMNS: &[Column] = &[
    number("ID", "id"),
    text("Code", "code", 12.0),
    text("Name", "name", 28.0),
];

/// A titled block of one sheet, backed by one report source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SectionSpec {
    pub title: Option<&'static str>,
    pub source: ReportSource,
    pub columns: &'static [Column],
}

/// Reports the renderer can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    StudentAttendance,
    TeacherAttendance,
    PermissionRequests,
    AnalyticsSummary,
    SemesterSummary,
    SystemConfiguration,
}

impl ReportKind {
    pub const ALL: [ReportKind; 6] = [
        Self::StudentAttendance,
        Self::TeacherAttendance,
        Self::PermissionRequests,
        Self::AnalyticsSummary,
        Self::SemesterSummary,
        Self::SystemConfiguration,
    ];

    /// Stem used in artifact file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StudentAttendance => "student_attendance",
            Self::TeacherAttendance => "teacher_attendance",
            Self::PermissionRequests => "permission_requests",
            Self::AnalyticsSummary => "analytics_summary",
            Self::SemesterSummary => "semester_summary",
            Self::SystemConfiguration => "system_configuration",
        }
    }

    /// Sheet name.
    pub fn title(&self) -> &'static str {
        match self {
            Self::StudentAttendance => "Student Attendance",
            Self::TeacherAttendance => "Teacher Attendance",
            Self::PermissionRequests => "Permission Requests",
            Self::AnalyticsSummary => "Analytics Summary",
            Self::SemesterSummary => "Semester Summary",
            Self::SystemConfiguration => "System Configuration",
        }
    }

    /// Sections making up this report's sheet.
    pub fn sections(&self) -> Vec<SectionSpec> {
        let single = |source, columns| {
            vec![SectionSpec {
                title: None,
                source,
                columns,
            }]
        };
        match self {
            Self::StudentAttendance => single(ReportSource::StudentAttendance, STUDENT_ATTENDANCE_COLUMNS),
            Self::TeacherAttendance => single(ReportSource::TeacherAttendance, TEACHER_ATTENDANCE_COLUMNS),
            Self::PermissionRequests => single(ReportSource::PermissionRequests, PERMISSION_REQUEST_COLUMNS),
            Self::AnalyticsSummary => single(ReportSource::AttendanceSummary, ANALYTICS_SUMMARY_COLUMNS),
            Self::SemesterSummary => single(ReportSource::StudentRecap, SEMESTER_SUMMARY_COLUMNS),
            Self::SystemConfiguration => vec![
                SectionSpec {
                    title: Some("Users"),
                    source: ReportSource::Users,
                    columns: USER_COLUMNS,
                },
                SectionSpec {
                    title: Some("Classes"),
                    source: ReportSource::Classes,
                    columns: CLASS_COLUMNS,
                },
                SectionSpec {
                    title: Some("Subjects"),
                    source: ReportSource::Subjects,
                    columns: SUBJECT_COLUMNS,
                },
            ],
        }
    }

    /// Whether the report is restricted to a date range.
    pub fn is_dated(&self) -> bool {
        !matches!(self, Self::SystemConfiguration)
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportKind {
    type Err = RollcallError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| RollcallError::new(ErrorCode::InvalidInput, format!("unknown report '{}'", s)))
    }
}

/// Filters applied to a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFilter {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub class_id: Option<i64>,
    pub teacher_id: Option<i64>,
}

impl ReportFilter {
    pub fn new(range: DateRange) -> Self {
        Self {
            start_date: range.start,
            end_date: range.end,
            class_id: None,
            teacher_id: None,
        }
    }

    pub fn with_class(mut self, class_id: Option<i64>) -> Self {
        self.class_id = class_id;
        self
    }

    pub fn with_teacher(mut self, teacher_id: Option<i64>) -> Self {
        self.teacher_id = teacher_id;
        self
    }

    pub fn range(&self) -> Result<DateRange> {
        DateRange::new(self.start_date, self.end_date)
    }

    /// Query for one section of `kind`.
    pub fn query(&self, kind: ReportKind, source: ReportSource) -> Result<ReportQuery> {
        let mut query = ReportQuery::new(source);
        if kind.is_dated() {
            query = query
                .with_range(self.range()?)
                .with_class(self.class_id)
                .with_teacher(self.teacher_id);
        }
        Ok(query)
    }
}
