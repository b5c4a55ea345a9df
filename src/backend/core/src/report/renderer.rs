//! Renders reports from the database into xlsx artifacts.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::instrument;

use super::schema::{ReportFilter, ReportKind};
use super::workbook::{write_workbook, Section, Sheet, Workbook};
use super::ProgressSink;
use crate::db::{Database, Row};
use crate::error::{ErrorCode, Result, RollcallError};

/// A written report artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedReport {
    pub path: PathBuf,
    pub file_name: String,
    pub row_count: u64,
    pub size_bytes: u64,
}

/// Queries report data and writes spreadsheets.
#[derive(Clone)]
pub struct ReportRenderer {
    db: Arc<dyn Database>,
    output_dir: PathBuf,
}

impl ReportRenderer {
    pub fn new(db: Arc<dyn Database>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Render one report into a uniquely named file in the output directory.
    ///
    /// Progress milestones: 30 after the query, 50 once columns are set up,
    /// 80 after rows are materialised and 100 when the file is written.
    #[instrument(skip(self, progress), fields(kind = %kind))]
    pub async fn render(
        &self,
        kind: ReportKind,
        filter: &ReportFilter,
        progress: &dyn ProgressSink,
    ) -> Result<RenderedReport> {
        filter.range()?;
        check_cancelled(progress)?;

        let fetched = self.fetch(kind, filter).await?;
        progress.report(30, "Data fetched");
        check_cancelled(progress)?;

        let mut sheet = Sheet::new(kind.title());
        progress.report(50, "Columns prepared");

        for (spec, rows) in &fetched {
            sheet = sheet.with_section(Section::from_rows(spec.title, spec.columns, rows));
        }
        let row_count = sheet.row_count() as u64;
        progress.report(80, "Rows written");
        check_cancelled(progress)?;

        let file_name = artifact_name(kind, filter);
        let path = self.output_dir.join(&file_name);
        let size_bytes = self.persist(Workbook::new().with_sheet(sheet), path.clone()).await?;
        progress.report(100, "Report ready");

        tracing::info!(file = %file_name, rows = row_count, size_bytes, "Report rendered");
        Ok(RenderedReport {
            path,
            file_name,
            row_count,
            size_bytes,
        })
    }

    /// Build the sheet for `kind` without writing it.
    pub async fn build_sheet(&self, kind: ReportKind, filter: &ReportFilter) -> Result<Sheet> {
        let fetched = self.fetch(kind, filter).await?;
        Ok(fetched.iter().fold(Sheet::new(kind.title()), |sheet, (spec, rows)| {
            sheet.with_section(Section::from_rows(spec.title, spec.columns, rows))
        }))
    }

    /// Write an arbitrary workbook to `path`, returning its size.
    pub async fn render_workbook(&self, workbook: Workbook, path: &Path) -> Result<u64> {
        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || write_workbook(&workbook, &target)).await??;
        Ok(tokio::fs::metadata(path).await?.len())
    }

    async fn fetch(
        &self,
        kind: ReportKind,
        filter: &ReportFilter,
    ) -> Result<Vec<(super::schema::SectionSpec, Vec<Row>)>> {
        let mut fetched = Vec::new();
        for spec in kind.sections() {
            let query = filter.query(kind, spec.source)?;
            let rows = self.db.query_report(&query).await?;
            fetched.push((spec, rows));
        }
        Ok(fetched)
    }

    /// Write through a temp file in the output directory and move it into
    /// place without clobbering an existing file.
    async fn persist(&self, workbook: Workbook, path: PathBuf) -> Result<u64> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let dir = self.output_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let temp = tempfile::Builder::new()
                .prefix(".report-")
                .suffix(".xlsx")
                .tempfile_in(&dir)?;
            write_workbook(&workbook, temp.path())?;
            let file = temp.persist_noclobber(&path).map_err(|e| RollcallError::from(e.error))?;
            Ok(file.metadata()?.len())
        })
        .await?
    }
}

/// `{kind}_{start}_{end}_{yyyymmddHHMMSSmmm}_{8 hex}.xlsx`
pub fn artifact_name(kind: ReportKind, filter: &ReportFilter) -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}_{}_{}.xlsx",
        kind.as_str(),
        filter.start_date.format("%Y%m%d"),
        filter.end_date.format("%Y%m%d"),
        stamp,
        &suffix[..8]
    )
}

fn check_cancelled(progress: &dyn ProgressSink) -> Result<()> {
    if progress.is_cancelled() {
        return Err(RollcallError::new(ErrorCode::JobCancelled, "Report rendering was cancelled"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::DateRange;
    use crate::db::{SqlValue, SqliteDatabase};
    use crate::report::NoopProgress;
    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u8>>,
        cancel: AtomicBool,
    }

    impl ProgressSink for Recorder {
        fn report(&self, percent: u8, _message: &str) {
            self.seen.lock().push(percent);
        }

        fn is_cancelled(&self) -> bool {
            self.cancel.load(Ordering::SeqCst)
        }
    }

    fn january() -> ReportFilter {
        ReportFilter::new(
            DateRange::new(
                NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
            )
            .unwrap(),
        )
    }

    async fn seeded() -> Arc<SqliteDatabase> {
        let db = SqliteDatabase::with_school_schema().await.unwrap();
        db.insert_row(
            "users",
            Row::new()
                .with("id", 1)
                .with("username", "ani")
                .with("full_name", "Ani")
                .with("role", "siswa")
                .with("identity_number", "S-001")
                .with("class_id", 1),
        )
        .await
        .unwrap();
        db.insert_row("classes", Row::new().with("id", 1).with("name", "7A"))
            .await
            .unwrap();
        db.insert_row(
            "student_attendance",
            Row::new()
                .with("id", 1)
                .with("student_id", 1)
                .with("class_id", 1)
                .with("date", SqlValue::Date("2025-01-06".into()))
                .with("status", "present"),
        )
        .await
        .unwrap();
        Arc::new(db)
    }

    #[test]
    fn test_artifact_name_shape() {
        let name = artifact_name(ReportKind::StudentAttendance, &january());
        assert!(name.starts_with("student_attendance_20250101_20250131_"));
        assert!(name.ends_with(".xlsx"));
        let parts: Vec<&str> = name.trim_end_matches(".xlsx").split('_').collect();
        assert_eq!(parts[parts.len() - 2].len(), 17);
        assert_eq!(parts[parts.len() - 1].len(), 8);
    }

    #[tokio::test]
    async fn test_render_reports_milestones() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = ReportRenderer::new(seeded().await, dir.path());
        let progress = Recorder::default();

        let report = renderer
            .render(ReportKind::StudentAttendance, &january(), &progress)
            .await
            .unwrap();

        assert_eq!(report.row_count, 1);
        assert!(report.path.exists());
        assert!(report.size_bytes > 0);
        assert_eq!(*progress.seen.lock(), vec![30, 50, 80, 100]);
    }

    #[tokio::test]
    async fn test_render_empty_range_still_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = ReportRenderer::new(seeded().await, dir.path());
        let filter = ReportFilter::new(
            DateRange::new(
                NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
            )
            .unwrap(),
        );

        let report = renderer
            .render(ReportKind::TeacherAttendance, &filter, &NoopProgress)
            .await
            .unwrap();
        assert_eq!(report.row_count, 0);
        assert!(report.path.exists());
    }

    #[tokio::test]
    async fn test_two_renders_never_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = ReportRenderer::new(seeded().await, dir.path());
        let a = renderer.render(ReportKind::AnalyticsSummary, &january(), &NoopProgress).await.unwrap();
        let b = renderer.render(ReportKind::AnalyticsSummary, &january(), &NoopProgress).await.unwrap();
        assert_ne!(a.path, b.path);
    }

    #[tokio::test]
    async fn test_cancelled_render_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = ReportRenderer::new(seeded().await, dir.path());
        let progress = Recorder::default();
        progress.cancel.store(true, Ordering::SeqCst);

        let err = renderer
            .render(ReportKind::StudentAttendance, &january(), &progress)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobCancelled);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_table_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = ReportRenderer::new(Arc::new(SqliteDatabase::in_memory().await.unwrap()), dir.path());
        let err = renderer
            .render(ReportKind::StudentAttendance, &january(), &NoopProgress)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
