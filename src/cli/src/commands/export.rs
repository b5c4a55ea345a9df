//! Report export through an in-process job service.

use anyhow::{bail, Result};
use clap::Args;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::output::{self, OutputFormat};
use crate::Context;
use rollcall_core::jobs::{JobCategory, JobService, JobState, ReportJobHandler, Submitter};
use rollcall_core::report::ReportRenderer;

#[derive(Args)]
pub struct ExportArgs {
    /// Report type (student-attendance, teacher-attendance, analytics-report, semester-report)
    job_type: String,

    /// First day of the report (YYYY-MM-DD)
    #[arg(long)]
    from: Option<String>,

    /// Last day of the report (YYYY-MM-DD)
    #[arg(long)]
    to: Option<String>,

    /// Semester for semester reports (ganjil or genap)
    #[arg(long)]
    semester: Option<String>,

    /// Academic year for semester reports
    #[arg(long)]
    year: Option<i32>,

    /// Restrict to one class
    #[arg(long = "class")]
    class_id: Option<i64>,

    /// Restrict to one teacher
    #[arg(long = "teacher")]
    teacher_id: Option<i64>,

    /// Role of the requester; decides queue priority
    #[arg(long, default_value = "admin")]
    role: String,

    /// Requesting user
    #[arg(long, default_value_t = 0)]
    user_id: i64,

    /// Queue to submit to (download or report-generation)
    #[arg(long, default_value = "download")]
    category: String,

    /// Seconds to wait for the report
    #[arg(long, default_value_t = 600)]
    timeout: u64,
}

impl ExportArgs {
    /// The loosely typed payload handed to the job service.
    fn payload(&self) -> Value {
        let mut payload = Map::new();
        let mut put = |key: &str, value: Value| {
            payload.insert(key.to_string(), value);
        };
        if let Some(from) = &self.from {
            put("start_date", json!(from));
        }
        if let Some(to) = &self.to {
            put("end_date", json!(to));
        }
        if let Some(semester) = &self.semester {
            put("semester", json!(semester));
        }
        if let Some(year) = self.year {
            put("year", json!(year));
        }
        if let Some(class_id) = self.class_id {
            put("class_id", json!(class_id));
        }
        if let Some(teacher_id) = self.teacher_id {
            put("teacher_id", json!(teacher_id));
        }
        Value::Object(payload)
    }
}

pub async fn execute(args: ExportArgs, ctx: &Context) -> Result<()> {
    let format = ctx.format;
    let category: JobCategory = args.category.parse()?;

    let db = ctx.database().await?;
    let renderer = Arc::new(ReportRenderer::new(db, ctx.config.storage.download_dir.clone()));
    let service = JobService::new(ctx.config.jobs.clone(), Arc::new(ReportJobHandler::new(renderer)));
    service.start()?;

    let submitted = service.submit_json(
        category,
        &args.job_type,
        args.payload(),
        Submitter::with_role_name(args.user_id, &args.role),
    );
    let record = match submitted {
        Ok(handle) => {
            if matches!(format, OutputFormat::Table) {
                output::print_info(&format!(
                    "Job {} queued on {} with priority {}",
                    handle.id, handle.category, handle.priority
                ));
            }
            service.wait_for(handle.id, Duration::from_secs(args.timeout)).await
        }
        Err(e) => Err(e),
    };
    service.stop().await;
    let record = record?;

    match format {
        OutputFormat::Table => match (&record.state, &record.result) {
            (JobState::Completed, Some(artifact)) => {
                output::print_success(&format!("Report written to {}", artifact.path.display()));
                output::print_detail("Rows", artifact.row_count);
                output::print_detail("Size", output::format_bytes(artifact.size_bytes));
                output::print_detail("Attempts", record.attempts);
            }
            _ => {
                let reason = record
                    .last_error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| record.state.to_string());
                bail!("Job {} ended {}: {}", record.id, record.state, reason);
            }
        },
        _ => {
            output::print_item(&record, format)?;
            if record.state != JobState::Completed {
                bail!("Job {} ended {}", record.id, record.state);
            }
        }
    }

    Ok(())
}
