//! Job handlers: what a job actually does once dispatched.

use async_trait::async_trait;
use std::sync::Arc;

use super::job::{JobArtifact, JobContext, JobError, JobPayload};
use crate::report::{ReportFilter, ReportKind, ReportRenderer};

/// Executes one attempt of a job.
///
/// Errors marked retryable are retried per the category's policy; anything
/// else fails the job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext) -> Result<JobArtifact, JobError>;
}

/// Renders the report a payload asks for.
pub struct ReportJobHandler {
    renderer: Arc<ReportRenderer>,
}

impl ReportJobHandler {
    pub fn new(renderer: Arc<ReportRenderer>) -> Self {
        Self { renderer }
    }

    /// Report kind and filter for a payload.
    pub fn plan(payload: &JobPayload) -> crate::error::Result<(ReportKind, ReportFilter)> {
        let kind = match payload {
            JobPayload::StudentAttendance { .. } => ReportKind::StudentAttendance,
            JobPayload::TeacherAttendance { .. } => ReportKind::TeacherAttendance,
            JobPayload::AnalyticsReport { .. } => ReportKind::AnalyticsSummary,
            JobPayload::SemesterReport { .. } => ReportKind::SemesterSummary,
        };
        let filter = ReportFilter::new(payload.date_range()?)
            .with_class(payload.class_id())
            .with_teacher(payload.teacher_id());
        Ok((kind, filter))
    }
}

#[async_trait]
impl JobHandler for ReportJobHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<JobArtifact, JobError> {
        let (kind, filter) = Self::plan(&ctx.payload)?;
        ctx.log_info(&format!("Rendering {} report", kind));

        let report = self.renderer.render(kind, &filter, ctx).await?;
        Ok(JobArtifact {
            path: report.path,
            file_name: report.file_name,
            row_count: report.row_count,
            size_bytes: report.size_bytes,
        })
    }
}
