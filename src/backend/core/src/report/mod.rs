//! Spreadsheet reports.
//!
//! - [`schema`]: report kinds, fixed column schemas and filters
//! - [`workbook`]: the sheet/section model and the xlsx writer
//! - [`renderer`]: query, materialise and write, with progress milestones

pub mod renderer;
pub mod schema;
pub mod workbook;

pub use renderer::{artifact_name, RenderedReport, ReportRenderer};
pub use schema::{Column, ColumnFormat, ReportFilter, ReportKind};
pub use workbook::{Cell, Section, Sheet, Workbook};

/// Observer for long-running work.
///
/// Implementations must not block beyond an in-memory update.
pub trait ProgressSink: Send + Sync {
    /// Record progress in percent (0..=100).
    fn report(&self, percent: u8, message: &str);

    /// Whether the caller asked for the work to stop.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Discards progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _percent: u8, _message: &str) {}
}
