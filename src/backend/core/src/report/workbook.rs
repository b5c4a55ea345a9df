//! In-memory workbook model and its xlsx writer.
//!
//! A [`Workbook`] holds sheets; a [`Sheet`] stacks sections, each with an
//! optional title row, a bold header row and its data rows. Building the model
//! is cheap and async-friendly; [`write_workbook`] does the blocking file IO.

use chrono::NaiveDate;
use rust_xlsxwriter::{Format, Workbook as XlsxWorkbook};
use std::path::Path;

use super::schema::{Column, ColumnFormat};
use crate::db::{Row, SqlValue};
use crate::error::Result;

/// Excel's limit on sheet name length.
const MAX_SHEET_NAME: usize = 31;

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl Cell {
    /// Convert a stored value according to the column format. Values that do
    /// not fit the format fall back to text.
    pub fn from_value(value: &SqlValue, format: ColumnFormat) -> Self {
        if value.is_null() {
            return Self::Empty;
        }
        match format {
            ColumnFormat::Number => match value {
                SqlValue::Int(v) => Self::Number(*v as f64),
                SqlValue::Float(v) if v.is_finite() => Self::Number(*v),
                SqlValue::Text(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Self::Number)
                    .unwrap_or_else(|_| Self::Text(s.clone())),
                other => Self::Text(other.to_string()),
            },
            ColumnFormat::Date => value
                .as_date()
                .map(Self::Date)
                .unwrap_or_else(|| Self::Text(value.to_string())),
            ColumnFormat::Text => Self::Text(value.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub title: Option<String>,
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Cell>>,
}

impl Section {
    /// Materialise `rows` into cells in column order.
    pub fn from_rows(title: Option<&str>, columns: &[Column], rows: &[Row]) -> Self {
        let cells = rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| Cell::from_value(&row.value(c.key), c.format))
                    .collect()
            })
            .collect();
        Self {
            title: title.map(str::to_string),
            columns: columns.to_vec(),
            rows: cells,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub name: String,
    pub sections: Vec<Section>,
}

impl Sheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sections: Vec::new(),
        }
    }

    pub fn with_section(mut self, section: Section) -> Self {
        self.sections.push(section);
        self
    }

    pub fn row_count(&self) -> usize {
        self.sections.iter().map(Section::row_count).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sheet(mut self, sheet: Sheet) -> Self {
        self.sheets.push(sheet);
        self
    }

    /// Data rows across all sheets.
    pub fn row_count(&self) -> usize {
        self.sheets.iter().map(Sheet::row_count).sum()
    }
}

/// Write `workbook` to `path`. Blocking.
pub fn write_workbook(workbook: &Workbook, path: &Path) -> Result<()> {
    let mut xlsx = XlsxWorkbook::new();
    let bold = Format::new().set_bold();
    let title = Format::new().set_bold().set_font_size(13);

    for sheet in &workbook.sheets {
        let worksheet = xlsx.add_worksheet();
        worksheet.set_name(sheet_name(&sheet.name))?;

        let mut row: u32 = 0;
        let mut widths: Vec<f64> = Vec::new();
        for (index, section) in sheet.sections.iter().enumerate() {
            if index > 0 {
                row += 1;
            }
            if let Some(text) = &section.title {
                worksheet.write_string_with_format(row, 0, text.as_str(), &title)?;
                row += 1;
            }
            for (col, column) in section.columns.iter().enumerate() {
                worksheet.write_string_with_format(row, col as u16, column.header, &bold)?;
                if widths.len() <= col {
                    widths.push(column.width);
                } else {
                    widths[col] = widths[col].max(column.width);
                }
            }
            row += 1;

            for cells in &section.rows {
                for (col, cell) in cells.iter().enumerate() {
                    let col = col as u16;
                    match cell {
                        Cell::Empty => {}
                        Cell::Text(s) => {
                            worksheet.write_string(row, col, s.as_str())?;
                        }
                        Cell::Number(n) => {
                            worksheet.write_number(row, col, *n)?;
                        }
                        Cell::Date(d) => {
                            worksheet.write_string(row, col, d.format("%Y-%m-%d").to_string())?;
                        }
                    }
                }
                row += 1;
            }
        }

        for (col, width) in widths.iter().enumerate() {
            worksheet.set_column_width(col as u16, *width)?;
        }
    }

    xlsx.save(path)?;
    Ok(())
}

/// Strip characters Excel rejects and clamp the length.
fn sheet_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '[' | ']' | ':' | '*' | '?' | '/' | '\\'))
        .take(MAX_SHEET_NAME)
        .collect();
    if cleaned.trim().is_empty() {
        "Sheet".to_string()
    } else {
        cleaned
    }
}
