//! Book parser: year sheets in, long-form fact records out.
//!
//! Each year sheet has a header row holding month labels (and usually a
//! `Total` column). Below it the national books carry a single grand-total
//! row, while the category books carry one row per category, interleaved with
//! subtotal and footnote rows that must be filtered out.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::book::{Book, CellValue, Sheet};
use crate::calendar::MonthLabel;
use crate::facts::{FactRecord, Flow, Granularity};
use crate::schema::fact::TOTAL_LABEL;

/// Layout knobs for the source books.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Column holding the category name (falls back to column 0 on narrow sheets).
    pub name_column: usize,
    /// First category row, counted from the header row.
    pub data_row_offset: usize,
    pub min_name_len: usize,
    /// Lowercase prefixes of rows that are never categories.
    pub skip_prefixes: Vec<String>,
    /// Lowercase tokens that stand in for an empty name.
    pub null_tokens: Vec<String>,
    /// Text marking the national grand-total row.
    pub grand_total_marker: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            name_column: 2,
            data_row_offset: 3,
            min_name_len: 3,
            skip_prefixes: vec!["incluye".into(), "total".into()],
            null_tokens: vec!["nan".into(), "none".into(), "null".into()],
            grand_total_marker: "Total general".into(),
        }
    }
}

/// Header row position and its column → month mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMap {
    pub header_row: usize,
    /// Month columns in sheet order.
    pub months: Vec<(usize, MonthLabel)>,
    pub total: Option<usize>,
}

/// Structural problems that cause a single sheet to be skipped.
#[derive(Debug, Clone, PartialEq)]
pub enum SheetParseError {
    NoHeaderRow,
    NoMonthColumns,
    NoGrandTotalRow,
    NoDataRows,
}

impl fmt::Display for SheetParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SheetParseError::NoHeaderRow => f.write_str("no header row with month labels"),
            SheetParseError::NoMonthColumns => f.write_str("header row maps no month columns"),
            SheetParseError::NoGrandTotalRow => f.write_str("no grand-total row"),
            SheetParseError::NoDataRows => f.write_str("no category rows"),
        }
    }
}

impl std::error::Error for SheetParseError {}

/// Row-scanning heuristics, kept behind a trait so they can be swapped or
/// exercised independently of the rest of the parser.
pub trait SheetLayout {
    fn locate_header(&self, sheet: &Sheet) -> Result<ColumnMap, SheetParseError>;

    fn is_data_row(&self, row: &[CellValue], sheet_width: usize) -> bool;

    /// Category name of a qualifying data row.
    fn category_name(&self, row: &[CellValue], sheet_width: usize) -> Option<String> {
        if !self.is_data_row(row, sheet_width) {
            return None;
        }
        Some(self.name_cell(row, sheet_width).as_text())
    }

    fn name_cell<'r>(&self, row: &'r [CellValue], sheet_width: usize) -> &'r CellValue;

    fn grand_total_row(&self, sheet: &Sheet, from_row: usize) -> Option<usize>;

    fn data_row_offset(&self) -> usize;
}

#[derive(Debug, Clone, Default)]
pub struct DefaultLayout {
    pub config: LayoutConfig,
}

impl DefaultLayout {
    pub fn new(config: LayoutConfig) -> Self {
        Self { config }
    }
}

impl SheetLayout for DefaultLayout {
    fn locate_header(&self, sheet: &Sheet) -> Result<ColumnMap, SheetParseError> {
        let header_row = sheet
            .rows
            .iter()
            .position(|row| {
                row.iter()
                    .any(|cell| matches!(cell, CellValue::Text(s) if MonthLabel::from_label(s).is_some()))
            })
            .ok_or(SheetParseError::NoHeaderRow)?;

        let mut months = Vec::new();
        let mut total = None;
        for (c, cell) in sheet.rows[header_row].iter().enumerate() {
            let CellValue::Text(text) = cell else {
                continue;
            };
            if let Some(month) = MonthLabel::from_label(text) {
                months.push((c, month));
            } else if text.trim() == TOTAL_LABEL && total.is_none() {
                total = Some(c);
            }
        }

        if months.is_empty() {
            return Err(SheetParseError::NoMonthColumns);
        }

        Ok(ColumnMap {
            header_row,
            months,
            total,
        })
    }

    fn is_data_row(&self, row: &[CellValue], sheet_width: usize) -> bool {
        let name = self.name_cell(row, sheet_width).as_text();
        if name.is_empty() {
            return false;
        }
        let lower = name.to_lowercase();
        if self.config.null_tokens.iter().any(|t| *t == lower) {
            return false;
        }
        if name.chars().count() < self.config.min_name_len {
            return false;
        }
        !self
            .config
            .skip_prefixes
            .iter()
            .any(|p| lower.starts_with(p.as_str()))
    }

    fn name_cell<'r>(&self, row: &'r [CellValue], sheet_width: usize) -> &'r CellValue {
        let col = if sheet_width > self.config.name_column {
            self.config.name_column
        } else {
            0
        };
        row.get(col).unwrap_or(&CellValue::Empty)
    }

    fn grand_total_row(&self, sheet: &Sheet, from_row: usize) -> Option<usize> {
        let marker = self.config.grand_total_marker.as_str();
        sheet
            .rows
            .iter()
            .enumerate()
            .skip(from_row)
            .find(|(_, row)| {
                row.iter()
                    .any(|cell| matches!(cell, CellValue::Text(s) if s.contains(marker)))
            })
            .map(|(r, _)| r)
    }

    fn data_row_offset(&self) -> usize {
        self.config.data_row_offset
    }
}

/// A sheet that was skipped, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetSkip {
    pub sheet: String,
    pub year: i32,
    pub reason: SheetParseError,
}

/// Result of parsing one workbook.
#[derive(Debug, Clone, Default)]
pub struct ParsedBook {
    pub records: Vec<FactRecord>,
    pub years: Vec<i32>,
    pub skipped: Vec<SheetSkip>,
    pub categories_found: usize,
}

/// Month value of a cell. Empty, non-numeric and exactly-zero cells are
/// "not reported" and yield `None`.
pub fn reported_value(cell: &CellValue) -> Option<f64> {
    cell.as_number().filter(|v| *v != 0.0)
}

/// Parse every year sheet of a book for one flow.
pub fn parse_book<L: SheetLayout>(
    book: &Book,
    flow: Flow,
    granularity: Granularity,
    layout: &L,
) -> ParsedBook {
    let mut parsed = ParsedBook::default();

    for sheet in &book.sheets {
        let Some(year) = sheet.year() else {
            debug!(sheet = %sheet.name, "ignoring non-year sheet");
            continue;
        };

        let result = match granularity {
            Granularity::National => parse_national_sheet(sheet, year, flow, layout),
            Granularity::Category => parse_category_sheet(sheet, year, flow, layout),
        };

        match result {
            Ok((records, categories)) => {
                debug!(year, %flow, records = records.len(), categories, "parsed sheet");
                parsed.records.extend(records);
                parsed.categories_found += categories;
                parsed.years.push(year);
            }
            Err(reason) => {
                warn!(sheet = %sheet.name, %flow, %reason, "skipping sheet");
                parsed.skipped.push(SheetSkip {
                    sheet: sheet.name.clone(),
                    year,
                    reason,
                });
            }
        }
    }

    info!(
        %flow,
        %granularity,
        records = parsed.records.len(),
        sheets = parsed.years.len(),
        skipped = parsed.skipped.len(),
        "parsed book"
    );
    parsed
}

/// Emit one row's month facts plus its `Total` fact. Returns the number of
/// month facts pushed.
fn emit_row(
    row: &[CellValue],
    columns: &ColumnMap,
    year: i32,
    flow: Flow,
    category: Option<&str>,
    out: &mut Vec<FactRecord>,
) -> usize {
    let mut months_sum = 0.0;
    let mut months = 0;
    for &(c, month) in &columns.months {
        let Some(usd) = row.get(c).and_then(reported_value) else {
            continue;
        };
        months_sum += usd;
        months += 1;
        out.push(FactRecord::month(
            year,
            month,
            flow,
            category.map(str::to_string),
            usd,
        ));
    }

    if let Some(total) = columns
        .total
        .and_then(|c| row.get(c))
        .and_then(reported_value)
    {
        out.push(FactRecord::total(
            year,
            flow,
            category.map(str::to_string),
            total,
            Some(months_sum),
        ));
    }
    months
}

fn parse_national_sheet<L: SheetLayout>(
    sheet: &Sheet,
    year: i32,
    flow: Flow,
    layout: &L,
) -> Result<(Vec<FactRecord>, usize), SheetParseError> {
    let columns = layout.locate_header(sheet)?;
    let total_row = layout
        .grand_total_row(sheet, columns.header_row + 1)
        .ok_or(SheetParseError::NoGrandTotalRow)?;

    let mut records = Vec::with_capacity(columns.months.len() + 1);
    emit_row(&sheet.rows[total_row], &columns, year, flow, None, &mut records);
    Ok((records, 0))
}

fn parse_category_sheet<L: SheetLayout>(
    sheet: &Sheet,
    year: i32,
    flow: Flow,
    layout: &L,
) -> Result<(Vec<FactRecord>, usize), SheetParseError> {
    let columns = layout.locate_header(sheet)?;
    let width = sheet.width();

    let mut records = Vec::new();
    let mut categories = 0;
    for row in sheet.rows.iter().skip(columns.header_row + layout.data_row_offset()) {
        let Some(name) = layout.category_name(row, width) else {
            continue;
        };
        // Section headings carry a name but no month figures.
        let before = records.len();
        if emit_row(row, &columns, year, flow, Some(&name), &mut records) == 0 {
            records.truncate(before);
            continue;
        }
        categories += 1;
    }

    if categories == 0 {
        return Err(SheetParseError::NoDataRows);
    }
    Ok((records, categories))
}
