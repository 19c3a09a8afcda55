//! In-memory workbook model and the calamine loader that fills it.

use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use tracing::debug;

use crate::error::{ObservatoryError, Result};

/// Normalized cell content. Everything the parser needs from a spreadsheet
/// cell: text, a number, or nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Text(String),
    Number(f64),
}

impl CellValue {
    pub fn text(s: impl Into<String>) -> Self {
        CellValue::Text(s.into())
    }

    /// Trimmed display text. Numbers use their plain float formatting.
    pub fn as_text(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Text(s) => s.trim().to_string(),
            CellValue::Number(n) => n.to_string(),
        }
    }

    /// Finite numeric value, parsing text cells as plain floats.
    pub fn as_number(&self) -> Option<f64> {
        let value = match self {
            CellValue::Empty => return None,
            CellValue::Number(n) => *n,
            CellValue::Text(s) => s.trim().parse::<f64>().ok()?,
        };
        value.is_finite().then_some(value)
    }
}

impl From<&Data> for CellValue {
    fn from(cell: &Data) -> Self {
        match cell {
            Data::Empty => CellValue::Empty,
            Data::String(s) => CellValue::Text(s.clone()),
            Data::Float(f) => CellValue::Number(*f),
            Data::Int(i) => CellValue::Number(*i as f64),
            Data::Bool(b) => CellValue::Text(b.to_string()),
            Data::Error(_) => CellValue::Empty,
            other => CellValue::Text(other.to_string()),
        }
    }
}

/// One named sheet as a dense row-major grid.
#[derive(Debug, Clone, Default)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<CellValue>>,
}

impl Sheet {
    pub fn new(name: impl Into<String>, rows: Vec<Vec<CellValue>>) -> Self {
        Self {
            name: name.into(),
            rows,
        }
    }

    pub fn width(&self) -> usize {
        self.rows.iter().map(|r| r.len()).max().unwrap_or(0)
    }

    /// Year encoded in the sheet name, when the name is exactly four digits.
    pub fn year(&self) -> Option<i32> {
        let name = self.name.trim();
        if name.len() == 4 && name.chars().all(|c| c.is_ascii_digit()) {
            name.parse().ok()
        } else {
            None
        }
    }
}

/// A workbook: sheets in file order.
#[derive(Debug, Clone, Default)]
pub struct Book {
    pub sheets: Vec<Sheet>,
}

impl Book {
    pub fn new(sheets: Vec<Sheet>) -> Self {
        Self { sheets }
    }
}

/// Open an xls/xlsx/ods file and copy every sheet into a `Book`.
pub fn open_book(path: &Path) -> Result<Book> {
    let workbook_err = |message: String| ObservatoryError::Workbook {
        path: path.to_path_buf(),
        message,
    };

    let mut workbook = open_workbook_auto(path).map_err(|e| workbook_err(e.to_string()))?;
    let sheet_names = workbook.sheet_names().to_owned();

    let mut sheets = Vec::with_capacity(sheet_names.len());
    for name in sheet_names {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| workbook_err(format!("sheet '{name}': {e}")))?;

        let rows: Vec<Vec<CellValue>> = range
            .rows()
            .map(|row| row.iter().map(CellValue::from).collect())
            .collect();

        debug!(sheet = %name, rows = rows.len(), "loaded sheet");
        sheets.push(Sheet::new(name, rows));
    }

    Ok(Book::new(sheets))
}
