//! Tabular sources that yield sheets as ordered records.
//!
//! Every reader follows the same row convention: the first non-empty row holds the
//! column headers and each following row becomes one [`Record`]
//! (see [`rows_to_records`]).

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use calamine::{Data, Reader, Sheets, open_workbook_auto};
use tracing::debug;

use crate::error::{ConvertError, ConvertErrorKind};
use crate::model::{CellValue, Record, rows_to_records};

const WORKBOOK_EXTENSIONS: [&str; 5] = ["xlsx", "xlsm", "xlsb", "xls", "ods"];

pub trait TabularReader {
    /// Names of the sheets the source offers, in source order.
    fn sheet_names(&self) -> Vec<String>;

    /// Read one sheet. Fails with `SheetNotFound` if the source has no such sheet.
    fn read_sheet(&mut self, sheet: &str) -> Result<Vec<Record>, ConvertError>;
}

/// Open a tabular source, choosing the reader from the path.
///
/// Directories are read as one CSV file per sheet, `.csv` files as a single sheet
/// named after the file stem, and spreadsheet files through calamine.
pub fn open_source(path: &Path) -> Result<Box<dyn TabularReader>, ConvertError> {
    if path.is_dir() {
        return Ok(Box::new(CsvReader::open_dir(path)?));
    }
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if extension == "csv" {
        return Ok(Box::new(CsvReader::open_file(path)?));
    }
    if WORKBOOK_EXTENSIONS.contains(&extension.as_str()) {
        return Ok(Box::new(WorkbookReader::open(path)?));
    }
    Err(ConvertError::new(
        ConvertErrorKind::SourceUnreadable,
        format!("unsupported source format: {}", path.display()),
    )
    .with_origin(path.display().to_string()))
}

// =============================================================================
// Spreadsheet workbooks
// =============================================================================

pub struct WorkbookReader {
    path: PathBuf,
    workbook: Sheets<BufReader<File>>,
}

impl WorkbookReader {
    pub fn open(path: &Path) -> Result<Self, ConvertError> {
        let workbook = open_workbook_auto(path)
            .map_err(|err| ConvertError::from(err).with_origin(path.display().to_string()))?;
        debug!(path = %path.display(), "opened workbook");
        Ok(Self {
            path: path.to_path_buf(),
            workbook,
        })
    }
}

impl TabularReader for WorkbookReader {
    fn sheet_names(&self) -> Vec<String> {
        self.workbook.sheet_names()
    }

    fn read_sheet(&mut self, sheet: &str) -> Result<Vec<Record>, ConvertError> {
        if !self.workbook.sheet_names().iter().any(|name| name == sheet) {
            return Err(ConvertError::sheet_not_found(sheet));
        }
        let range = self.workbook.worksheet_range(sheet).map_err(|err| {
            ConvertError::from(err).with_origin(format!("{}#{}", self.path.display(), sheet))
        })?;
        let rows = range
            .rows()
            .map(|row| row.iter().map(workbook_cell).collect::<Vec<_>>());
        Ok(rows_to_records(rows))
    }
}

fn workbook_cell(cell: &Data) -> Option<CellValue> {
    match cell {
        Data::Empty => None,
        Data::Int(i) => Some(CellValue::Number(*i as f64)),
        Data::Float(f) => Some(CellValue::Number(*f)),
        Data::Bool(b) => Some(CellValue::Bool(*b)),
        Data::String(s) if s.is_empty() => None,
        Data::String(s) => Some(CellValue::Text(s.clone())),
        // serial day number, as the cell is stored
        Data::DateTime(dt) => Some(CellValue::Number(dt.as_f64())),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Some(CellValue::Text(s.clone())),
        Data::Error(err) => Some(CellValue::Text(err.to_string())),
    }
}

// =============================================================================
// CSV sheets
// =============================================================================

/// CSV-backed sheets: either one file, or a directory holding `<sheet>.csv` files.
pub struct CsvReader {
    sheets: Vec<(String, PathBuf)>,
}

impl CsvReader {
    pub fn open_file(path: &Path) -> Result<Self, ConvertError> {
        if !path.is_file() {
            return Err(unreadable(path, "file not found"));
        }
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| unreadable(path, "file name is not valid UTF-8"))?;
        Ok(Self {
            sheets: vec![(name.to_string(), path.to_path_buf())],
        })
    }

    pub fn open_dir(dir: &Path) -> Result<Self, ConvertError> {
        let entries =
            std::fs::read_dir(dir).map_err(|err| unreadable(dir, &err.to_string()))?;
        let mut sheets = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| unreadable(dir, &err.to_string()))?.path();
            let is_csv = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
            if !is_csv || !path.is_file() {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                sheets.push((stem.to_string(), path.clone()));
            }
        }
        sheets.sort_by(|a, b| a.0.cmp(&b.0));
        debug!(dir = %dir.display(), sheets = sheets.len(), "opened csv directory");
        Ok(Self { sheets })
    }
}

impl TabularReader for CsvReader {
    fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|(name, _)| name.clone()).collect()
    }

    fn read_sheet(&mut self, sheet: &str) -> Result<Vec<Record>, ConvertError> {
        let path = self
            .sheets
            .iter()
            .find(|(name, _)| name == sheet)
            .map(|(_, path)| path)
            .ok_or_else(|| ConvertError::sheet_not_found(sheet))?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .map_err(|err| ConvertError::from(err).with_origin(path.display().to_string()))?;

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record
                .map_err(|err| ConvertError::from(err).with_origin(path.display().to_string()))?;
            rows.push(record.iter().map(csv_cell).collect::<Vec<_>>());
        }
        Ok(rows_to_records(rows))
    }
}

/// Infer the cell type from CSV text.
fn csv_cell(raw: &str) -> Option<CellValue> {
    if raw.is_empty() {
        return None;
    }
    if raw.eq_ignore_ascii_case("true") {
        return Some(CellValue::Bool(true));
    }
    if raw.eq_ignore_ascii_case("false") {
        return Some(CellValue::Bool(false));
    }
    if looks_numeric(raw) {
        if let Ok(n) = raw.parse::<f64>() {
            if n.is_finite() {
                return Some(CellValue::Number(n));
            }
        }
    }
    Some(CellValue::Text(raw.to_string()))
}

// f64::from_str also accepts "inf", "NaN" and friends, which must stay text.
fn looks_numeric(raw: &str) -> bool {
    let digits = raw.strip_prefix(['-', '+']).unwrap_or(raw);
    digits.starts_with(|c: char| c.is_ascii_digit() || c == '.')
        && digits
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '-' | '+'))
}

fn unreadable(path: &Path, reason: &str) -> ConvertError {
    ConvertError::new(
        ConvertErrorKind::SourceUnreadable,
        format!("cannot read {}: {}", path.display(), reason),
    )
    .with_origin(path.display().to_string())
}

// =============================================================================
// In-memory sheets
// =============================================================================

/// Sheets held in memory as raw cell rows, first row being the header.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkbook {
    sheets: Vec<(String, Vec<Vec<Option<CellValue>>>)>,
}

impl InMemoryWorkbook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sheet(
        mut self,
        name: impl Into<String>,
        rows: Vec<Vec<Option<CellValue>>>,
    ) -> Self {
        self.sheets.push((name.into(), rows));
        self
    }
}

impl TabularReader for InMemoryWorkbook {
    fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|(name, _)| name.clone()).collect()
    }

    fn read_sheet(&mut self, sheet: &str) -> Result<Vec<Record>, ConvertError> {
        let (_, rows) = self
            .sheets
            .iter()
            .find(|(name, _)| name == sheet)
            .ok_or_else(|| ConvertError::sheet_not_found(sheet))?;
        Ok(rows_to_records(rows.iter().cloned()))
    }
}
