use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

/// One row of a sheet, keyed by column header in header order.
pub type Record = Map<String, JsonValue>;

/// Largest magnitude at which every integer is exactly representable as f64.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Convert a float into a JSON number, using the integer form when lossless.
///
/// Returns `None` for NaN and infinities, which have no JSON representation.
pub fn number_to_json(value: f64) -> Option<JsonValue> {
    if !value.is_finite() {
        return None;
    }
    if value.fract() == 0.0 && value.abs() <= MAX_SAFE_INTEGER {
        // -0.0 also lands here and prints as 0
        return Some(JsonValue::Number((value as i64).into()));
    }
    serde_json::Number::from_f64(value).map(JsonValue::Number)
}

/// A scalar spreadsheet cell. Empty cells have no `CellValue` at all.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Bool(bool),
}

impl CellValue {
    pub fn to_json(&self) -> JsonValue {
        match self {
            CellValue::Text(s) => JsonValue::String(s.clone()),
            CellValue::Number(n) => number_to_json(*n).unwrap_or(JsonValue::Null),
            CellValue::Bool(b) => JsonValue::Bool(*b),
        }
    }

    /// Text used when the cell appears in a header row.
    pub fn header_text(&self) -> String {
        match self {
            CellValue::Text(s) => s.clone(),
            CellValue::Number(n) => match number_to_json(*n) {
                Some(value) => value.to_string(),
                None => n.to_string(),
            },
            CellValue::Bool(b) => b.to_string().to_uppercase(),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Number(value as f64)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Bool(value)
    }
}

/// Turn raw rows into records. The first non-empty row supplies the headers.
///
/// Empty header cells become `__EMPTY`, `__EMPTY_1`, ...; repeated headers get
/// `_1`, `_2`, ... suffixes. Empty data cells are left out of the record and rows
/// with no values at all are skipped.
pub fn rows_to_records<I>(rows: I) -> Vec<Record>
where
    I: IntoIterator<Item = Vec<Option<CellValue>>>,
{
    let mut rows = rows
        .into_iter()
        .skip_while(|row| row.iter().all(Option::is_none));

    let headers = match rows.next() {
        Some(header_row) => build_headers(&header_row),
        None => return Vec::new(),
    };

    let mut records = Vec::new();
    for row in rows {
        let mut record = Record::new();
        for (header, cell) in headers.iter().zip(row) {
            if let Some(cell) = cell {
                record.insert(header.clone(), cell.to_json());
            }
        }
        if !record.is_empty() {
            records.push(record);
        }
    }
    records
}

fn build_headers(row: &[Option<CellValue>]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::with_capacity(row.len());
    let mut empty_count = 0usize;
    for cell in row {
        let base = match cell {
            Some(cell) => cell.header_text(),
            None => {
                let name = if empty_count == 0 {
                    "__EMPTY".to_string()
                } else {
                    format!("__EMPTY_{}", empty_count)
                };
                empty_count += 1;
                seen.push(name);
                continue;
            }
        };
        let mut name = base.clone();
        let mut suffix = 1;
        while seen.contains(&name) {
            name = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        seen.push(name);
    }
    seen
}

/// Aggregated sheets for one invocation: sheet name -> array of records.
///
/// Built once by the aggregator and only ever borrowed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Document(JsonValue);

impl Document {
    pub(crate) fn from_sheets(sheets: Vec<(String, Vec<Record>)>) -> Self {
        let mut map = Map::new();
        for (name, records) in sheets {
            let rows = records.into_iter().map(JsonValue::Object).collect();
            map.insert(name, JsonValue::Array(rows));
        }
        Document(JsonValue::Object(map))
    }

    pub fn empty() -> Self {
        Document(JsonValue::Object(Map::new()))
    }

    pub fn sheet(&self, name: &str) -> Option<&[JsonValue]> {
        self.0
            .get(name)
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        match &self.0 {
            JsonValue::Object(map) => map.keys().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    pub fn as_value(&self) -> &JsonValue {
        &self.0
    }

    pub fn into_value(self) -> JsonValue {
        self.0
    }
}
