use tracing::debug;

use crate::error::ConvertError;
use crate::model::Document;
use crate::reader::TabularReader;

/// Read the requested sheets into one [`Document`], keyed in request order.
///
/// Stops at the first sheet the reader cannot supply; no partial document is
/// returned. A name requested twice is read once and keeps its first position.
pub fn aggregate<S: AsRef<str>>(
    sheet_names: &[S],
    reader: &mut dyn TabularReader,
) -> Result<Document, ConvertError> {
    let mut sheets = Vec::with_capacity(sheet_names.len());
    for name in sheet_names {
        let name = name.as_ref();
        if sheets.iter().any(|(existing, _)| existing == name) {
            continue;
        }
        let records = reader.read_sheet(name)?;
        debug!(sheet = name, rows = records.len(), "read sheet");
        sheets.push((name.to_string(), records));
    }
    Ok(Document::from_sheets(sheets))
}
