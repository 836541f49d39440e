use super::RawTable;
use crate::error::{DispatchError, DispatchResult};
use csv::ReaderBuilder;
use std::io::Read;

/// Parses comma separated text with a mandatory header row.
///
/// Rows may be shorter or longer than the header row; missing trailing
/// cells are treated as empty.
pub fn read_csv<R: Read>(reader: R) -> DispatchResult<RawTable> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader
        .headers()
        .map_err(|e| DispatchError::Input(format!("failed to read CSV headers: {e}")))?
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>();

    if headers.iter().all(|h| h.is_empty()) {
        return Err(DispatchError::Input("CSV header row is empty".to_string()));
    }

    let mut rows = Vec::new();
    for (index, result) in reader.records().enumerate() {
        // Row 1 is the header
        let record = result.map_err(|e| {
            DispatchError::Input(format!("row {}: CSV parse error: {e}", index + 2))
        })?;
        rows.push(record.iter().map(|cell| Some(cell.to_string())).collect::<Vec<_>>());
    }

    Ok(RawTable::from_rows(headers, rows))
}
