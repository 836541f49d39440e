//! Raw recipient tables as read from an uploaded spreadsheet.
//!
//! Two formats are understood: comma separated text (`.csv`) and Office
//! Open XML workbooks (`.xlsx`, first worksheet only). Either way the result
//! is a [`RawTable`]: ordered headers plus one header-to-cell map per row.

mod delimited;
mod xlsx;

use crate::error::{DispatchError, DispatchResult};
use std::collections::HashMap;
use std::path::Path;

pub use delimited::read_csv;
pub use xlsx::read_xlsx;

/// One data row: header text to trimmed cell text. Empty cells are absent.
pub type RawRow = HashMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    headers: Vec<String>,
    rows: Vec<RawRow>,
}

impl RawTable {
    /// Builds a table from a header row and positional data rows.
    ///
    /// Cells beyond the header count and blank headers are ignored; if a
    /// header repeats, its first column wins.
    pub fn from_rows<I, R, S>(headers: Vec<String>, rows: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        let rows = rows
            .into_iter()
            .map(|cells| {
                let mut row = RawRow::new();
                for (header, cell) in headers.iter().zip(cells) {
                    let Some(cell) = cell else { continue };
                    let value: String = cell.into();
                    let value = value.trim();
                    if header.is_empty() || value.is_empty() || row.contains_key(header) {
                        continue;
                    }
                    row.insert(header.clone(), value.to_string());
                }
                row
            })
            .collect();
        Self { headers, rows }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[RawRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Loads a table, choosing the parser from the file extension.
pub fn load<P: AsRef<Path>>(path: P) -> DispatchResult<RawTable> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    let file = std::fs::File::open(path).map_err(|e| {
        DispatchError::Input(format!("cannot open {}: {e}", path.display()))
    })?;

    let table = match extension.as_str() {
        "csv" => read_csv(file)?,
        "xlsx" => read_xlsx(std::io::BufReader::new(file))?,
        other => {
            return Err(DispatchError::Input(format!(
                "unsupported table format '.{other}' for {} (expected .csv or .xlsx)",
                path.display()
            )))
        }
    };

    log::info!(
        "📂 Loaded {} row(s) with headers [{}] from {}",
        table.len(),
        table.headers().join(", "),
        path.display()
    );
    Ok(table)
}
