use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::Timelike;
use std::path::Path;
use tracing::debug;

use super::CsvTable;

/// Text form of one cell. Whole floats lose their `.0` and dates are written
/// as `YYYY-MM-DD`, with the time only when there is one.
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::Float(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(t) if t.num_seconds_from_midnight() == 0 => t.format("%Y-%m-%d").to_string(),
            Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => dt.as_f64().to_string(),
        },
        other => other.to_string(),
    }
}

/// First worksheet of a workbook; the first row holds the headers.
pub fn read_first_sheet(path: &Path) -> Result<CsvTable> {
    let mut workbook =
        open_workbook_auto(path).with_context(|| format!("opening workbook {}", path.display()))?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .with_context(|| format!("{} has no worksheets", path.display()))?;
    let range = workbook
        .worksheet_range(&sheet)
        .with_context(|| format!("reading sheet {} of {}", sheet, path.display()))?;

    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Ok(CsvTable::default());
    };
    let mut table = CsvTable::new(header.iter().map(cell_text).collect());
    for row in rows {
        table.push_row(row.iter().map(cell_text).collect());
    }
    debug!(sheet = %sheet, rows = table.len(), "read workbook");
    Ok(table)
}
