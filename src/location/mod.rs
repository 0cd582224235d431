use anyhow::Result;
use glob::glob;
use std::{
    cmp::Ordering,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

use crate::table::CsvTable;

/// Columns of the synthesized LOCATION table, in output order.
pub const LOCATION_COLUMNS: &[&str] = &[
    "location_id",
    "address_1",
    "address_2",
    "city",
    "state",
    "zip",
    "county",
    "location_source_value",
    "country_concept_id",
    "country_source_value",
    "latitude",
    "longitude",
    "FIPS",
];

fn numeric_id(id: &str) -> Option<f64> {
    id.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Numeric ids first in numeric order, anything else (`nan` included)
/// after, lexically.
fn compare_ids(a: &str, b: &str) -> Ordering {
    match (numeric_id(a), numeric_id(b)) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Build `LOCATION.csv` in `out_dir` from every `*_with_fips.csv` under
/// `search_dir`. Files lacking any location column are skipped. Returns
/// `None` when nothing usable was found.
#[tracing::instrument(level = "info", skip_all, fields(dir = %search_dir.display()))]
pub fn create_location_csv(search_dir: &Path, out_dir: &Path) -> Result<Option<PathBuf>> {
    let pattern = format!("{}/**/*_with_fips.csv", search_dir.display());
    let mut files: Vec<PathBuf> = glob(&pattern)?.collect::<Result<_, _>>()?;
    files.sort();
    info!(files = files.len(), "found FIPS files");

    let mut parts = Vec::new();
    for file in &files {
        let table = CsvTable::read(file)?;
        if !LOCATION_COLUMNS.iter().all(|c| table.has_column(c)) {
            warn!(path = %file.display(), "missing location columns, skipped");
            continue;
        }
        let mut locations = table.select(LOCATION_COLUMNS)?;
        locations.dedup_rows();
        parts.push(locations);
    }
    if parts.is_empty() {
        warn!("no FIPS data found to create LOCATION.csv");
        return Ok(None);
    }

    let mut combined = CsvTable::concat(parts);
    combined.dedup_rows();
    combined.rows.sort_by(|a, b| compare_ids(&a[0], &b[0]));

    let path = out_dir.join("LOCATION.csv");
    combined.write(&path)?;
    info!(path = %path.display(), rows = combined.len(), "LOCATION.csv created");
    Ok(Some(path))
}
