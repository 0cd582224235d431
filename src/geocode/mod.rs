// src/geocode/mod.rs
use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::ContainerConfig;
use crate::container::{ContainerRunner, Workspace};
use crate::table::CsvTable;

pub mod census;
pub mod flag;

/// Private row id carried through the container round-trips.
pub const ROW_ID: &str = "_rid";

/// Columns only the geocoder adds; dropped once coordinates are known.
pub const GEOCODER_DETAIL_COLUMNS: &[&str] = &[
    "matched_street",
    "matched_zip",
    "matched_city",
    "matched_state",
    "score",
    "precision",
];

static NON_ALNUM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9 ]").expect("address regex should be valid"));

/// Python-style `str.title()`: a letter is upper-cased when it follows a
/// non-letter, lower-cased otherwise.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_letter = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_letter {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_letter = true;
        } else {
            out.push(c);
            prev_letter = false;
        }
    }
    out
}

/// `"30309.0"` → `"30309"`.
pub fn clean_zip(z: &str) -> String {
    let z = z.trim();
    match z.split_once('.') {
        Some((head, _)) => head.to_string(),
        None => z.to_string(),
    }
}

/// Build the single-line address the geocoder expects.
pub fn normalize_address(parts: &[&str]) -> String {
    let joined = if parts.len() == 1 {
        title_case(parts[0])
    } else {
        title_case(&parts.join(" ").to_lowercase())
    };
    NON_ALNUM.replace_all(&joined, " ").into_owned()
}

/// Add an `address` column (first) built from `columns`. With several
/// source columns they are dropped afterwards; `latitude`/`longitude` always
/// go since the geocoder produces its own.
pub fn prepare_addresses(table: &mut CsvTable, columns: &[String]) -> Result<()> {
    let idx: Vec<usize> = columns
        .iter()
        .map(|c| table.require_column(c))
        .collect::<Result<_>>()?;
    let zip_pos: Option<usize> = columns.iter().position(|c| c.eq_ignore_ascii_case("zip"));

    let addresses: Vec<String> = table
        .rows
        .par_iter()
        .map(|row| {
            let parts: Vec<String> = idx
                .iter()
                .enumerate()
                .map(|(pos, &i)| {
                    if Some(pos) == zip_pos {
                        clean_zip(&row[i])
                    } else {
                        row[i].clone()
                    }
                })
                .collect();
            let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
            normalize_address(&refs)
        })
        .collect();

    table.set_column("address", addresses)?;
    table.move_to_front("address");
    if columns.len() > 1 {
        let names: Vec<&str> = columns.iter().map(String::as_str).collect();
        table.drop_columns(&names);
    }
    table.drop_columns(&["latitude", "longitude"]);
    Ok(())
}

/// Write `table` as `preprocessed_1.csv` in `work_dir`, run the geocoder on
/// it and return the path of the geocoder's output.
#[tracing::instrument(level = "info", skip_all, fields(dir = %work_dir.display()))]
pub fn run_geocoder(
    runner: &dyn ContainerRunner,
    workspace: &Workspace,
    containers: &ContainerConfig,
    table: &CsvTable,
    threshold: f64,
    work_dir: &Path,
) -> Result<PathBuf> {
    let input = work_dir.join("preprocessed_1.csv");
    table.write(&input)?;
    info!(path = %input.display(), rows = table.len(), "preprocessed file created");

    let image = &containers.geocoder_image;
    let invocation = workspace.invocation(image, &input, &[threshold.to_string()])?;
    runner
        .run(&invocation)
        .with_context(|| format!("geocoding {}", input.display()))?;

    let output = image.output_path(&input, &format!("score_threshold_{}", threshold));
    if !output.exists() {
        bail!("expected geocoder output not found: {}", output.display());
    }
    Ok(output)
}

/// Tidy geocoder output into the coordinates file shape.
pub fn finalize_coordinates(table: &mut CsvTable) {
    table.drop_columns(GEOCODER_DETAIL_COLUMNS);
    table.rename_columns(&[("lat", "latitude"), ("lon", "longitude")]);
}

/// Add the private row id used to match container output back to input rows.
pub fn add_row_ids(table: &mut CsvTable) -> Result<()> {
    let ids = (0..table.len()).map(|i| i.to_string()).collect();
    table.set_column(ROW_ID, ids)
}

/// Geocode the address columns of `table`, returning the geocoder output
/// (still in lat/lon form, with the detail columns).
pub fn geocode_table(
    runner: &dyn ContainerRunner,
    workspace: &Workspace,
    containers: &ContainerConfig,
    mut table: CsvTable,
    columns: &[String],
    threshold: f64,
    work_dir: &Path,
) -> Result<CsvTable> {
    prepare_addresses(&mut table, columns)?;
    let output = run_geocoder(runner, workspace, containers, &table, threshold, work_dir)?;
    let geocoded = CsvTable::read(&output)?;
    if geocoded.len() != table.len() {
        warn!(
            sent = table.len(),
            received = geocoded.len(),
            "geocoder returned a different row count"
        );
    }
    Ok(geocoded)
}

/// The geocoder and census stages bound to one runner and workspace.
#[derive(Clone, Copy)]
pub struct Stages<'a> {
    pub runner: &'a dyn ContainerRunner,
    pub workspace: &'a Workspace,
    pub containers: &'a ContainerConfig,
}

impl<'a> Stages<'a> {
    pub fn geocode(&self, table: CsvTable, columns: &[String], threshold: f64, work_dir: &Path) -> Result<CsvTable> {
        geocode_table(self.runner, self.workspace, self.containers, table, columns, threshold, work_dir)
    }

    pub fn attach_fips(&self, table: &CsvTable, date_column: &str, work_dir: &Path) -> Result<Option<CsvTable>> {
        census::attach_fips(self.runner, self.workspace, self.containers, table, date_column, work_dir)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::container::ContainerInvocation;

    /// Geocoder and census stand-ins behind one runner, told apart by image.
    pub fn fake_containers(inv: &ContainerInvocation, input: &Path) -> Result<()> {
        if inv.image.contains("census_block_group") {
            census::testing::fake_census(inv, input)
        } else {
            fake_geocoder(inv, input)
        }
    }

    /// Geocoder stand-in: copies the input and appends fixed match columns.
    /// Rows whose address contains "Nowhere" get no coordinates.
    pub fn fake_geocoder(inv: &ContainerInvocation, input: &Path) -> Result<()> {
        let table = CsvTable::read(input)?;
        let mut headers = table.headers.clone();
        for h in [
            "matched_street",
            "matched_zip",
            "matched_city",
            "matched_state",
            "lat",
            "lon",
            "score",
            "precision",
            "geocode_result",
        ] {
            headers.push(h.to_string());
        }
        let mut out = CsvTable::new(headers);
        let addr = table.require_column("address")?;
        for row in &table.rows {
            let mut r = row.clone();
            if row[addr].contains("Nowhere") {
                r.extend(["", "", "", "", "", "", "", "", "imprecise_geocode"].map(String::from));
            } else {
                r.extend(
                    ["Main St", "30309", "Atlanta", "GA", "33.79", "-84.39", "0.95", "range", "geocoded"]
                        .map(String::from),
                );
            }
            out.push_row(r);
        }
        let image = crate::container::ImageRef::new("ghcr.io/degauss-org/geocoder", "3.3.0");
        out.write(image.output_path(input, &format!("score_threshold_{}", inv.args[1])))
    }
}
