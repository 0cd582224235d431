// src/mapper/mod.rs
use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

use crate::config::LinkageConfig;
use crate::geocode::{Stages, GEOCODER_DETAIL_COLUMNS, ROW_ID};
use crate::linker::{Linkage, TemporalLinker, FIPS};
use crate::table::CsvTable;
use crate::warehouse::VariableSource;

pub const FIPS_OUTPUT: &str = "SDoH_linkage_full.csv";
pub const DEGAUSS_OUTPUT: &str = "SDoH_linkage_Degauss_full.csv";
pub const INDEX_OUTPUT: &str = "combined_index_data.csv";

/// Files written by one mapper run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapperOutput {
    pub linked: PathBuf,
    pub index: Option<PathBuf>,
    pub rows: usize,
}

/// Rename `lat`/`lon`, drop `drop`, then write the linked table as
/// `out_dir/file_name` and the index rows as `out_dir/index_name`.
pub fn write_linkage(
    linkage: Linkage,
    out_dir: &Path,
    file_name: &str,
    index_name: &str,
    drop: &[&str],
) -> Result<MapperOutput> {
    fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    let Linkage { mut table, index } = linkage;

    let index = match index {
        Some(index) => {
            let path = out_dir.join(index_name);
            index.write(&path)?;
            info!(path = %path.display(), rows = index.len(), "index data written");
            Some(path)
        }
        None => None,
    };

    table.rename_columns(&[("lat", "latitude"), ("lon", "longitude")]);
    table.drop_columns(drop);
    let linked = out_dir.join(file_name);
    table.write(&linked)?;
    info!(path = %linked.display(), rows = table.len(), "linkage written");
    Ok(MapperOutput {
        linked,
        index,
        rows: table.len(),
    })
}

/// Link a CSV that already carries FIPS codes.
#[tracing::instrument(level = "info", skip(source, linkage))]
pub fn map_fips_file(
    source: &dyn VariableSource,
    linkage: &LinkageConfig,
    input: &Path,
    out_dir: &Path,
) -> Result<MapperOutput> {
    let table = CsvTable::read_input(input)?;
    let linked = TemporalLinker::new(source, linkage.clone()).link(&table)?;
    write_linkage(linked, out_dir, FIPS_OUTPUT, INDEX_OUTPUT, &[])
}

/// Resolve FIPS from coordinate columns, then link.
#[tracing::instrument(level = "info", skip(stages, source, linkage))]
pub fn map_latlong_file(
    stages: Stages<'_>,
    source: &dyn VariableSource,
    linkage: &LinkageConfig,
    input: &Path,
    lat_column: &str,
    lon_column: &str,
    out_dir: &Path,
) -> Result<MapperOutput> {
    let mut table = CsvTable::read_input(input)?;
    table.require_column(lat_column)?;
    table.require_column(lon_column)?;
    table.rename_columns(&[(lat_column, "latitude"), (lon_column, "longitude")]);
    fs::create_dir_all(out_dir)?;

    let Some(mut with_fips) = stages.attach_fips(&table, &linkage.date_column, out_dir)? else {
        anyhow::bail!("no FIPS could be resolved for {}", input.display());
    };
    with_fips.drop_columns(&[ROW_ID]);
    link_resolved(source, linkage, with_fips, out_dir, &[])
}

/// Geocode address columns, resolve FIPS, then link.
#[tracing::instrument(level = "info", skip(stages, source, linkage))]
pub fn map_address_file(
    stages: Stages<'_>,
    source: &dyn VariableSource,
    linkage: &LinkageConfig,
    input: &Path,
    columns: &[String],
    threshold: f64,
    out_dir: &Path,
) -> Result<MapperOutput> {
    let table = CsvTable::read_input(input)?;
    fs::create_dir_all(out_dir)?;
    let mut geocoded = stages.geocode(table, columns, threshold, out_dir)?;
    geocoded.drop_columns(&GEOCODER_DETAIL_COLUMNS[..4]);

    let Some(mut with_fips) = stages.attach_fips(&geocoded, &linkage.date_column, out_dir)? else {
        anyhow::bail!("no FIPS could be resolved for {}", input.display());
    };
    with_fips.drop_columns(&[ROW_ID]);
    link_resolved(
        source,
        linkage,
        with_fips,
        out_dir,
        &["score", "precision", "geocode_result"],
    )
}

fn link_resolved(
    source: &dyn VariableSource,
    linkage: &LinkageConfig,
    table: CsvTable,
    out_dir: &Path,
    drop: &[&str],
) -> Result<MapperOutput> {
    let missing = table
        .column_index(FIPS)
        .map(|i| table.column_values(i).filter(|f| f.is_empty()).count())
        .unwrap_or(0);
    if missing > 0 {
        warn!(missing, "rows without FIPS will carry no SDoH variables");
    }
    let cfg = LinkageConfig {
        fips_column: FIPS.to_string(),
        ..linkage.clone()
    };
    let linked = TemporalLinker::new(source, cfg).link(&table)?;
    write_linkage(linked, out_dir, DEGAUSS_OUTPUT, INDEX_OUTPUT, drop)
}
