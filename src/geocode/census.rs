use anyhow::{bail, Context, Result};
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};
use tracing::{error, info, warn};

use super::ROW_ID;
use crate::config::ContainerConfig;
use crate::container::{ContainerRunner, Workspace};
use crate::table::{dates::parse_year, CsvTable};

/// Columns that must not reach the census resolver.
const CENSUS_DROP_COLUMNS: &[&str] = &[
    "matched_street",
    "matched_zip",
    "matched_city",
    "matched_state",
    "score",
    "precision",
    "address_1",
    "state",
    "city",
    "zip",
];

/// Census boundary release used for a given year.
pub fn vintage_for_year(year: i32) -> i32 {
    if year < 2020 {
        2010
    } else {
        2020
    }
}

/// Resolve census tracts for every row of `table` (which must carry `lat`,
/// `lon` and the row id) against one `vintage`. Returns the resolver output
/// with a `FIPS` column in place of the block-group and tract ids.
#[tracing::instrument(level = "info", skip(runner, workspace, containers, table, work_dir), fields(rows = table.len()))]
pub fn run_census_block_group(
    runner: &dyn ContainerRunner,
    workspace: &Workspace,
    containers: &ContainerConfig,
    table: &CsvTable,
    vintage: i32,
    work_dir: &Path,
) -> Result<CsvTable> {
    let mut input_table = table.clone();
    input_table.drop_columns(CENSUS_DROP_COLUMNS);
    let input = work_dir.join("preprocessed_2.csv");
    input_table.write(&input)?;

    let image = &containers.census_image;
    let invocation = workspace.invocation(image, &input, &[vintage.to_string()])?;
    runner
        .run(&invocation)
        .with_context(|| format!("resolving census tracts ({}) for {}", vintage, input.display()))?;

    let output = image.output_path(&input, &vintage.to_string());
    if !output.exists() {
        bail!("expected census output not found: {}", output.display());
    }
    info!(path = %output.display(), "census output generated");

    let mut resolved = CsvTable::read(&output)?;
    let tract_col = format!("census_tract_id_{}", vintage);
    let block_col = format!("census_block_group_id_{}", vintage);
    let tract_idx = resolved.require_column(&tract_col)?;
    let tracts: Vec<String> = resolved
        .column_values(tract_idx)
        .map(normalize_fips)
        .collect();
    resolved.set_column("FIPS", tracts)?;
    resolved.drop_columns(&[tract_col.as_str(), block_col.as_str()]);
    resolved.write(&output)?;
    Ok(resolved)
}

/// Strip a float-style suffix from a FIPS code: `"13121001100.0"` → `"13121001100"`.
pub fn normalize_fips(raw: &str) -> String {
    let raw = raw.trim();
    raw.split('.').next().unwrap_or(raw).to_string()
}

/// Attach a `FIPS` column to `table` by running the resolver once per
/// census vintage present in `date_column`.
///
/// Rows are matched back through the private row id, so the resolver may
/// reorder or drop rows. Rows whose year cannot be read, or whose vintage
/// failed, get an empty FIPS. Returns `None` when no vintage produced output.
pub fn attach_fips(
    runner: &dyn ContainerRunner,
    workspace: &Workspace,
    containers: &ContainerConfig,
    table: &CsvTable,
    date_column: &str,
    work_dir: &Path,
) -> Result<Option<CsvTable>> {
    let mut table = table.clone();
    table.rename_columns(&[("latitude", "lat"), ("longitude", "lon")]);
    if !table.has_column(ROW_ID) {
        super::add_row_ids(&mut table)?;
    }
    let rid_idx = table.require_column(ROW_ID)?;
    let date_idx = table.require_column(date_column)?;

    let mut by_vintage: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
    let mut undated = 0usize;
    for (i, row) in table.rows.iter().enumerate() {
        match parse_year(&row[date_idx]) {
            Some(year) => by_vintage.entry(vintage_for_year(year)).or_default().push(i),
            None => undated += 1,
        }
    }
    if undated > 0 {
        warn!(undated, column = date_column, "rows without a usable year get no FIPS");
    }
    if by_vintage.is_empty() {
        warn!("no data available for 2010 or 2020");
        return Ok(None);
    }

    let mut fips_by_rid: HashMap<String, String> = HashMap::new();
    let mut produced = false;
    for (vintage, rows) in &by_vintage {
        let subset = CsvTable {
            headers: table.headers.clone(),
            rows: rows.iter().map(|&i| table.rows[i].clone()).collect(),
        };
        match run_census_block_group(runner, workspace, containers, &subset, *vintage, work_dir) {
            Ok(resolved) => {
                produced = true;
                let rid = resolved.require_column(ROW_ID)?;
                let fips = resolved.require_column("FIPS")?;
                for row in &resolved.rows {
                    fips_by_rid.insert(row[rid].clone(), row[fips].clone());
                }
            }
            Err(e) => error!(vintage, "census resolution failed: {:#}", e),
        }
    }
    if !produced {
        error!("neither census vintage produced output");
        return Ok(None);
    }

    let fips: Vec<String> = table
        .rows
        .iter()
        .map(|r| fips_by_rid.get(&r[rid_idx]).cloned().unwrap_or_default())
        .collect();
    table.set_column("FIPS", fips)?;
    table.rename_columns(&[("lat", "latitude"), ("lon", "longitude")]);
    Ok(Some(table))
}


#[cfg(test)]
mod tests {
    use super::testing::fake_census;
    use super::*;
    use crate::container::testing::FakeRunner;
    use tempfile::tempdir;

    #[test]
    fn vintages() {
        assert_eq!(vintage_for_year(2012), 2010);
        assert_eq!(vintage_for_year(2019), 2010);
        assert_eq!(vintage_for_year(2020), 2020);
        assert_eq!(vintage_for_year(2023), 2020);
        assert_eq!(normalize_fips("13121001100.0"), "13121001100");
    }

    #[test]
    fn attach_fips_maps_back_by_row_id() -> Result<()> {
        let dir = tempdir()?;
        let runner = FakeRunner::new(fake_census);
        let containers = ContainerConfig::default();
        let workspace = Workspace::from_config(&containers)?;
        let table = CsvTable::from_rows(
            &["person_id", "visit_start_date", "latitude", "longitude", "zip"],
            &[
                &["1", "2021-06-01", "33.7", "-84.3", "30309"],
                &["2", "2015-03-01", "33.8", "-84.4", "30309"],
                &["3", "bad", "33.9", "-84.5", "30309"],
                &["4", "2019-12-31", "34.0", "-84.6", "30309"],
            ],
        );

        let out = attach_fips(&runner, &workspace, &containers, &table, "visit_start_date", dir.path())?
            .expect("fips attached");
        assert_eq!(runner.call_count(), 2);
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].args[1], "2010");
        assert_eq!(calls[1].args[1], "2020");
        drop(calls);

        let fips = out.require_column("FIPS")?;
        let got: Vec<&str> = out.column_values(fips).collect();
        assert_eq!(got, vec!["13121202000", "13121201001", "", "13121201003"]);
        assert!(out.has_column("latitude"));
        assert!(out.has_column("zip"));

        let sent = CsvTable::read(dir.path().join("preprocessed_2.csv"))?;
        assert!(!sent.has_column("zip"));
        Ok(())
    }

    #[test]
    fn failed_vintage_leaves_rows_empty() -> Result<()> {
        let dir = tempdir()?;
        let runner = FakeRunner::new(|inv: &crate::container::ContainerInvocation, input: &Path| {
            if inv.args[1] == "2020" {
                anyhow::bail!("boom")
            }
            fake_census(inv, input)
        });
        let containers = ContainerConfig::default();
        let workspace = Workspace::from_config(&containers)?;
        let table = CsvTable::from_rows(
            &["year", "lat", "lon"],
            &[&["2015", "1", "1"], &["2022", "1", "1"]],
        );
        let out = attach_fips(&runner, &workspace, &containers, &table, "year", dir.path())?
            .expect("2010 vintage succeeded");
        assert_eq!(out.get(0, "FIPS"), Some("13121201000"));
        assert_eq!(out.get(1, "FIPS"), Some(""));
        Ok(())
    }

    #[test]
    fn nothing_datable_yields_none() -> Result<()> {
        let dir = tempdir()?;
        let runner = FakeRunner::new(fake_census);
        let containers = ContainerConfig::default();
        let workspace = Workspace::from_config(&containers)?;
        let table = CsvTable::from_rows(&["year", "lat", "lon"], &[&["", "1", "1"]]);
        assert!(attach_fips(&runner, &workspace, &containers, &table, "year", dir.path())?.is_none());
        assert_eq!(runner.call_count(), 0);
        Ok(())
    }
}
