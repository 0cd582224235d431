use anyhow::{anyhow, Context, Result};
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::Path,
};
use tracing::{debug, info};

use super::{SourceTable, VariableSource, EFFECTIVE_END, EFFECTIVE_START, GEOCODE};
use crate::config::WarehouseConfig;
use crate::table::{dates::parse_year, CsvTable};

const CATALOGUE: &str = "data_source";

/// Warehouse held entirely in memory: the `data_source` catalogue plus every
/// index and variables table, keyed by table name.
#[derive(Debug, Clone)]
pub struct InMemoryWarehouse {
    catalogue: CsvTable,
    tables: HashMap<String, CsvTable>,
    boundary_type: String,
    geometry_flag: String,
}

impl InMemoryWarehouse {
    pub fn new(catalogue: CsvTable, cfg: &WarehouseConfig) -> Result<Self> {
        for col in [
            "variables_index_name",
            EFFECTIVE_START,
            EFFECTIVE_END,
            "boundary_type",
            "geometry_y_n",
        ] {
            catalogue.require_column(col)?;
        }
        Ok(Self {
            catalogue,
            tables: HashMap::new(),
            boundary_type: cfg.boundary_type.clone(),
            geometry_flag: cfg.geometry_flag.clone(),
        })
    }

    pub fn insert_table(&mut self, name: impl Into<String>, table: CsvTable) {
        self.tables.insert(name.into(), table);
    }

    /// Load `data_source.csv` and every other `<table>.csv` found in `dir`.
    pub fn load_dir(dir: &Path, cfg: &WarehouseConfig) -> Result<Self> {
        let catalogue = CsvTable::read(dir.join(format!("{}.csv", CATALOGUE)))
            .with_context(|| format!("reading warehouse catalogue in {}", dir.display()))?;
        let mut wh = Self::new(catalogue, cfg)?;

        for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem == CATALOGUE {
                continue;
            }
            let table = CsvTable::read(&path)?;
            debug!(table = stem, rows = table.len(), "warehouse table loaded");
            wh.insert_table(stem, table);
        }
        info!(tables = wh.tables.len(), sources = wh.catalogue.len(), "CSV warehouse ready");
        Ok(wh)
    }

    fn table(&self, name: &str) -> Result<&CsvTable> {
        self.tables
            .get(name)
            .ok_or_else(|| anyhow!("warehouse table `{}` does not exist", name))
    }
}

/// `"0"`, `"0.0"` and `" 0 "` all compare equal to the flag `"0"`.
fn flag_matches(value: &str, flag: &str) -> bool {
    let v = value.trim();
    let v = v.strip_suffix(".0").unwrap_or(v);
    v == flag.trim()
}

impl VariableSource for InMemoryWarehouse {
    fn active_sources(&self, year: i32) -> Result<Vec<SourceTable>> {
        let name = self.catalogue.require_column("variables_index_name")?;
        let start = self.catalogue.require_column(EFFECTIVE_START)?;
        let end = self.catalogue.require_column(EFFECTIVE_END)?;
        let boundary = self.catalogue.require_column("boundary_type")?;
        let geometry = self.catalogue.require_column("geometry_y_n")?;

        let mut names: Vec<&str> = self
            .catalogue
            .rows
            .iter()
            .filter(|r| {
                let covers = matches!(
                    (parse_year(&r[start]), parse_year(&r[end])),
                    (Some(s), Some(e)) if s <= year && year <= e
                );
                covers
                    && r[boundary].trim() == self.boundary_type
                    && flag_matches(&r[geometry], &self.geometry_flag)
            })
            .map(|r| r[name].as_str())
            .filter(|n| !n.is_empty())
            .collect();
        names.sort_unstable();
        names.dedup();
        Ok(names.into_iter().map(SourceTable::new).collect())
    }

    fn index_table(&self, source: &SourceTable) -> Result<CsvTable> {
        self.table(&source.index_name).cloned()
    }

    fn variable_rows(&self, source: &SourceTable, fips: &[String]) -> Result<CsvTable> {
        let table = self.table(&source.variables_table_name())?;
        let geocode = table.require_column(GEOCODE)?;
        let wanted: HashSet<&str> = fips.iter().map(String::as_str).collect();
        Ok(table.filter_rows(|r| wanted.contains(r[geocode].as_str())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_warehouse(dir: &Path) -> Result<()> {
        CsvTable::from_rows(
            &[
                "variables_index_name",
                "effective_start_timestamp",
                "effective_end_timestamp",
                "boundary_type",
                "geometry_y_n",
            ],
            &[
                &["svi_2018_index", "2018-01-01", "2020-12-31", "Census tract", "0.0"],
                &["svi_geo_index", "2018-01-01", "2020-12-31", "Census tract", "1"],
            ],
        )
        .write(dir.join("data_source.csv"))?;
        CsvTable::from_rows(&["variable_name"], &[&["rpl_themes"]]).write(dir.join("svi_2018_index.csv"))?;
        CsvTable::from_rows(
            &["geocode", "effective_start_timestamp", "effective_end_timestamp", "rpl_themes"],
            &[
                &["01001020100", "2018-01-01", "2020-12-31", "0.43"],
                &["01001020200", "2018-01-01", "2020-12-31", "0.61"],
            ],
        )
        .write(dir.join("svi_2018_variables.csv"))?;
        Ok(())
    }

    #[test]
    fn loads_directory_and_filters() -> Result<()> {
        let dir = tempdir()?;
        write_warehouse(dir.path())?;
        let wh = InMemoryWarehouse::load_dir(dir.path(), &WarehouseConfig::default())?;

        let active = wh.active_sources(2019)?;
        assert_eq!(active, vec![SourceTable::new("svi_2018_index")]);
        assert!(wh.active_sources(2021)?.is_empty());

        let rows = wh.variable_rows(&active[0], &["01001020200".to_string()])?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.get(0, "rpl_themes"), Some("0.61"));
        assert_eq!(wh.index_table(&active[0])?.len(), 1);
        Ok(())
    }

    #[test]
    fn catalogue_must_have_required_columns() {
        let cat = CsvTable::from_rows(&["variables_index_name"], &[&["x_index"]]);
        assert!(InMemoryWarehouse::new(cat, &WarehouseConfig::default()).is_err());
    }
}
