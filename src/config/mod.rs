// src/config/mod.rs
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use crate::container::ImageRef;
use crate::extract::Category;

/// Everything a run needs. Loaded from YAML; every field has a default so a
/// config file only lists what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory that receives `output_<timestamp>/`.
    pub output_root: PathBuf,
    /// Files processed concurrently per category.
    pub max_workers: usize,
    /// Remove per-file work folders once archives and LOCATION.csv exist.
    pub cleanup: bool,
    pub extraction: ExtractionConfig,
    pub geocoder: GeocoderConfig,
    pub containers: ContainerConfig,
    pub warehouse: WarehouseConfig,
    pub linkage: LinkageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("."),
            max_workers: 2,
            cleanup: true,
            extraction: ExtractionConfig::default(),
            geocoder: GeocoderConfig::default(),
            containers: ContainerConfig::default(),
            warehouse: WarehouseConfig::default(),
            linkage: LinkageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// DuckDB file holding (or attaching) the OMOP CDM tables.
    pub database: Option<PathBuf>,
    /// Statements run right after opening, e.g. ATTACH of a remote database.
    pub init_sql: Vec<String>,
    /// Schema qualifying the CDM tables in the built-in queries.
    pub cdm_schema: String,
    /// Rows per batch file.
    pub batch_size: usize,
    /// Stop after this many batches per category.
    pub max_batches: Option<usize>,
    /// Replacement `.sql` files per category. Their result must carry
    /// `person_id`, `visit_start_date` and a unique `visit_occurrence_id`,
    /// which together order the pages.
    pub queries: BTreeMap<Category, PathBuf>,
    /// Table exported as LOCATION_HISTORY.csv; skipped when unset.
    pub location_history_table: Option<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            database: None,
            init_sql: Vec::new(),
            cdm_schema: "main".to_string(),
            batch_size: 100_000,
            max_batches: None,
            queries: BTreeMap::new(),
            location_history_table: Some("location_history".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocoderConfig {
    /// Minimum geocoder match score.
    pub threshold: f64,
    /// Address columns in street, city, state, zip order (or a single column).
    pub address_columns: Vec<String>,
    /// Column whose year selects the census vintage.
    pub date_column: String,
    /// Recompute geocode_result and add a reason column.
    pub flag_results: bool,
    /// Full normalized hospital addresses ("street city state zip", lower-case).
    pub hospital_addresses: Vec<String>,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            address_columns: ["address_1", "city", "state", "zip"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            date_column: "visit_start_date".to_string(),
            flag_results: true,
            hospital_addresses: Vec::new(),
        }
    }
}

impl GeocoderConfig {
    pub fn hospital_set(&self) -> HashSet<String> {
        self.hospital_addresses
            .iter()
            .map(|a| a.trim().to_lowercase())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container CLI, normally `docker`.
    pub program: String,
    /// Where the work folder is mounted inside the container.
    pub mount_point: String,
    /// Host path of the current directory when this process itself runs in
    /// a container (docker-in-docker). Mount sources are rewritten under it.
    pub host_root: Option<PathBuf>,
    pub geocoder_image: ImageRef,
    pub census_image: ImageRef,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            mount_point: "/workspace".to_string(),
            host_root: None,
            geocoder_image: ImageRef::new("ghcr.io/degauss-org/geocoder", "3.3.0"),
            census_image: ImageRef::new("ghcr.io/degauss-org/census_block_group", "0.6.0"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    /// DuckDB file with the SDoH catalogue and variable tables.
    pub database: Option<PathBuf>,
    /// Directory of CSV exports (data_source.csv + one file per table).
    pub directory: Option<PathBuf>,
    pub init_sql: Vec<String>,
    /// Schema holding `data_source` and the variable tables.
    pub schema: String,
    pub boundary_type: String,
    pub geometry_flag: String,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            database: None,
            directory: None,
            init_sql: Vec::new(),
            schema: "data".to_string(),
            boundary_type: "Census tract".to_string(),
            geometry_flag: "0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkageConfig {
    /// Link `<base>_with_fips.csv` outputs of the pipeline to the warehouse.
    pub enabled: bool,
    pub date_column: String,
    pub fips_column: String,
    pub year_min: i32,
    pub year_max: i32,
}

impl Default for LinkageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            date_column: "visit_start_date".to_string(),
            fips_column: "FIPS".to_string(),
            year_min: 2012,
            year_max: 2023,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` when given, else the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.max_workers > 0, "max_workers must be at least 1");
        anyhow::ensure!(
            self.extraction.batch_size > 0,
            "extraction.batch_size must be at least 1"
        );
        anyhow::ensure!(
            self.linkage.year_min <= self.linkage.year_max,
            "linkage.year_min ({}) is after linkage.year_max ({})",
            self.linkage.year_min,
            self.linkage.year_max
        );
        anyhow::ensure!(
            !self.geocoder.address_columns.is_empty(),
            "geocoder.address_columns must name at least one column"
        );
        Ok(())
    }
}
