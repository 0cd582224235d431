// src/warehouse/mod.rs
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::config::WarehouseConfig;
use crate::table::CsvTable;

pub mod duck;
pub mod memory;

pub use duck::DuckWarehouse;
pub use memory::InMemoryWarehouse;

/// Columns every variables table must carry.
pub const GEOCODE: &str = "geocode";
pub const EFFECTIVE_START: &str = "effective_start_timestamp";
pub const EFFECTIVE_END: &str = "effective_end_timestamp";

/// One catalogued source, named by its index table (e.g. `acs_2019_index`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceTable {
    pub index_name: String,
}

impl SourceTable {
    pub fn new(index_name: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
        }
    }

    /// `acs_2019_index` → `acs_2019_variables`: the last six characters are
    /// replaced whatever they are.
    pub fn variables_table_name(&self) -> String {
        let stem = match self.index_name.char_indices().rev().nth(5) {
            Some((cut, _)) => &self.index_name[..cut],
            None => "",
        };
        format!("{}_variables", stem)
    }
}

/// Where the linker looks up SDoH variables.
pub trait VariableSource {
    /// Sources whose validity interval covers `year`.
    fn active_sources(&self, year: i32) -> Result<Vec<SourceTable>>;

    /// Metadata rows of the source's index table.
    fn index_table(&self, source: &SourceTable) -> Result<CsvTable>;

    /// Variable rows of the source restricted to the given geocodes.
    fn variable_rows(&self, source: &SourceTable, fips: &[String]) -> Result<CsvTable>;
}

/// The configured warehouse, one handle per worker.
pub enum Warehouse {
    Duck(DuckWarehouse),
    Memory(Arc<InMemoryWarehouse>),
}

impl Warehouse {
    /// Open the warehouse named by `cfg`: a DuckDB database takes precedence
    /// over a CSV directory. `None` when neither is set.
    pub fn open(cfg: &WarehouseConfig) -> Result<Option<Self>> {
        if let Some(db) = &cfg.database {
            info!(path = %db.display(), "opening DuckDB warehouse");
            return Ok(Some(Warehouse::Duck(DuckWarehouse::open(db, cfg)?)));
        }
        if let Some(dir) = &cfg.directory {
            info!(dir = %dir.display(), "loading CSV warehouse");
            let wh = InMemoryWarehouse::load_dir(dir, cfg)?;
            return Ok(Some(Warehouse::Memory(Arc::new(wh))));
        }
        Ok(None)
    }

    /// A handle that can move to another thread.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(match self {
            Warehouse::Duck(d) => Warehouse::Duck(d.try_clone()?),
            Warehouse::Memory(m) => Warehouse::Memory(Arc::clone(m)),
        })
    }
}

impl VariableSource for Warehouse {
    fn active_sources(&self, year: i32) -> Result<Vec<SourceTable>> {
        match self {
            Warehouse::Duck(d) => d.active_sources(year),
            Warehouse::Memory(m) => m.active_sources(year),
        }
    }

    fn index_table(&self, source: &SourceTable) -> Result<CsvTable> {
        match self {
            Warehouse::Duck(d) => d.index_table(source),
            Warehouse::Memory(m) => m.index_table(source),
        }
    }

    fn variable_rows(&self, source: &SourceTable, fips: &[String]) -> Result<CsvTable> {
        match self {
            Warehouse::Duck(d) => d.variable_rows(source, fips),
            Warehouse::Memory(m) => m.variable_rows(source, fips),
        }
    }
}
