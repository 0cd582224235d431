use anyhow::{Context, Result};
use duckdb::Connection;
use std::path::Path;
use tracing::debug;

use super::{SourceTable, VariableSource, GEOCODE};
use crate::config::WarehouseConfig;
use crate::duck::{open_disk_db, query_table, quote_ident, quote_literal};
use crate::table::CsvTable;

/// SDoH warehouse reached through DuckDB, either stored in the file itself
/// or attached by the init statements.
pub struct DuckWarehouse {
    conn: Connection,
    schema: String,
    boundary_type: String,
    geometry_flag: String,
}

impl DuckWarehouse {
    pub fn open(path: &Path, cfg: &WarehouseConfig) -> Result<Self> {
        let conn = open_disk_db(path, &cfg.init_sql)?;
        Ok(Self::from_connection(conn, cfg))
    }

    pub fn from_connection(conn: Connection, cfg: &WarehouseConfig) -> Self {
        Self {
            conn,
            schema: cfg.schema.clone(),
            boundary_type: cfg.boundary_type.clone(),
            geometry_flag: cfg.geometry_flag.clone(),
        }
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            conn: self.conn.try_clone().context("cloning warehouse connection")?,
            schema: self.schema.clone(),
            boundary_type: self.boundary_type.clone(),
            geometry_flag: self.geometry_flag.clone(),
        })
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }
}

impl VariableSource for DuckWarehouse {
    fn active_sources(&self, year: i32) -> Result<Vec<SourceTable>> {
        let sql = format!(
            "SELECT variables_index_name FROM {catalogue}
             WHERE EXTRACT(YEAR FROM CAST(effective_start_timestamp AS TIMESTAMP)) <= {year}
               AND EXTRACT(YEAR FROM CAST(effective_end_timestamp AS TIMESTAMP)) >= {year}
               AND CAST(boundary_type AS VARCHAR) = {boundary}
               AND CAST(geometry_y_n AS VARCHAR) = {geometry}
             ORDER BY variables_index_name",
            catalogue = self.qualified("data_source"),
            year = year,
            boundary = quote_literal(&self.boundary_type),
            geometry = quote_literal(&self.geometry_flag),
        );
        debug!(year, sql = %sql, "data source query");
        let table = query_table(&self.conn, &sql)
            .with_context(|| format!("querying active sources for {}", year))?;
        let mut names: Vec<&str> = table.column_values(0).filter(|n| !n.is_empty()).collect();
        names.sort_unstable();
        names.dedup();
        Ok(names.into_iter().map(SourceTable::new).collect())
    }

    fn index_table(&self, source: &SourceTable) -> Result<CsvTable> {
        let sql = format!("SELECT * FROM {}", self.qualified(&source.index_name));
        query_table(&self.conn, &sql).with_context(|| format!("reading index table {}", source.index_name))
    }

    fn variable_rows(&self, source: &SourceTable, fips: &[String]) -> Result<CsvTable> {
        let name = source.variables_table_name();
        if fips.is_empty() {
            return Ok(CsvTable::default());
        }
        let list = fips
            .iter()
            .map(|f| quote_literal(f))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT * FROM {} WHERE CAST({} AS VARCHAR) IN ({})",
            self.qualified(&name),
            quote_ident(GEOCODE),
            list
        );
        query_table(&self.conn, &sql).with_context(|| format!("reading variables table {}", name))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::duck::open_mem_db;

    /// Two tract-level sources (2015-2019 and 2020-2023) plus one county
    /// source that must never be picked.
    pub fn warehouse_connection() -> Result<Connection> {
        let conn = open_mem_db(&["CREATE SCHEMA data".to_string()])?;
        conn.execute_batch(
            r#"
            CREATE TABLE data.data_source(
                variables_index_name VARCHAR,
                effective_start_timestamp TIMESTAMP,
                effective_end_timestamp TIMESTAMP,
                boundary_type VARCHAR,
                geometry_y_n INTEGER);
            INSERT INTO data.data_source VALUES
                ('acs_2015_index', '2015-01-01', '2019-12-31', 'Census tract', 0),
                ('acs_2020_index', '2020-01-01', '2023-12-31', 'Census tract', 0),
                ('cnty_2015_index', '2015-01-01', '2023-12-31', 'County', 0);

            CREATE TABLE data.acs_2015_index(variable_name VARCHAR, description VARCHAR);
            INSERT INTO data.acs_2015_index VALUES ('pov', 'Poverty rate'), ('inc', 'Median income');
            CREATE TABLE data.acs_2020_index(variable_name VARCHAR, description VARCHAR);
            INSERT INTO data.acs_2020_index VALUES ('pov', 'Poverty rate');

            CREATE TABLE data.acs_2015_variables(
                geocode VARCHAR, effective_start_timestamp TIMESTAMP,
                effective_end_timestamp TIMESTAMP, pov DOUBLE, inc INTEGER);
            INSERT INTO data.acs_2015_variables VALUES
                ('13121001100', '2015-01-01', '2017-12-31', 0.21, 41000),
                ('13121001100', '2018-01-01', '2019-12-31', 0.18, 45000),
                ('13121001200', '2015-01-01', '2019-12-31', 0.09, 88000);

            CREATE TABLE data.acs_2020_variables(
                geocode VARCHAR, effective_start_timestamp TIMESTAMP,
                effective_end_timestamp TIMESTAMP, pov DOUBLE);
            INSERT INTO data.acs_2020_variables VALUES
                ('13121001100', '2020-01-01', '2023-12-31', 0.15);
            "#,
        )?;
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::warehouse_connection;
    use super::*;

    fn warehouse() -> Result<DuckWarehouse> {
        Ok(DuckWarehouse::from_connection(warehouse_connection()?, &WarehouseConfig::default()))
    }

    #[test]
    fn active_sources_follow_catalogue() -> Result<()> {
        let wh = warehouse()?;
        assert_eq!(wh.active_sources(2017)?, vec![SourceTable::new("acs_2015_index")]);
        assert_eq!(wh.active_sources(2021)?, vec![SourceTable::new("acs_2020_index")]);
        assert!(wh.active_sources(2012)?.is_empty());
        Ok(())
    }

    #[test]
    fn variable_rows_restricted_to_fips() -> Result<()> {
        let wh = warehouse()?;
        let src = SourceTable::new("acs_2015_index");
        let rows = wh.variable_rows(&src, &["13121001200".to_string()])?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.get(0, "inc"), Some("88000"));
        assert_eq!(rows.get(0, "effective_start_timestamp"), Some("2015-01-01 00:00:00"));
        assert!(wh.variable_rows(&src, &[])?.is_empty());
        Ok(())
    }

    #[test]
    fn missing_table_is_an_error() -> Result<()> {
        let wh = warehouse()?;
        let err = wh.index_table(&SourceTable::new("nope_index")).unwrap_err();
        assert!(format!("{:#}", err).contains("nope_index"));
        Ok(())
    }
}
