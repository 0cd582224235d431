// src/extract/mod.rs
use anyhow::{Context, Result};
use duckdb::Connection;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{error, info};

use crate::config::ExtractionConfig;
use crate::duck::{query_table, quote_ident};

pub mod queries;

/// The three partitions of extracted visits, by what location data they carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    /// Usable latitude/longitude.
    Latlong,
    /// No coordinates and no street address.
    Invalid,
    /// No coordinates but a street address to geocode.
    Address,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Latlong, Category::Invalid, Category::Address];

    /// Prefix of the batch files, e.g. `Latlong_1.csv`.
    pub fn label(self) -> &'static str {
        match self {
            Category::Latlong => "Latlong",
            Category::Invalid => "Invalid",
            Category::Address => "Address",
        }
    }

    /// Extraction sub-directory.
    pub fn dir_name(self) -> &'static str {
        match self {
            Category::Latlong => "valid_lat_long",
            Category::Invalid => "invalid_lat_lon_address",
            Category::Address => "valid_address",
        }
    }

    /// Result sub-directory and archive prefix.
    pub fn process_type(self) -> &'static str {
        match self {
            Category::Latlong => "latlong",
            Category::Invalid => "invalid",
            Category::Address => "address",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// SQL for `category`: the configured file when there is one, else the
/// built-in query.
pub fn category_sql(cfg: &ExtractionConfig, category: Category) -> Result<String> {
    match cfg.queries.get(&category) {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("reading {} query {}", category, path.display())),
        None => Ok(queries::category_query(&cfg.cdm_schema, category)),
    }
}

/// Page through `category` and write each non-empty page as
/// `<Label>_<n>.csv` under `out_dir/<dir_name>/`.
#[tracing::instrument(level = "info", skip(conn, cfg, out_dir), fields(category = %category))]
pub fn extract_category(
    conn: &Connection,
    cfg: &ExtractionConfig,
    category: Category,
    out_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let dir = out_dir.join(category.dir_name());
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let base = category_sql(cfg, category)?;

    let mut written = Vec::new();
    let mut offset = 0;
    let mut batch_number = 1;
    loop {
        if let Some(max) = cfg.max_batches {
            if batch_number > max {
                info!(max, "batch cap reached");
                break;
            }
        }
        let start = Instant::now();
        let page = query_table(conn, &queries::paged(&base, cfg.batch_size, offset))
            .with_context(|| format!("fetching {} batch {}", category, batch_number))?;
        if page.is_empty() {
            info!(batch_number, "no more rows");
            break;
        }

        let path = dir.join(format!("{}_{}.csv", category.label(), batch_number));
        page.write(&path)?;
        info!(batch_number, rows = page.len(), elapsed = ?start.elapsed(), "saved batch");
        written.push(path);

        if page.len() < cfg.batch_size {
            break;
        }
        offset += cfg.batch_size;
        batch_number += 1;
    }
    Ok(written)
}

/// Run all three category extractions at once, each on its own connection
/// clone. A failing category is logged and yields no files.
pub async fn extract_all(
    conn: &Connection,
    cfg: &ExtractionConfig,
    out_dir: &Path,
) -> Result<Vec<(Category, Vec<PathBuf>)>> {
    let mut handles = Vec::with_capacity(Category::ALL.len());
    for category in Category::ALL {
        let conn = conn
            .try_clone()
            .context("cloning clinical database connection")?;
        let cfg = cfg.clone();
        let out_dir = out_dir.to_path_buf();
        handles.push(tokio::task::spawn_blocking(move || {
            (category, extract_category(&conn, &cfg, category, &out_dir))
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for joined in futures::future::join_all(handles).await {
        let (category, outcome) = joined.context("extraction task panicked")?;
        match outcome {
            Ok(files) => {
                info!(%category, files = files.len(), "data extraction completed");
                results.push((category, files));
            }
            Err(e) => {
                error!(%category, "data extraction failed: {:#}", e);
                results.push((category, Vec::new()));
            }
        }
    }
    Ok(results)
}

/// Dump the location-history table as `LOCATION_HISTORY.csv` in `out_dir`.
pub fn export_location_history(conn: &Connection, cfg: &ExtractionConfig, out_dir: &Path) -> Result<Option<PathBuf>> {
    let Some(table) = cfg.location_history_table.as_deref() else {
        return Ok(None);
    };
    let qualified = table
        .split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".");
    let qualified = if table.contains('.') {
        qualified
    } else {
        format!("{}.{}", quote_ident(&cfg.cdm_schema), qualified)
    };
    let data = query_table(conn, &format!("SELECT * FROM {}", qualified))
        .with_context(|| format!("exporting {}", table))?;
    let path = out_dir.join("LOCATION_HISTORY.csv");
    data.write(&path)?;
    info!(path = %path.display(), rows = data.len(), "LOCATION_HISTORY.csv created");
    Ok(Some(path))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A small CDM: person 1 has coordinates, 2 only a street address,
    /// 3 nothing usable, 4 a visit outside their address interval,
    /// 5 a visit before 2012.
    pub fn cdm_connection() -> Result<Connection> {
        let conn = crate::duck::open_mem_db(&[])?;
        populate_cdm(&conn)?;
        Ok(conn)
    }

    pub fn populate_cdm(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE person(person_id INTEGER);
            CREATE TABLE visit_occurrence(visit_occurrence_id INTEGER, person_id INTEGER,
                                          visit_start_date DATE, visit_end_date DATE);
            CREATE TABLE location(location_id INTEGER, address_1 VARCHAR, address_2 VARCHAR,
                                  city VARCHAR, state VARCHAR, zip VARCHAR, county VARCHAR,
                                  location_source_value VARCHAR, country_concept_id INTEGER,
                                  country_source_value VARCHAR, latitude DOUBLE, longitude DOUBLE);
            CREATE TABLE location_history(location_id INTEGER, entity_id INTEGER,
                                          start_date DATE, end_date DATE);
            INSERT INTO person VALUES (1), (2), (3), (4), (5);
            INSERT INTO visit_occurrence VALUES
                (10, 1, DATE '2015-03-01', DATE '2015-03-02'),
                (11, 1, DATE '2021-06-01', DATE '2021-06-03'),
                (20, 2, DATE '2019-01-10', DATE '2019-01-11'),
                (30, 3, DATE '2018-05-05', DATE '2018-05-05'),
                (40, 4, DATE '2016-01-01', DATE '2016-01-02'),
                (50, 5, DATE '2011-12-01', DATE '2011-12-02');
            INSERT INTO location VALUES
                (100, NULL, NULL, 'Atlanta', 'GA', '30309', 'Fulton', NULL, 42046186, 'US', 33.79, -84.39),
                (200, '240 NW 25th St', NULL, 'Miami', 'FL', '33127', 'Miami-Dade', NULL, 42046186, 'US', NULL, NULL),
                (300, 'null', NULL, NULL, NULL, NULL, NULL, NULL, 42046186, 'US', 0, 0),
                (400, '1 Main St', NULL, 'Macon', 'GA', '31201', NULL, NULL, 42046186, 'US', 32.84, -83.63),
                (500, '2 Oak St', NULL, 'Athens', 'GA', '30601', NULL, NULL, 42046186, 'US', 33.95, -83.38);
            INSERT INTO location_history VALUES
                (100, 1, DATE '2010-01-01', DATE '2030-01-01'),
                (200, 2, DATE '2010-01-01', DATE '2030-01-01'),
                (300, 3, DATE '2010-01-01', DATE '2030-01-01'),
                (400, 4, DATE '2017-01-01', DATE '2030-01-01'),
                (500, 5, DATE '2010-01-01', DATE '2030-01-01');
            "#,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::cdm_connection;
    use super::*;
    use crate::table::CsvTable;
    use tempfile::tempdir;

    fn person_ids(path: &Path) -> Result<Vec<String>> {
        let table = CsvTable::read(path)?;
        let idx = table.require_column("person_id")?;
        Ok(table.column_values(idx).map(str::to_string).collect())
    }

    #[test]
    fn categories_split_visits_by_location_quality() -> Result<()> {
        let conn = cdm_connection()?;
        let dir = tempdir()?;
        let cfg = ExtractionConfig::default();

        let latlong = extract_category(&conn, &cfg, Category::Latlong, dir.path())?;
        let address = extract_category(&conn, &cfg, Category::Address, dir.path())?;
        let invalid = extract_category(&conn, &cfg, Category::Invalid, dir.path())?;

        assert_eq!(latlong, vec![dir.path().join("valid_lat_long/Latlong_1.csv")]);
        assert_eq!(person_ids(&latlong[0])?, vec!["1", "1"]);
        assert_eq!(person_ids(&address[0])?, vec!["2"]);
        assert_eq!(person_ids(&invalid[0])?, vec!["3"]);

        let table = CsvTable::read(&latlong[0])?;
        assert_eq!(table.get(0, "year"), Some("2015"));
        assert_eq!(table.get(0, "visit_start_date"), Some("2015-03-01"));
        Ok(())
    }

    #[test]
    fn pagination_writes_numbered_batches_and_honours_cap() -> Result<()> {
        let conn = cdm_connection()?;
        let dir = tempdir()?;
        let cfg = ExtractionConfig {
            batch_size: 1,
            ..ExtractionConfig::default()
        };
        let files = extract_category(&conn, &cfg, Category::Latlong, dir.path())?;
        assert_eq!(files.len(), 2);
        assert!(files[1].ends_with("Latlong_2.csv"));
        let first = CsvTable::read(&files[0])?;
        assert_eq!(first.get(0, "visit_occurrence_id"), Some("10"));

        let capped = ExtractionConfig {
            batch_size: 1,
            max_batches: Some(1),
            ..ExtractionConfig::default()
        };
        let dir2 = tempdir()?;
        assert_eq!(extract_category(&conn, &capped, Category::Latlong, dir2.path())?.len(), 1);
        Ok(())
    }

    #[test]
    fn same_day_visits_land_in_exactly_one_batch() -> Result<()> {
        let conn = cdm_connection()?;
        conn.execute_batch(
            "INSERT INTO visit_occurrence VALUES
                (12, 1, DATE '2015-03-01', DATE '2015-03-02'),
                (9, 1, DATE '2015-03-01', DATE '2015-03-01');",
        )?;
        let dir = tempdir()?;
        let cfg = ExtractionConfig {
            batch_size: 1,
            ..ExtractionConfig::default()
        };
        let files = extract_category(&conn, &cfg, Category::Latlong, dir.path())?;
        assert_eq!(files.len(), 4);
        let mut visits = Vec::new();
        for file in &files {
            let table = CsvTable::read(file)?;
            visits.push(table.get(0, "visit_occurrence_id").unwrap_or_default().to_string());
        }
        assert_eq!(visits, vec!["9", "10", "12", "11"]);
        Ok(())
    }

    #[test]
    fn custom_query_file_replaces_builtin() -> Result<()> {
        let conn = cdm_connection()?;
        let dir = tempdir()?;
        let sql = dir.path().join("latlong.sql");
        fs::write(
            &sql,
            "SELECT person_id, 1 AS visit_occurrence_id, DATE '2020-01-01' AS visit_start_date FROM person WHERE person_id = 5;",
        )?;
        let mut cfg = ExtractionConfig::default();
        cfg.queries.insert(Category::Latlong, sql);
        let files = extract_category(&conn, &cfg, Category::Latlong, dir.path())?;
        assert_eq!(person_ids(&files[0])?, vec!["5"]);
        Ok(())
    }

    #[tokio::test]
    async fn extract_all_runs_every_category() -> Result<()> {
        let conn = cdm_connection()?;
        let dir = tempdir()?;
        let results = extract_all(&conn, &ExtractionConfig::default(), dir.path()).await?;
        assert_eq!(results.len(), 3);
        for (category, files) in results {
            assert_eq!(files.len(), 1, "{}", category);
            assert!(files[0].starts_with(dir.path().join(category.dir_name())));
        }
        Ok(())
    }

    #[test]
    fn location_history_export() -> Result<()> {
        let conn = cdm_connection()?;
        let dir = tempdir()?;
        let path = export_location_history(&conn, &ExtractionConfig::default(), dir.path())?
            .expect("table configured");
        assert_eq!(CsvTable::read(path)?.len(), 5);

        let none = ExtractionConfig {
            location_history_table: None,
            ..ExtractionConfig::default()
        };
        assert!(export_location_history(&conn, &none, dir.path())?.is_none());
        Ok(())
    }
}
