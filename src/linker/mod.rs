// src/linker/mod.rs
use anyhow::Result;
use chrono::{Datelike, NaiveDateTime};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, error, info, warn};

use crate::config::LinkageConfig;
use crate::geocode::census::normalize_fips;
use crate::table::{dates::parse_datetime, CsvTable};
use crate::warehouse::{SourceTable, VariableSource, EFFECTIVE_END, EFFECTIVE_START, GEOCODE};

pub mod join;

pub const FIPS: &str = "FIPS";
pub const YEAR: &str = "year";

/// Linked records plus the index metadata of every source that took part.
#[derive(Debug, Clone, PartialEq)]
pub struct Linkage {
    pub table: CsvTable,
    /// De-duplicated index rows tagged with `source_table`; `None` when no
    /// source had index rows.
    pub index: Option<CsvTable>,
}

/// Joins records carrying a FIPS code and a date to every warehouse variable
/// row valid for that geography around that date.
pub struct TemporalLinker<'a> {
    source: &'a dyn VariableSource,
    cfg: LinkageConfig,
}

/// One year's records and their date range.
struct YearGroup {
    table: CsvTable,
    min: NaiveDateTime,
    max: NaiveDateTime,
    fips: Vec<String>,
}

impl<'a> TemporalLinker<'a> {
    pub fn new(source: &'a dyn VariableSource, cfg: LinkageConfig) -> Self {
        Self { source, cfg }
    }

    /// Parse dates, write the clipped `year`, rename and normalize the FIPS
    /// column. Rows without a usable date are dropped.
    fn prepare(&self, table: &CsvTable) -> Result<(CsvTable, Vec<NaiveDateTime>)> {
        let date_idx = table.require_column(&self.cfg.date_column)?;
        let mut prepared = CsvTable::new(table.headers.clone());
        let mut dates = Vec::with_capacity(table.len());
        for row in &table.rows {
            if let Some(dt) = parse_datetime(&row[date_idx]) {
                prepared.push_row(row.clone());
                dates.push(dt);
            }
        }
        let dropped = table.len() - prepared.len();
        if dropped > 0 {
            warn!(
                dropped,
                column = %self.cfg.date_column,
                "records with unparseable dates left out of the linkage"
            );
        }

        let years = dates
            .iter()
            .map(|d| d.year().clamp(self.cfg.year_min, self.cfg.year_max).to_string())
            .collect();
        prepared.set_column(YEAR, years)?;

        if self.cfg.fips_column != FIPS {
            prepared.require_column(&self.cfg.fips_column)?;
            prepared.drop_columns(&[FIPS]);
            prepared.rename_columns(&[(self.cfg.fips_column.as_str(), FIPS)]);
        }
        let fips_idx = prepared.require_column(FIPS)?;
        let fips = prepared.column_values(fips_idx).map(normalize_fips).collect();
        prepared.set_column(FIPS, fips)?;
        Ok((prepared, dates))
    }

    fn groups(table: &CsvTable, dates: &[NaiveDateTime]) -> Result<BTreeMap<i32, YearGroup>> {
        let year_idx = table.require_column(YEAR)?;
        let fips_idx = table.require_column(FIPS)?;
        let mut members: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
        for (i, row) in table.rows.iter().enumerate() {
            let year: i32 = row[year_idx].parse()?;
            members.entry(year).or_default().push(i);
        }

        let mut groups = BTreeMap::new();
        for (year, idx) in members {
            let rows: Vec<Vec<String>> = idx.iter().map(|&i| table.rows[i].clone()).collect();
            let fips: BTreeSet<String> = rows
                .iter()
                .map(|r| r[fips_idx].clone())
                .filter(|f| !f.is_empty())
                .collect();
            let (mut min, mut max) = (dates[idx[0]], dates[idx[0]]);
            for &i in &idx {
                min = min.min(dates[i]);
                max = max.max(dates[i]);
            }
            groups.insert(
                year,
                YearGroup {
                    table: CsvTable {
                        headers: table.headers.clone(),
                        rows,
                    },
                    min,
                    max,
                    fips: fips.into_iter().collect(),
                },
            );
        }
        Ok(groups)
    }

    /// Variable rows of `source` for the group's tracts whose interval
    /// overlaps the group's date range. `None` when nothing remains.
    fn matching_rows(&self, source: &SourceTable, group: &YearGroup) -> Result<Option<CsvTable>> {
        let rows = self.source.variable_rows(source, &group.fips)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let geocode = rows.require_column(GEOCODE)?;
        let start = rows.require_column(EFFECTIVE_START)?;
        let end = rows.require_column(EFFECTIVE_END)?;
        let wanted: HashSet<&str> = group.fips.iter().map(String::as_str).collect();

        let filtered = rows.filter_rows(|r| {
            let overlaps = match (parse_datetime(&r[start]), parse_datetime(&r[end])) {
                (Some(s), Some(e)) => s <= group.max && e >= group.min,
                _ => false,
            };
            overlaps && wanted.contains(r[geocode].as_str())
        });
        Ok((!filtered.is_empty()).then_some(filtered))
    }

    /// Link every record of `table` to the warehouse.
    #[tracing::instrument(level = "info", skip(self, table), fields(rows = table.len()))]
    pub fn link(&self, table: &CsvTable) -> Result<Linkage> {
        let (prepared, dates) = self.prepare(table)?;
        let groups = Self::groups(&prepared, &dates)?;

        let mut index_cache: HashMap<SourceTable, Option<CsvTable>> = HashMap::new();
        let mut index_order: Vec<SourceTable> = Vec::new();
        let mut linked: Vec<CsvTable> = Vec::with_capacity(groups.len());

        for (year, mut group) in groups {
            debug!(year, tracts = group.fips.len(), "linking year group");
            let sources = match self.source.active_sources(year) {
                Ok(s) if s.is_empty() => {
                    warn!(year, "no data found in data source for year, group skipped");
                    continue;
                }
                Ok(s) => s,
                Err(e) => {
                    error!(year, "active source lookup failed, group skipped: {:#}", e);
                    continue;
                }
            };

            for source in &sources {
                if !index_cache.contains_key(source) {
                    let index = match self.source.index_table(source) {
                        Ok(t) if t.is_empty() => {
                            warn!(table = %source.index_name, "no data returned for index table");
                            None
                        }
                        Ok(mut t) => {
                            let tag = vec![source.index_name.clone(); t.len()];
                            t.set_column("source_table", tag)?;
                            Some(t)
                        }
                        Err(e) => {
                            error!(table = %source.index_name, "index table unavailable: {:#}", e);
                            None
                        }
                    };
                    index_cache.insert(source.clone(), index);
                    index_order.push(source.clone());
                }

                let variables = source.variables_table_name();
                match self.matching_rows(source, &group) {
                    Ok(Some(rows)) => {
                        info!(year, table = %variables, rows = rows.len(), "variables matched");
                        group.table = join::left_join(&group.table, &rows, FIPS, GEOCODE)?;
                        group.table.drop_columns(&[GEOCODE, EFFECTIVE_START, EFFECTIVE_END]);
                    }
                    Ok(None) => warn!(year, table = %variables, "no data returned, skipping"),
                    Err(e) => error!(year, table = %variables, "variables query failed, skipping: {:#}", e),
                }
            }
            linked.push(group.table);
        }

        let table = if linked.is_empty() {
            warn!("no year group produced output");
            CsvTable::new(prepared.headers.clone())
        } else {
            CsvTable::concat(linked)
        };

        let indexes: Vec<CsvTable> = index_order
            .iter()
            .filter_map(|s| index_cache.remove(s).flatten())
            .collect();
        let index = if indexes.is_empty() {
            None
        } else {
            let mut combined = CsvTable::concat(indexes);
            combined.dedup_rows();
            Some(combined)
        };

        info!(rows = table.len(), columns = table.headers.len(), "linkage complete");
        Ok(Linkage { table, index })
    }
}
