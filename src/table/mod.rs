// src/table/mod.rs
use anyhow::{anyhow, Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use std::{
    collections::{HashMap, HashSet},
    fs::{self, File},
    io::{Read, Write},
    path::Path,
};
use tracing::trace;

pub mod dates;
pub mod excel;

/// A CSV file held in memory with every cell as text.
///
/// Codes such as FIPS tracts or zips are zero-padded, so nothing is ever
/// coerced to a number on the way in or out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsvTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl CsvTable {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    /// Build a table from string slices; handy for fixtures.
    pub fn from_rows(headers: &[&str], rows: &[&[&str]]) -> Self {
        let mut table = Self::new(headers.iter().map(|h| h.to_string()).collect());
        for row in rows {
            table.push_row(row.iter().map(|v| v.to_string()).collect());
        }
        table
    }

    #[tracing::instrument(level = "debug", skip(path), fields(path = %path.as_ref().display()))]
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)
            .with_context(|| format!("opening CSV {}", path.as_ref().display()))?;
        Self::from_reader(file)
            .with_context(|| format!("parsing CSV {}", path.as_ref().display()))
    }

    /// Read a mapper input: Excel workbooks (first sheet) by extension,
    /// CSV otherwise.
    pub fn read_input<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => excel::read_first_sheet(path),
            _ => Self::read(path),
        }
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let headers: Vec<String> = rdr
            .headers()
            .context("reading CSV header")?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect();

        let mut table = Self::new(headers);
        for (idx, record) in rdr.records().enumerate() {
            let record = record.with_context(|| format!("CSV parse error at record {}", idx))?;
            table.push_row(record.iter().map(str::to_string).collect());
        }
        trace!(rows = table.rows.len(), cols = table.headers.len(), "read table");
        Ok(table)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating directory {}", parent.display()))?;
            }
        }
        let file =
            File::create(path).with_context(|| format!("creating CSV {}", path.display()))?;
        self.to_writer(file)
            .with_context(|| format!("writing CSV {}", path.display()))
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = WriterBuilder::new().from_writer(writer);
        wtr.write_record(&self.headers)?;
        for row in &self.rows {
            wtr.write_record(row)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Append a row, padding or truncating it to the header width.
    pub fn push_row(&mut self, mut row: Vec<String>) {
        row.resize(self.headers.len(), String::new());
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| anyhow!("column `{}` not found (have: {:?})", name, self.headers))
    }

    pub fn get(&self, row: usize, name: &str) -> Option<&str> {
        let idx = self.column_index(name)?;
        self.rows.get(row).map(|r| r[idx].as_str())
    }

    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = &str> + '_ {
        self.rows.iter().map(move |r| r[idx].as_str())
    }

    /// Rename columns by `(from, to)` pairs; pairs whose source is absent are ignored.
    pub fn rename_columns(&mut self, pairs: &[(&str, &str)]) {
        for (from, to) in pairs {
            if let Some(idx) = self.column_index(from) {
                self.headers[idx] = to.to_string();
            }
        }
    }

    /// Drop the named columns that exist; missing names are ignored.
    pub fn drop_columns(&mut self, names: &[&str]) {
        let drop: HashSet<&str> = names.iter().copied().collect();
        let keep: Vec<usize> = (0..self.headers.len())
            .filter(|&i| !drop.contains(self.headers[i].as_str()))
            .collect();
        if keep.len() == self.headers.len() {
            return;
        }
        self.retain_columns(&keep);
    }

    fn retain_columns(&mut self, keep: &[usize]) {
        self.headers = keep.iter().map(|&i| self.headers[i].clone()).collect();
        for row in &mut self.rows {
            let mut old = std::mem::take(row);
            *row = keep.iter().map(|&i| std::mem::take(&mut old[i])).collect();
        }
    }

    /// Replace the column's values, appending the column when it is new.
    pub fn set_column(&mut self, name: &str, values: Vec<String>) -> Result<()> {
        if values.len() != self.rows.len() {
            return Err(anyhow!(
                "column `{}` has {} values for {} rows",
                name,
                values.len(),
                self.rows.len()
            ));
        }
        match self.column_index(name) {
            Some(idx) => {
                for (row, v) in self.rows.iter_mut().zip(values) {
                    row[idx] = v;
                }
            }
            None => {
                self.headers.push(name.to_string());
                for (row, v) in self.rows.iter_mut().zip(values) {
                    row.push(v);
                }
            }
        }
        Ok(())
    }

    /// Move the named column to the front.
    pub fn move_to_front(&mut self, name: &str) {
        if let Some(idx) = self.column_index(name) {
            if idx == 0 {
                return;
            }
            let h = self.headers.remove(idx);
            self.headers.insert(0, h);
            for row in &mut self.rows {
                let v = row.remove(idx);
                row.insert(0, v);
            }
        }
    }

    /// A new table with the same headers and only the rows matching `pred`.
    pub fn filter_rows(&self, pred: impl Fn(&[String]) -> bool) -> CsvTable {
        CsvTable {
            headers: self.headers.clone(),
            rows: self.rows.iter().filter(|r| pred(r)).cloned().collect(),
        }
    }

    /// A new table restricted to `columns`, in that order. Every column must exist.
    pub fn select(&self, columns: &[&str]) -> Result<CsvTable> {
        let idx: Vec<usize> = columns
            .iter()
            .map(|c| self.require_column(c))
            .collect::<Result<_>>()?;
        Ok(CsvTable {
            headers: columns.iter().map(|c| c.to_string()).collect(),
            rows: self
                .rows
                .iter()
                .map(|r| idx.iter().map(|&i| r[i].clone()).collect())
                .collect(),
        })
    }

    /// Remove exact duplicate rows, keeping the first occurrence.
    pub fn dedup_rows(&mut self) {
        let mut seen = HashSet::with_capacity(self.rows.len());
        self.rows.retain(|r| seen.insert(r.clone()));
    }

    /// Stack tables vertically. Headers are the union in first-seen order and
    /// cells a table does not have are left empty.
    pub fn concat<I: IntoIterator<Item = CsvTable>>(tables: I) -> CsvTable {
        let mut out = CsvTable::default();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for table in tables {
            let mapping: Vec<usize> = table
                .headers
                .iter()
                .map(|h| {
                    *positions.entry(h.clone()).or_insert_with(|| {
                        out.headers.push(h.clone());
                        out.headers.len() - 1
                    })
                })
                .collect();
            for row in &mut out.rows {
                row.resize(out.headers.len(), String::new());
            }
            for row in table.rows {
                let mut new_row = vec![String::new(); out.headers.len()];
                for (value, &target) in row.into_iter().zip(&mapping) {
                    new_row[target] = value;
                }
                out.rows.push(new_row);
            }
        }
        out
    }
}
