// src/pipeline/mod.rs
use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use futures::future::join_all;
use glob::glob;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::container::{ContainerRunner, Workspace};
use crate::duck::open_disk_db;
use crate::extract::{export_location_history, extract_all, Category};
use crate::geocode::{add_row_ids, finalize_coordinates, flag::flag_geocode_results, Stages, ROW_ID};
use crate::history::{FileEvent, LedgerEntry, RunLedger};
use crate::linker::TemporalLinker;
use crate::location::create_location_csv;
use crate::mapper::write_linkage;
use crate::package::{move_archives, remove_subdirectories, restore_archives, zip_files};
use crate::table::CsvTable;
use crate::warehouse::Warehouse;

/// Categories in processing order.
pub const PROCESS_ORDER: [Category; 3] = [Category::Invalid, Category::Address, Category::Latlong];

/// Directory layout of one run.
#[derive(Debug, Clone)]
pub struct RunLayout {
    pub base: PathBuf,
    pub data_dir: PathBuf,
    pub result_dir: PathBuf,
    pub log_file: PathBuf,
    pub ledger_dir: PathBuf,
}

impl RunLayout {
    /// `<output_root>/output_<timestamp>/…`
    pub fn new(output_root: &Path, timestamp: &str) -> Self {
        Self::at(output_root.join(format!("output_{}", timestamp)), timestamp)
    }

    /// Layout rooted at an existing (or chosen) run directory.
    pub fn at(base: PathBuf, timestamp: &str) -> Self {
        let result_dir = base.join("OMOP_FIPS_result");
        Self {
            data_dir: base.join("OMOP_data"),
            log_file: result_dir.join(format!("OMOP_to_FIPS_{}.log", timestamp)),
            ledger_dir: base.join("ledger"),
            result_dir,
            base,
        }
    }

    pub fn create(&self) -> Result<()> {
        for d in [&self.base, &self.data_dir, &self.result_dir, &self.ledger_dir] {
            fs::create_dir_all(d).with_context(|| format!("creating {}", d.display()))?;
        }
        Ok(())
    }
}

pub fn timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Reuse this extraction instead of querying the clinical database.
    pub data_dir: Option<PathBuf>,
    /// Continue a previous run: no extraction, files already processed are skipped.
    pub resume: bool,
}

/// Everything a file worker needs, shared read-only between workers.
pub struct FileContext {
    pub runner: Arc<dyn ContainerRunner>,
    pub workspace: Workspace,
    pub config: Config,
    pub hospitals: HashSet<String>,
}

impl FileContext {
    pub fn new(config: Config, runner: Arc<dyn ContainerRunner>) -> Result<Self> {
        let workspace = Workspace::from_config(&config.containers)?;
        let hospitals = config.geocoder.hospital_set();
        Ok(Self {
            runner,
            workspace,
            config,
            hospitals,
        })
    }

    pub fn stages(&self) -> Stages<'_> {
        Stages {
            runner: self.runner.as_ref(),
            workspace: &self.workspace,
            containers: &self.config.containers,
        }
    }
}

/// What one batch file produced.
#[derive(Debug, Clone, Default)]
pub struct FileOutcome {
    pub rows: usize,
    pub coordinates: Option<PathBuf>,
    pub fips: Option<PathBuf>,
    pub linked: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CategorySummary {
    pub process_type: String,
    pub files: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub linked: usize,
    pub rows: usize,
    pub archives: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub base_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Batch files written per process type.
    pub extracted: BTreeMap<String, usize>,
    pub location_history: Option<PathBuf>,
    pub categories: Vec<CategorySummary>,
    pub location_csv: Option<PathBuf>,
    pub archives: Vec<PathBuf>,
}

fn file_stem(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .with_context(|| format!("{} has no usable file name", path.display()))
}

/// Run one extracted batch through its category's stages, writing into
/// `out_dir` (the category folder of the result directory).
pub fn process_single_file(
    ctx: &FileContext,
    warehouse: Option<&Warehouse>,
    path: &Path,
    category: Category,
    out_dir: &Path,
) -> Result<FileOutcome> {
    let base = file_stem(path)?;
    info!(path = %path.display(), "processing file");
    let mut outcome = FileOutcome::default();

    if category == Category::Invalid {
        fs::create_dir_all(out_dir)?;
        let dst = out_dir.join(format!("{}_invalid.csv", base));
        fs::copy(path, &dst).with_context(|| format!("copying {} to {}", path.display(), dst.display()))?;
        outcome.rows = CsvTable::read(&dst)?.len();
        info!(path = %dst.display(), "invalid file copied; rows without address or coordinates cannot be linked");
        return Ok(outcome);
    }

    let work_dir = out_dir.join(&base);
    fs::create_dir_all(&work_dir).with_context(|| format!("creating {}", work_dir.display()))?;
    let mut table = CsvTable::read(path)?;
    outcome.rows = table.len();
    add_row_ids(&mut table)?;

    let geo = &ctx.config.geocoder;
    let stages = ctx.stages();
    let located = match category {
        Category::Address => {
            let original = table.clone();
            let mut geocoded = stages.geocode(table, &geo.address_columns, geo.threshold, &work_dir)?;
            if geo.flag_results {
                flag_geocode_results(&mut geocoded, &original, &geo.address_columns[0], &ctx.hospitals)?;
            }
            let mut coords = geocoded.clone();
            finalize_coordinates(&mut coords);
            coords.drop_columns(&[ROW_ID]);
            let coords_path = work_dir.join(format!("{}_with_coordinates.csv", base));
            coords.write(&coords_path)?;
            info!(path = %coords_path.display(), "coordinates file generated");
            outcome.coordinates = Some(coords_path);
            geocoded
        }
        _ => table,
    };

    let Some(mut with_fips) = stages.attach_fips(&located, &geo.date_column, &work_dir)? else {
        warn!(file = %base, "no FIPS file generated");
        return Ok(outcome);
    };
    with_fips.drop_columns(&[ROW_ID]);
    let fips_path = work_dir.join(format!("{}_with_fips.csv", base));
    with_fips.write(&fips_path)?;
    info!(path = %fips_path.display(), rows = with_fips.len(), "FIPS file generated");
    outcome.fips = Some(fips_path);

    if let (true, Some(wh)) = (ctx.config.linkage.enabled, warehouse) {
        let linked = TemporalLinker::new(wh, ctx.config.linkage.clone())
            .link(&with_fips)
            .and_then(|linkage| {
                write_linkage(
                    linkage,
                    &work_dir,
                    &format!("{}_linked_sdoh.csv", base),
                    &format!("{}_index_data.csv", base),
                    &[],
                )
            });
        match linked {
            Ok(out) => outcome.linked = Some(out.linked),
            Err(e) => error!(file = %base, "SDoH linkage failed: {:#}", e),
        }
    }
    Ok(outcome)
}

/// Outputs a previous run left for `path`, used when it is skipped on resume.
fn existing_outputs(out_dir: &Path, path: &Path) -> Result<FileOutcome> {
    let base = file_stem(path)?;
    let work_dir = out_dir.join(&base);
    let existing = |suffix: &str| {
        let p = work_dir.join(format!("{}_{}.csv", base, suffix));
        p.exists().then_some(p)
    };
    Ok(FileOutcome {
        rows: 0,
        coordinates: existing("with_coordinates"),
        fips: existing("with_fips"),
        linked: existing("linked_sdoh"),
    })
}

/// Process every batch file of one category directory on a pool of
/// `max_workers` blocking workers, then zip the coordinate and FIPS files.
#[tracing::instrument(level = "info", skip_all, fields(process_type = category.process_type()))]
pub async fn process_directory(
    ctx: Arc<FileContext>,
    warehouse: Option<&Warehouse>,
    ledger: Option<&RunLedger>,
    skip: &HashSet<String>,
    input_dir: &Path,
    result_dir: &Path,
    category: Category,
) -> Result<CategorySummary> {
    let process_type = category.process_type();
    let out_dir = result_dir.join(process_type);
    fs::create_dir_all(&out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    info!(dir = %input_dir.display(), "starting processing");

    let mut files: Vec<PathBuf> = glob(&format!("{}/*.csv", input_dir.display()))?.collect::<Result<_, _>>()?;
    files.sort();
    let mut summary = CategorySummary {
        process_type: process_type.to_string(),
        files: files.len(),
        ..CategorySummary::default()
    };

    let mut coordinate_files = Vec::new();
    let mut fips_files = Vec::new();
    let sem = Arc::new(Semaphore::new(ctx.config.max_workers));
    let mut handles = Vec::with_capacity(files.len());

    for path in files {
        if skip.contains(&LedgerEntry::key_for(process_type, &path)) {
            info!(path = %path.display(), "already processed, skipping");
            let previous = existing_outputs(&out_dir, &path)?;
            coordinate_files.extend(previous.coordinates);
            fips_files.extend(previous.fips);
            summary.skipped += 1;
            continue;
        }
        let permit = Arc::clone(&sem)
            .acquire_owned()
            .await
            .context("worker pool closed")?;
        let ctx = Arc::clone(&ctx);
        let warehouse = warehouse.map(Warehouse::try_clone).transpose()?;
        let out_dir = out_dir.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let result = process_single_file(&ctx, warehouse.as_ref(), &path, category, &out_dir);
            (path, result)
        }));
    }

    for joined in join_all(handles).await {
        let (path, result) = joined.context("file worker panicked")?;
        let entry = match result {
            Ok(outcome) => {
                summary.processed += 1;
                summary.rows += outcome.rows;
                if outcome.linked.is_some() {
                    summary.linked += 1;
                }
                coordinate_files.extend(outcome.coordinates);
                fips_files.extend(outcome.fips);
                LedgerEntry::new(process_type, &path, FileEvent::Processed, outcome.rows as u64)
            }
            Err(e) => {
                summary.failed += 1;
                error!(path = %path.display(), "error processing file: {:#}", e);
                LedgerEntry::new(process_type, &path, FileEvent::Failed, 0)
            }
        };
        if let Some(ledger) = ledger {
            if let Err(e) = ledger.record(&entry) {
                warn!(key = %entry.key, "could not record ledger entry: {:#}", e);
            }
        }
    }

    coordinate_files.sort();
    fips_files.sort();
    let coords_zip = out_dir.join(format!("{}_with_coordinates.zip", process_type));
    summary.archives.extend(zip_files(&coordinate_files, &coords_zip)?);
    let fips_zip = out_dir.join(format!("{}_with_fips.zip", process_type));
    summary.archives.extend(zip_files(&fips_files, &fips_zip)?);

    info!(
        processed = summary.processed,
        failed = summary.failed,
        skipped = summary.skipped,
        "completed processing"
    );
    Ok(summary)
}

/// The whole OMOP run: extract, resolve every category, package.
pub async fn run(layout: &RunLayout, opts: &RunOptions, ctx: Arc<FileContext>) -> Result<RunSummary> {
    let started_at = Utc::now();
    layout.create()?;
    let config = &ctx.config;
    let mut summary = RunSummary {
        base_dir: layout.base.clone(),
        started_at,
        finished_at: started_at,
        extracted: BTreeMap::new(),
        location_history: None,
        categories: Vec::new(),
        location_csv: None,
        archives: Vec::new(),
    };

    // ─── 1) extraction ───────────────────────────────────────────────
    let data_dir = opts.data_dir.clone().unwrap_or_else(|| layout.data_dir.clone());
    if opts.data_dir.is_none() && !opts.resume {
        let db = config
            .extraction
            .database
            .as_deref()
            .context("extraction.database is not set; pass an existing OMOP_data directory instead")?;
        let conn = open_disk_db(db, &config.extraction.init_sql)?;
        for (category, files) in extract_all(&conn, &config.extraction, &data_dir).await? {
            summary
                .extracted
                .insert(category.process_type().to_string(), files.len());
        }

        // ─── 2) LOCATION_HISTORY ─────────────────────────────────────
        match export_location_history(&conn, &config.extraction, &layout.base) {
            Ok(path) => summary.location_history = path,
            Err(e) => error!("LOCATION_HISTORY export failed: {:#}", e),
        }
    } else {
        info!(dir = %data_dir.display(), "using existing extraction");
    }

    // ─── 3) per-category processing ─────────────────────────────────
    let warehouse = if config.linkage.enabled {
        let wh = Warehouse::open(&config.warehouse)?;
        if wh.is_none() {
            warn!("linkage enabled but no warehouse configured; skipping SDoH linkage");
        }
        wh
    } else {
        None
    };
    let ledger = RunLedger::new(&layout.ledger_dir)?;
    let done = if opts.resume {
        ledger.completed()?
    } else {
        HashSet::new()
    };
    if !done.is_empty() {
        info!(files = done.len(), "files already processed");
    }
    if opts.resume {
        restore_archives(&layout.base, &layout.result_dir)?;
    }

    for category in PROCESS_ORDER {
        let input = data_dir.join(category.dir_name());
        if !input.is_dir() {
            warn!(dir = %input.display(), "category directory missing, skipped");
            continue;
        }
        let category_summary = process_directory(
            Arc::clone(&ctx),
            warehouse.as_ref(),
            Some(&ledger),
            &done,
            &input,
            &layout.result_dir,
            category,
        )
        .await?;
        summary.categories.push(category_summary);
    }

    // ─── 4) LOCATION.csv ─────────────────────────────────────────────
    summary.location_csv = create_location_csv(&layout.result_dir, &layout.base)?;

    // ─── 5) archives & cleanup ───────────────────────────────────────
    summary.archives = move_archives(&layout.result_dir, &layout.base)?;
    if config.cleanup {
        remove_subdirectories(&layout.result_dir)?;
    }

    summary.finished_at = Utc::now();
    let summary_path = layout.base.join("run_summary.json");
    fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)
        .with_context(|| format!("writing {}", summary_path.display()))?;
    info!(path = %summary_path.display(), "run summary written");
    Ok(summary)
}
