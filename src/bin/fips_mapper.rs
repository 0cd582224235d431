use anyhow::{Context, Result};
use clap::Parser;
use sdoh_linkage::{config::Config, logging, mapper, warehouse::Warehouse};
use std::path::PathBuf;
use tracing::info;

/// Link a CSV that already carries FIPS codes to the SDoH variables valid
/// in each record's year.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Input CSV or Excel workbook.
    #[arg(short, long)]
    input: PathBuf,
    /// Date column used to pick the year.
    #[arg(short, long)]
    date: String,
    /// Column holding the FIPS codes.
    #[arg(short, long)]
    fips: String,
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Output folder.
    #[arg(short, long, default_value = "output")]
    out: PathBuf,
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.debug, None)?;

    let mut config = Config::load_or_default(args.config.as_deref())?;
    config.linkage.date_column = args.date;
    config.linkage.fips_column = args.fips;
    let warehouse = Warehouse::open(&config.warehouse)?
        .context("no warehouse configured: set warehouse.database or warehouse.directory")?;

    let out = mapper::map_fips_file(&warehouse, &config.linkage, &args.input, &args.out)?;
    info!(path = %out.linked.display(), rows = out.rows, "done");
    Ok(())
}
