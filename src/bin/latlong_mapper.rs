use anyhow::{Context, Result};
use clap::Parser;
use sdoh_linkage::{
    config::Config,
    container::{DockerRunner, Workspace},
    geocode::Stages,
    logging, mapper,
    warehouse::Warehouse,
};
use std::path::PathBuf;
use tracing::info;

/// Resolve census FIPS codes from coordinates, then link SDoH variables.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    #[arg(short, long)]
    input: PathBuf,
    #[arg(short, long)]
    date: String,
    #[arg(long, default_value = "latitude")]
    lat: String,
    #[arg(long = "long", default_value = "longitude")]
    lon: String,
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long, default_value = "output")]
    out: PathBuf,
    #[arg(long, env = "HOST_PWD")]
    host_root: Option<PathBuf>,
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.debug, None)?;

    let mut config = Config::load_or_default(args.config.as_deref())?;
    config.linkage.date_column = args.date;
    if args.host_root.is_some() {
        config.containers.host_root = args.host_root;
    }
    let warehouse = Warehouse::open(&config.warehouse)?
        .context("no warehouse configured: set warehouse.database or warehouse.directory")?;

    let runner = DockerRunner::new(config.containers.program.clone());
    let workspace = Workspace::from_config(&config.containers)?;
    let stages = Stages {
        runner: &runner,
        workspace: &workspace,
        containers: &config.containers,
    };
    let out = mapper::map_latlong_file(
        stages,
        &warehouse,
        &config.linkage,
        &args.input,
        &args.lat,
        &args.lon,
        &args.out,
    )?;
    info!(path = %out.linked.display(), rows = out.rows, "done");
    Ok(())
}
