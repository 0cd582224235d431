use anyhow::{Context, Result};
use clap::Parser;
use sdoh_linkage::{
    config::Config,
    container::{ContainerRunner, DockerRunner},
    logging,
    pipeline::{self, FileContext, RunLayout, RunOptions},
};
use std::{path::PathBuf, sync::Arc, time::Instant};
use tracing::{error, info};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Extract OMOP visits, resolve census FIPS codes and link SDoH variables"
)]
struct Args {
    /// YAML configuration; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Parent folder of the `output_<timestamp>` run directory.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Skip extraction and process batch files already in this folder.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
    /// Continue the run in this `output_<timestamp>` directory.
    #[arg(long, conflicts_with = "data_dir")]
    resume: Option<PathBuf>,
    /// Host path of the working directory, for docker-in-docker mounts.
    #[arg(long, env = "HOST_PWD")]
    host_root: Option<PathBuf>,
    #[arg(long)]
    max_workers: Option<usize>,
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ─── 1) configuration ────────────────────────────────────────────
    let mut config = Config::load_or_default(args.config.as_deref())?;
    if let Some(output) = args.output {
        config.output_root = output;
    }
    if let Some(n) = args.max_workers {
        config.max_workers = n;
    }
    if args.host_root.is_some() {
        config.containers.host_root = args.host_root;
    }
    config.validate()?;

    // ─── 2) run layout & logging ─────────────────────────────────────
    let ts = pipeline::timestamp();
    let layout = match &args.resume {
        Some(base) => RunLayout::at(base.clone(), &ts),
        None => RunLayout::new(&config.output_root, &ts),
    };
    layout.create()?;
    logging::init(args.debug, Some(&layout.log_file))?;
    info!(base = %layout.base.display(), log = %layout.log_file.display(), "startup");

    std::panic::set_hook(Box::new(|info| {
        eprintln!("panic: {:?}", info);
    }));

    // ─── 3) run ──────────────────────────────────────────────────────
    let runner: Arc<dyn ContainerRunner> = Arc::new(DockerRunner::new(config.containers.program.clone()));
    let ctx = Arc::new(FileContext::new(config, runner)?);
    let opts = RunOptions {
        data_dir: match &args.resume {
            Some(_) => Some(layout.data_dir.clone()),
            None => args.data_dir,
        },
        resume: args.resume.is_some(),
    };

    let start = Instant::now();
    let summary = pipeline::run(&layout, &opts, ctx)
        .await
        .inspect_err(|e| error!("run failed: {:#}", e))
        .context("OMOP to FIPS run failed")?;

    // ─── 4) report ───────────────────────────────────────────────────
    for c in &summary.categories {
        info!(
            process_type = %c.process_type,
            files = c.files,
            processed = c.processed,
            failed = c.failed,
            skipped = c.skipped,
            linked = c.linked,
            "category done"
        );
    }
    info!(
        elapsed_s = start.elapsed().as_secs_f64(),
        archives = summary.archives.len(),
        "all processing completed"
    );
    Ok(())
}
