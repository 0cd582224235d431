use anyhow::{Context, Result};
use std::{
    fs::{self, File},
    path::Path,
    sync::Mutex,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install the global subscriber: `RUST_LOG` when set, else `info` (or
/// `debug` with `debug = true`). Events go to stderr and, when `log_file` is
/// given, also to that file without ANSI colours.
pub fn init(debug: bool, log_file: Option<&Path>) -> Result<()> {
    let default = if debug { "debug" } else { "info" };
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(fmt::format::FmtSpan::CLOSE);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = File::create(path)
                .with_context(|| format!("creating log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env)
        .with(stderr)
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}
