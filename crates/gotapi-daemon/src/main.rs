//! GotAPI server entry point.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use gotapi_core::config::{Config, Directories};
use tracing::info;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// GotAPI server - local gateway between web apps and device plugins
#[derive(Parser, Debug)]
#[command(name = "gotapi-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file (defaults to `<config dir>/gotapi/config.json`)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override `gotapi_if_port`
    #[arg(long)]
    port: Option<u16>,

    /// Override `gotapi_if_host`
    #[arg(long, value_name = "ADDR")]
    host: Option<String>,

    /// Also write a daily log file here
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
}

const LOG_FILE_PREFIX: &str = "gotapi-server";

/// Daily-rolling, non-blocking log file in `dir`.
fn file_writer(dir: &Path) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(dir)
        .with_context(|| format!("Cannot open a log file in {}", dir.display()))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Install the subscriber: stderr always, plus a log file when `log_dir` is
/// set. Debug builds fall back to the temp dir and default to `debug`.
///
/// The returned guard flushes the file on drop; keep it alive until exit.
fn setup_logging(log_dir: Option<PathBuf>) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if cfg!(debug_assertions) { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "gotapi_core={level},gotapi_daemon={level},gotapi_server={level}"
        ))
    });

    let log_dir = log_dir.or_else(|| cfg!(debug_assertions).then(std::env::temp_dir));
    let (file_layer, guard) = match &log_dir {
        Some(dir) => {
            let (writer, guard) = file_writer(dir)?;
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(cfg!(debug_assertions)),
        )
        .with(file_layer)
        .init();

    if let Some(dir) = log_dir {
        info!("Logging to {}/{LOG_FILE_PREFIX}.<date>.log", dir.display());
    }
    Ok(guard)
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => Directories::new()
            .context("Cannot determine the config directory")?
            .config_file,
    };
    info!("Using config {}", path.display());

    let mut config =
        Config::load(&path).with_context(|| format!("Cannot load {}", path.display()))?;
    if let Some(port) = args.port {
        config.gotapi_if_port = port;
    }
    if let Some(host) = &args.host {
        config.gotapi_if_host.clone_from(host);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_dir.clone())?;

    let config = load_config(&args)?;
    info!("Starting GotAPI server {}...", gotapi_core::VERSION);

    gotapi_daemon::run(config).await?;
    Ok(())
}
