//! Spool - durable buffering uploader
//!
//! Reads newline-delimited records from stdin, buffers them in a local live
//! file and uploads each rolled-over chunk through the configured backend.
//!
//! # Usage
//!
//! ```bash
//! app | spool --config spool.toml
//! app | spool --config spool.toml --log-level debug
//!
//! # Force a rollover of the live file
//! kill -HUP $(pidof spool)
//! ```

mod run;

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use spool_config::{Config, LogConfig, LogFormat, LogOutput};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Upper bound on waiting for background work once the sink has stopped
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Spool - buffer records on disk and upload them in chunks
#[derive(Parser, Debug)]
#[command(name = "spool")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "spool.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error). Overrides config file.
    #[arg(short, long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    init_logging(&config.log, cli.log_level.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let result = runtime.block_on(async {
        run::run(config, tokio::io::stdin(), run::wait_for_shutdown())
            .await
            .map(|_| ())
    });

    // A pending stdin read holds a blocking thread that never returns
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    result
}

/// Initialize the tracing subscriber: CLI flag > config file level
fn init_logging(log: &LogConfig, cli_level: Option<&str>) -> Result<()> {
    let directives = match cli_level {
        Some(level) => level.to_string(),
        None => log.filter(),
    };

    let filter = EnvFilter::try_new(&directives)
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("invalid log level: {}", e))?;

    let (writer, ansi) = match &log.output {
        LogOutput::Stderr => (BoxMakeWriter::new(std::io::stderr), true),
        LogOutput::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {path}"))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
    };

    let registry = tracing_subscriber::registry();
    let installed = match log.format {
        LogFormat::Console => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_ansi(ansi)
                    .with_writer(writer),
            )
            .with(filter)
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(writer))
            .with(filter)
            .try_init(),
    };

    installed.map_err(|e| anyhow::anyhow!("failed to install log subscriber: {}", e))
}
