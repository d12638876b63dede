//! worker-telemetry server binary.
//!
//! Loads configuration, installs the structured logger, then serves the
//! bundled application on N worker threads until SIGINT/SIGTERM.

use std::path::PathBuf;

use clap::Parser;

use worker_telemetry::app;
use worker_telemetry::config::{load_config, validate_config, ConfigError, ServerConfig};
use worker_telemetry::lifecycle::startup;
use worker_telemetry::observability::logging;

#[derive(Debug, Parser)]
#[command(name = "worker-telemetry", version, about = "HTTP worker with structured access logs and blocking detection")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (`host:port` or `unix:/path`)
    #[arg(long)]
    bind: Option<String>,

    /// Number of worker threads (0 = one per core)
    #[arg(long)]
    workers: Option<usize>,

    /// Blocking watchdog threshold in seconds (0 = disabled)
    #[arg(long)]
    max_blocking_secs: Option<f64>,

    /// Minimum severity written to the log (5 trace .. 50 critical)
    #[arg(long)]
    min_severity: Option<u16>,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(bind) = &self.bind {
            config.listener.bind_address = bind.clone();
        }
        if let Some(workers) = self.workers {
            config.listener.workers = workers;
        }
        if let Some(secs) = self.max_blocking_secs {
            config.observability.max_blocking_secs = secs;
        }
        if let Some(severity) = self.min_severity {
            config.observability.min_severity = severity;
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    cli.apply(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;

    let logger = logging::install(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.listener.bind_address,
        workers = config.listener.effective_workers(),
        min_severity = config.observability.min_severity,
        "worker-telemetry starting"
    );

    let app = app::router(&config);
    startup::run(&config, app, logger)?;

    tracing::info!("Shutdown complete");
    Ok(())
}
