//! Startup orchestration.
//!
//! # Responsibilities
//! - Bind the listening socket once
//! - Wire telemetry into the exchange hooks and the watchdog into the
//!   worker hooks
//! - Spawn the workers, wait for a stop signal, then drain them
//!
//! # Design Decisions
//! - Fail fast: a bind or spawn error is fatal
//! - Configuration is validated before this point; nothing here re-reads it

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use axum::Router;
use thiserror::Error;

use crate::config::ServerConfig;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::shutdown_signal;
use crate::lifecycle::worker::{spawn_workers, WorkerBridge, WorkerError, WorkerOptions};
use crate::net::listener::{BoundSocket, ListenerError};
use crate::observability::logging::LogSink;
use crate::observability::telemetry::Telemetry;
use crate::observability::watchdog::LoopLatencyWatchdog;

/// Error type for startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("failed to build signal runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

/// Workers that are up and serving.
pub struct RunningServer {
    handles: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    shutdown: Shutdown,
}

impl RunningServer {
    /// Bound TCP address; `None` for Unix sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Trigger shutdown and wait for every worker to finish draining.
    pub fn stop(self) {
        self.shutdown.trigger();
        for handle in self.handles {
            if handle.join().is_err() {
                tracing::error!("Worker thread panicked");
            }
        }
    }
}

/// Hooks used in production: access log and error classifier on every
/// exchange, blocking watchdog on every worker.
pub fn default_options(config: &ServerConfig, app: Router, sink: Arc<dyn LogSink>) -> WorkerOptions {
    let telemetry = Telemetry::from_config(&config.observability, Arc::clone(&sink));
    let bridge = WorkerBridge::new(
        &config.observability,
        Arc::new(LoopLatencyWatchdog::new(sink)),
    );
    WorkerOptions::new(app, Arc::new(telemetry), config).with_worker_hook(Arc::new(bridge))
}

/// Bind and spawn workers with the given options.
pub fn start(config: &ServerConfig, options: &WorkerOptions) -> Result<RunningServer, StartupError> {
    let socket = BoundSocket::bind(&config.listener)?;
    let shutdown = Shutdown::new();
    let handles = spawn_workers(
        &socket,
        config.listener.effective_workers(),
        options,
        &shutdown,
    )?;

    Ok(RunningServer {
        handles,
        local_addr: socket.local_addr(),
        shutdown,
    })
}

/// Serve until SIGINT or SIGTERM.
pub fn run(config: &ServerConfig, app: Router, sink: Arc<dyn LogSink>) -> Result<(), StartupError> {
    let options = default_options(config, app, sink);
    let server = start(config, &options)?;

    tracing::info!(
        workers = server.worker_count(),
        bind_address = %config.listener.bind_address,
        max_blocking_secs = config.observability.max_blocking_secs,
        "Serving traffic"
    );

    let signals = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(StartupError::Runtime)?;
    let signal = signals.block_on(shutdown_signal());

    tracing::info!(signal, "Shutdown signal received, draining workers");
    server.stop();
    Ok(())
}
