//! Worker threads and the per-worker start hook.
//!
//! # Responsibilities
//! - Spawn N worker threads, each with its own current-thread event loop
//! - Run worker hooks before the first accept (arms the blocking watchdog)
//! - Accept on the worker's clone of the bound socket until shutdown
//! - Drain open connections within the grace period
//!
//! # Design Decisions
//! - One OS thread per worker; nothing is shared between loops except the
//!   sink and the hooks
//! - A worker whose start fails logs and exits; the others keep serving

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use axum::Router;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::{ObservabilityConfig, ServerConfig};
use crate::http::hooks::{ExchangeHooks, WorkerContext, WorkerHooks};
use crate::http::server::HttpServer;
use crate::lifecycle::shutdown::Shutdown;
use crate::net::listener::{Accepted, BoundSocket, Listener, ListenerError};
use crate::observability::watchdog::WatchdogLauncher;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Error type for worker startup.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to build worker event loop: {0}")]
    Runtime(#[source] std::io::Error),
}

/// Arms the blocking watchdog when a worker starts.
pub struct WorkerBridge {
    max_blocking: Option<Duration>,
    launcher: Arc<dyn WatchdogLauncher>,
}

impl WorkerBridge {
    pub fn new(config: &ObservabilityConfig, launcher: Arc<dyn WatchdogLauncher>) -> Self {
        Self {
            max_blocking: blocking_threshold(config.max_blocking_secs),
            launcher,
        }
    }

    /// Threshold the watchdog is armed with, `None` when disabled.
    pub fn max_blocking(&self) -> Option<Duration> {
        self.max_blocking
    }
}

impl WorkerHooks for WorkerBridge {
    fn on_worker_start(&self, worker: &WorkerContext) {
        match self.max_blocking {
            Some(threshold) => self.launcher.start(threshold),
            None => tracing::trace!(worker = %worker.name, "Blocking watchdog disabled"),
        }
    }
}

/// Convert a configured threshold in seconds. Zero (or anything not
/// positive and finite) disables the watchdog.
pub fn blocking_threshold(secs: f64) -> Option<Duration> {
    if secs.is_finite() && secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

/// Everything a worker needs besides its socket.
#[derive(Clone)]
pub struct WorkerOptions {
    pub app: Router,
    pub exchange_hooks: Arc<dyn ExchangeHooks>,
    pub worker_hooks: Vec<Arc<dyn WorkerHooks>>,
    pub max_connections: usize,
    pub shutdown_grace: Duration,
}

impl WorkerOptions {
    pub fn new(app: Router, exchange_hooks: Arc<dyn ExchangeHooks>, config: &ServerConfig) -> Self {
        Self {
            app,
            exchange_hooks,
            worker_hooks: Vec::new(),
            max_connections: config.listener.max_connections,
            shutdown_grace: Duration::from_secs(config.timeouts.shutdown_grace_secs),
        }
    }

    pub fn with_worker_hook(mut self, hook: Arc<dyn WorkerHooks>) -> Self {
        self.worker_hooks.push(hook);
        self
    }
}

/// Spawn `count` worker threads named `worker-{id}`.
pub fn spawn_workers(
    socket: &BoundSocket,
    count: usize,
    options: &WorkerOptions,
    shutdown: &Shutdown,
) -> Result<Vec<JoinHandle<()>>, WorkerError> {
    let mut handles = Vec::with_capacity(count);

    for worker_id in 0..count {
        let worker = WorkerContext::new(worker_id);
        let socket = socket.try_clone()?;
        let options = options.clone();
        // Subscribe here so a shutdown racing the thread start is not missed.
        let stop = shutdown.subscribe();

        let handle = std::thread::Builder::new()
            .name(worker.name.clone())
            .spawn(move || {
                let name = worker.name.clone();
                if let Err(e) = run_on_own_loop(worker, socket, options, stop) {
                    tracing::error!(worker = %name, error = %e, "Worker exited with error");
                }
            })
            .map_err(WorkerError::Spawn)?;

        handles.push(handle);
    }

    tracing::info!(workers = count, address = %socket.describe(), "Workers spawned");
    Ok(handles)
}

fn run_on_own_loop(
    worker: WorkerContext,
    socket: BoundSocket,
    options: WorkerOptions,
    stop: broadcast::Receiver<()>,
) -> Result<(), WorkerError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(WorkerError::Runtime)?;
    runtime.block_on(run_worker(worker, socket, options, stop))
}

/// Body of one worker. Must run inside the worker's own event loop.
pub async fn run_worker(
    worker: WorkerContext,
    socket: BoundSocket,
    options: WorkerOptions,
    mut stop: broadcast::Receiver<()>,
) -> Result<(), WorkerError> {
    for hook in &options.worker_hooks {
        hook.on_worker_start(&worker);
    }

    let listener = Listener::from_bound(socket, options.max_connections)?;
    let server = HttpServer::new(options.app, options.exchange_hooks);

    tracing::info!(worker = %worker.name, "Worker accepting connections");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer, permit)) => {
                    let server = server.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        match stream {
                            Accepted::Tcp(io) => server.serve_connection(io, peer).await,
                            #[cfg(unix)]
                            Accepted::Unix(io) => server.serve_connection(io, peer).await,
                        }
                    });
                }
                Err(e) => back_off_after_accept_error(&worker, &e).await,
            },
            _ = stop.recv() => break,
        }
    }

    drop(listener);
    let open = server.tracker().active_count();
    tracing::info!(worker = %worker.name, open_connections = open, "Worker stopped accepting");

    if !server.tracker().wait_for_drain(options.shutdown_grace).await {
        tracing::warn!(
            worker = %worker.name,
            open_connections = server.tracker().active_count(),
            "Grace period elapsed with connections still open"
        );
    }
    Ok(())
}

/// Descriptor exhaustion and the like persist across retries; pause so the
/// accept loop does not spin on them.
async fn back_off_after_accept_error(worker: &WorkerContext, error: &ListenerError) {
    tracing::error!(worker = %worker.name, error = %error, "Accept error");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}
