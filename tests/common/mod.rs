//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use worker_telemetry::app;
use worker_telemetry::config::ServerConfig;
use worker_telemetry::lifecycle::startup::{self, RunningServer};
use worker_telemetry::lifecycle::WorkerOptions;
use worker_telemetry::observability::{LogRecord, LogSink, MemorySink};

/// Single-worker config on the given address with the watchdog off.
pub fn test_config(bind_address: &str) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.bind_address = bind_address.to_string();
    config.listener.workers = 1;
    config.listener.max_connections = 64;
    config.timeouts.shutdown_grace_secs = 0;
    config.observability.max_blocking_secs = 0.0;
    config
}

/// A running worker pool writing into memory.
pub struct TestServer {
    pub sink: MemorySink,
    server: Option<RunningServer>,
}

impl TestServer {
    /// Start with the production hooks and the bundled app.
    pub fn start(config: &ServerConfig) -> Self {
        let sink = MemorySink::new();
        let shared: Arc<dyn LogSink> = Arc::new(sink.clone());
        let options = startup::default_options(config, app::router(config), shared);
        Self::start_with(config, &options, sink)
    }

    pub fn start_with(config: &ServerConfig, options: &WorkerOptions, sink: MemorySink) -> Self {
        let server = startup::start(config, options).expect("server starts");
        Self {
            sink,
            server: Some(server),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.server
            .as_ref()
            .and_then(RunningServer::local_addr)
            .expect("tcp listener")
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr(), path)
    }

    pub fn stop(mut self) {
        if let Some(server) = self.server.take() {
            server.stop();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.stop();
        }
    }
}

/// Poll the sink until `count` records with `message` arrived, or time out.
pub async fn wait_for(sink: &MemorySink, message: &str, count: usize) -> Vec<LogRecord> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let found = sink.with_message(message);
        if found.len() >= count || tokio::time::Instant::now() >= deadline {
            return found;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Client that opens a fresh connection per request.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .build()
        .expect("client builds")
}
