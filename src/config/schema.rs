//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a worker
//! deployment. All types derive Serde traits for deserialization from config
//! files.

use serde::{Deserialize, Serialize};

/// Root configuration for the worker server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, worker count).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Logging and blocking-detection settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address: `host:port` for TCP, `unix:/path/to.sock` for a Unix socket.
    pub bind_address: String,

    /// Number of worker threads. 0 means one per available core.
    pub workers: usize,

    /// Maximum concurrent connections per worker (backpressure).
    pub max_connections: usize,
}

impl ListenerConfig {
    /// Resolve the configured worker count.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            workers: 0,
            max_connections: 10_000,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout applied to the application router, in seconds.
    pub request_secs: u64,

    /// How long a stopping worker waits for open connections, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 30,
            shutdown_grace_secs: 10,
        }
    }
}

/// Where structured log lines are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    #[default]
    Stdout,
    Stderr,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Numeric severity threshold (debug=10, info=20, warning=30, error=40,
    /// critical=50). Records below it are dropped.
    pub min_severity: u16,

    /// Longest a single unit of work may hold a worker's event loop before it
    /// is reported, in seconds. 0 disables the watchdog.
    pub max_blocking_secs: f64,

    /// Process environment variable holding the deployment tag
    /// ("prod", "staging", "dev", ...).
    pub env_var: String,

    /// Output stream for log lines.
    pub log_target: LogTarget,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            min_severity: 10,
            max_blocking_secs: 1.0,
            env_var: "APP_ENV".to_string(),
            log_target: LogTarget::Stdout,
        }
    }
}
