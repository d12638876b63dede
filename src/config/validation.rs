//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds non-negative, severities known)
//! - Validate the bind address form before any socket is opened
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ServerConfig;
use crate::observability::logging::Severity;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("listener.bind_address `{0}` is neither host:port nor unix:/path")]
    InvalidBindAddress(String),

    #[error("listener.max_connections must be greater than zero")]
    ZeroMaxConnections,

    #[error("timeouts.request_secs must be greater than zero")]
    ZeroRequestTimeout,

    #[error("observability.max_blocking_secs must be a finite value >= 0, got {0}")]
    InvalidBlockingThreshold(f64),

    #[error("observability.min_severity {0} is above the highest severity (50)")]
    SeverityOutOfRange(u16),

    #[error("observability.env_var must not be empty")]
    EmptyEnvVar,
}

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let bind = &config.listener.bind_address;
    let unix_ok = bind
        .strip_prefix("unix:")
        .is_some_and(|path| !path.is_empty());
    if !unix_ok && bind.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(bind.clone()));
    }

    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroMaxConnections);
    }

    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::ZeroRequestTimeout);
    }

    let threshold = config.observability.max_blocking_secs;
    if !threshold.is_finite() || threshold < 0.0 {
        errors.push(ValidationError::InvalidBlockingThreshold(threshold));
    }

    if config.observability.min_severity > Severity::Critical.as_u16() {
        errors.push(ValidationError::SeverityOutOfRange(
            config.observability.min_severity,
        ));
    }

    if config.observability.env_var.trim().is_empty() {
        errors.push(ValidationError::EmptyEnvVar);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
