//! Extension points the host exposes to the rest of the crate.
//!
//! # Responsibilities
//! - End-of-exchange and on-error callbacks for each HTTP exchange
//! - Worker-start callback run before a worker accepts connections
//! - The host's default reporting used when no hook handles an error
//!
//! # Design Decisions
//! - Plain traits; implementors are composed into the host, never subclass it
//! - An exchange reaches exactly one of `on_exchange_complete` and
//!   `on_exchange_error`

use std::error::Error as StdError;

use crate::http::exchange::RequestRecord;

/// Identity of a worker, passed to worker hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerContext {
    pub worker_id: usize,
    pub name: String,
}

impl WorkerContext {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            name: format!("worker-{}", worker_id),
        }
    }
}

/// An error raised while serving an exchange, with the exchange's state.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeFailure<'a> {
    pub error: &'a (dyn StdError + 'static),
    pub record: &'a RequestRecord,
}

/// What an error hook decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOutcome {
    /// The hook dealt with the error; the host must not report it.
    Handled { close_connection: bool },
    /// The host reports the error through its default path.
    Unhandled,
}

/// Callbacks invoked per HTTP exchange.
pub trait ExchangeHooks: Send + Sync {
    /// The response was fully handed to the transport, or the connection
    /// ended cleanly.
    fn on_exchange_complete(&self, record: RequestRecord);

    /// Serving the exchange failed.
    fn on_exchange_error(&self, _failure: &ExchangeFailure<'_>) -> ErrorOutcome {
        ErrorOutcome::Unhandled
    }
}

/// Callbacks invoked once per worker.
pub trait WorkerHooks: Send + Sync {
    /// Runs synchronously before the worker's first accept.
    fn on_worker_start(&self, worker: &WorkerContext);
}

/// Host behavior when nothing else is plugged in.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl ExchangeHooks for DefaultHooks {
    fn on_exchange_complete(&self, record: RequestRecord) {
        tracing::debug!(
            remote_addr = %record.client_address,
            status = ?record.http_status,
            "Exchange complete"
        );
    }
}

/// The host's default error path: full diagnostic detail at error level.
pub fn report_unexpected(failure: &ExchangeFailure<'_>) {
    let chain = error_chain(failure.error);
    tracing::error!(
        error = %failure.error,
        chain = ?chain,
        remote_addr = %failure.record.client_address,
        http_request = failure.record.request_line.as_deref().unwrap_or("-"),
        response_bytes = failure.record.bytes_sent(),
        "Error handling request"
    );
}

/// Rendered error followed by each of its sources.
pub fn error_chain(error: &(dyn StdError + 'static)) -> Vec<String> {
    std::iter::successors(Some(error), |&e| e.source())
        .map(ToString::to_string)
        .collect()
}
