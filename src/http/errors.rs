//! Classification of errors raised while serving an exchange.
//!
//! # Decision
//! ```text
//! broken pipe  AND  bytes already sent > 0   → ExpectedDisconnect
//! anything else                              → Unexpected
//! ```
//!
//! A broken pipe after part of the response went out is what a client
//! leaving a long-lived or streaming response looks like. It is logged at
//! info without a diagnostic chain and the connection is closed. Everything
//! else goes to the host's default reporter untouched.

use std::error::Error as StdError;
use std::io;

use crate::http::hooks::{ErrorOutcome, ExchangeFailure};
use crate::observability::logging::{LogRecord, LogSink};

/// Transport condition found in an error's source chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Peer closed while we were still writing (EPIPE).
    BrokenPipe,
    /// Peer reset the connection.
    ConnectionReset,
    /// Some other I/O failure.
    OtherIo,
    /// No I/O error in the chain.
    NotIo,
}

impl TransportErrorKind {
    /// Kind of the first `io::Error` found walking the source chain.
    pub fn of(error: &(dyn StdError + 'static)) -> Self {
        match find_io_error(error) {
            Some(io_error) => match io_error.kind() {
                io::ErrorKind::BrokenPipe => TransportErrorKind::BrokenPipe,
                io::ErrorKind::ConnectionReset => TransportErrorKind::ConnectionReset,
                _ => TransportErrorKind::OtherIo,
            },
            None => TransportErrorKind::NotIo,
        }
    }
}

/// Outcome of classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    ExpectedDisconnect,
    Unexpected,
}

/// Classify an error kind given how much of the response was already sent.
pub fn classify(kind: TransportErrorKind, bytes_sent: u64) -> Disposition {
    match kind {
        TransportErrorKind::BrokenPipe if bytes_sent > 0 => Disposition::ExpectedDisconnect,
        _ => Disposition::Unexpected,
    }
}

/// Error hook: log expected disconnects quietly, leave the rest to the host.
pub fn handle_exchange_error(sink: &dyn LogSink, failure: &ExchangeFailure<'_>) -> ErrorOutcome {
    let kind = TransportErrorKind::of(failure.error);
    match classify(kind, failure.record.bytes_sent()) {
        Disposition::ExpectedDisconnect => {
            let exc = match find_io_error(failure.error) {
                Some(io_error) => io_error.to_string(),
                None => failure.error.to_string(),
            };
            sink.emit(LogRecord::info("Socket error").field("exc", exc));
            ErrorOutcome::Handled {
                close_connection: true,
            }
        }
        Disposition::Unexpected => ErrorOutcome::Unhandled,
    }
}

fn find_io_error<'a>(error: &'a (dyn StdError + 'static)) -> Option<&'a io::Error> {
    std::iter::successors(Some(error), |&e| e.source()).find_map(|e| e.downcast_ref::<io::Error>())
}
