//! Per-exchange request state.
//!
//! # Responsibilities
//! - Capture what the access log needs about one HTTP exchange
//! - Give the application a place to attach extra log fields
//! - Hold the in-flight record for a connection so that exactly one of the
//!   completion and error paths consumes it
//!
//! # Design Decisions
//! - Times are monotonic `Instant`s; elapsed time saturates at zero
//! - Byte count is `None` until a response exists, then counts body bytes
//!   handed to the transport

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, Request};
use serde_json::{Map, Value};

/// Header carrying the original client address when a local proxy forwards
/// over a channel that hides it.
pub const X_FORWARD_FOR: &str = "x-forward-for";

/// Correlation id set by the terminating proxy.
pub const X_UNIQUE_ID: &str = "x-unique-id";

/// Transport-level address of the peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerAddr {
    /// A network peer (host, port).
    Socket(SocketAddr),
    /// Any other transport; may be empty for unnamed Unix-socket peers.
    Opaque(String),
}

impl PeerAddr {
    /// Host component of a socket address, or the opaque value verbatim.
    pub fn host(&self) -> String {
        match self {
            PeerAddr::Socket(addr) => addr.ip().to_string(),
            PeerAddr::Opaque(value) => value.clone(),
        }
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        PeerAddr::Socket(addr)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Socket(addr) => write!(f, "{}", addr),
            PeerAddr::Opaque(value) => f.write_str(value),
        }
    }
}

/// Request path and query exactly as the client sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawUri(pub String);

/// Extra fields an application attaches to its access log record.
///
/// Inserted into every request's extensions; handlers take it with
/// `Extension<LogContext>` and add what they know.
#[derive(Debug, Clone, Default)]
pub struct LogContext(Arc<Mutex<Map<String, Value>>>);

impl LogContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }
}

/// Everything recorded about one exchange.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub client_address: PeerAddr,
    pub start_time: Instant,
    pub finish_time: Option<Instant>,
    pub response_bytes: Option<u64>,
    pub http_status: Option<u16>,
    pub request_line: Option<String>,
    pub headers: HeaderMap,
    pub log_context: LogContext,
}

impl RequestRecord {
    /// Start a record now for the given peer.
    pub fn new(client_address: PeerAddr) -> Self {
        Self {
            client_address,
            start_time: Instant::now(),
            finish_time: None,
            response_bytes: None,
            http_status: None,
            request_line: None,
            headers: HeaderMap::new(),
            log_context: LogContext::new(),
        }
    }

    /// Start a record for a parsed request, capturing its line and headers.
    pub fn for_request<B>(client_address: PeerAddr, request: &Request<B>) -> Self {
        let mut record = Self::new(client_address);
        record.request_line = Some(format!(
            "{} {} {:?}",
            request.method(),
            request.uri(),
            request.version()
        ));
        record.headers = request.headers().clone();
        record
    }

    pub fn with_log_context(mut self, log_context: LogContext) -> Self {
        self.log_context = log_context;
        self
    }

    /// Header value as text. Missing or non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Note that a response was produced.
    pub fn respond(&mut self, status: u16) {
        self.http_status = Some(status);
        self.response_bytes.get_or_insert(0);
    }

    pub fn add_bytes(&mut self, n: u64) {
        let sent = self.response_bytes.get_or_insert(0);
        *sent = sent.saturating_add(n);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.response_bytes.unwrap_or(0)
    }

    pub fn finish(&mut self) {
        self.finish_time = Some(Instant::now());
    }

    /// Time from start to finish, if the exchange finished. Never negative.
    pub fn elapsed(&self) -> Option<Duration> {
        self.finish_time
            .map(|finish| finish.saturating_duration_since(self.start_time))
    }
}

/// Holder for a connection's in-flight record.
///
/// HTTP/1 serves one exchange at a time per connection, so one slot is
/// enough. Whoever takes the record out owns its outcome.
#[derive(Debug, Default)]
pub struct ExchangeSlot {
    current: Mutex<Option<RequestRecord>>,
}

impl ExchangeSlot {
    /// Store a new record, returning one still left from a previous exchange.
    pub fn begin(&self, record: RequestRecord) -> Option<RequestRecord> {
        self.lock().replace(record)
    }

    /// Mutate the in-flight record, if any.
    pub fn update(&self, f: impl FnOnce(&mut RequestRecord)) {
        if let Some(record) = self.lock().as_mut() {
            f(record);
        }
    }

    pub fn take(&self) -> Option<RequestRecord> {
        self.lock().take()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<RequestRecord>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
