//! Structured logging.
//!
//! # Responsibilities
//! - Define the flat log record handed to sinks
//! - Render records as one JSON object per line
//! - Route the host's own `tracing` events into the same sink
//! - Drop records below the configured severity
//!
//! # Design Decisions
//! - Numeric severities so the threshold is a plain integer in config
//! - Absent values are omitted from records, never written as null
//! - Installed once per process; later installs hand back the same logger

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Metadata, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{LogTarget, ObservabilityConfig};

/// Record severity. Discriminants are the numeric levels compared against
/// `observability.min_severity`.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Trace = 5,
    Debug = 10,
    Info = 20,
    Warning = 30,
    Error = 40,
    Critical = 50,
}

impl Severity {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Trace => "trace",
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    /// True if a record of this severity clears the threshold.
    pub fn passes(self, min_severity: u16) -> bool {
        self.as_u16() >= min_severity
    }
}

impl From<&Level> for Severity {
    fn from(level: &Level) -> Self {
        match *level {
            Level::TRACE => Severity::Trace,
            Level::DEBUG => Severity::Debug,
            Level::INFO => Severity::Info,
            Level::WARN => Severity::Warning,
            Level::ERROR => Severity::Error,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured log record: severity, message and a flat field map.
///
/// Null values are never stored, so consumers can treat every key as present
/// and meaningful.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    severity: Severity,
    message: String,
    fields: Map<String, Value>,
}

impl LogRecord {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            fields: Map::new(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    /// Add a field, replacing any previous value under the same key.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value.into());
        self
    }

    /// Add a field only when a value is present.
    pub fn field_opt<V: Into<Value>>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(value) => self.field(key, value),
            None => self,
        }
    }

    /// Insert a field. Null values are dropped; returns whether it was stored.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> bool {
        if value.is_null() {
            return false;
        }
        self.fields.insert(key.into(), value);
        true
    }

    /// Insert a field unless the key is already taken.
    pub fn insert_if_absent(&mut self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        if self.fields.contains_key(&key) {
            return false;
        }
        self.insert(key, value)
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Destination for structured records.
///
/// Implementations must tolerate concurrent calls from every exchange on
/// every worker.
pub trait LogSink: Send + Sync {
    fn emit(&self, record: LogRecord);
}

/// Process-wide JSON-lines logger.
pub struct StructuredLogger {
    min_severity: u16,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl StructuredLogger {
    pub fn new(min_severity: u16, writer: Box<dyn Write + Send>) -> Self {
        Self {
            min_severity,
            writer: Mutex::new(writer),
        }
    }

    pub fn from_config(config: &ObservabilityConfig) -> Self {
        let writer: Box<dyn Write + Send> = match config.log_target {
            LogTarget::Stdout => Box::new(io::stdout()),
            LogTarget::Stderr => Box::new(io::stderr()),
        };
        Self::new(config.min_severity, writer)
    }

    pub fn min_severity(&self) -> u16 {
        self.min_severity
    }

    pub fn enabled(&self, severity: Severity) -> bool {
        severity.passes(self.min_severity)
    }

    fn write_entry(
        &self,
        severity: Severity,
        message: &str,
        target: Option<&str>,
        fields: Map<String, Value>,
    ) {
        let mut entry = Map::new();
        entry.insert(
            "timestamp".into(),
            Utc::now()
                .to_rfc3339_opts(SecondsFormat::Micros, true)
                .into(),
        );
        entry.insert("level".into(), severity.as_str().into());
        entry.insert("message".into(), message.into());
        if let Some(target) = target {
            entry.insert("target".into(), target.into());
        }
        for (key, value) in fields {
            if !value.is_null() {
                entry.entry(key).or_insert(value);
            }
        }

        let mut line = match serde_json::to_vec(&Value::Object(entry)) {
            Ok(line) => line,
            Err(_) => return,
        };
        line.push(b'\n');

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = writer.write_all(&line);
        let _ = writer.flush();
    }
}

impl LogSink for StructuredLogger {
    fn emit(&self, record: LogRecord) {
        if !self.enabled(record.severity) {
            return;
        }
        self.write_entry(record.severity, &record.message, None, record.fields);
    }
}

impl fmt::Debug for StructuredLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructuredLogger")
            .field("min_severity", &self.min_severity)
            .finish_non_exhaustive()
    }
}

/// Sink that keeps records in memory. Useful when embedding the worker in
/// another process that ships logs itself, and in tests.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records carrying the given message.
    pub fn with_message(&self, message: &str) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.message() == message)
            .collect()
    }
}

impl LogSink for MemorySink {
    fn emit(&self, record: LogRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

/// `tracing` layer writing every enabled event through a [`StructuredLogger`].
pub struct StructuredLayer {
    logger: Arc<StructuredLogger>,
}

impl StructuredLayer {
    pub fn new(logger: Arc<StructuredLogger>) -> Self {
        Self { logger }
    }
}

impl<S: Subscriber> Layer<S> for StructuredLayer {
    fn enabled(&self, metadata: &Metadata<'_>, _ctx: Context<'_, S>) -> bool {
        self.logger.enabled(Severity::from(metadata.level()))
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let severity = Severity::from(metadata.level());
        if !self.logger.enabled(severity) {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        self.logger.write_entry(
            severity,
            visitor.message.as_deref().unwrap_or_default(),
            Some(metadata.target()),
            visitor.fields,
        );
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else if !value.is_null() {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, Value::from(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, Value::from(format!("{:?}", value)));
    }
}

/// Error type for logger installation.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("another global tracing subscriber is already installed: {0}")]
    SubscriberConflict(String),
}

static INSTALLED: OnceLock<Arc<StructuredLogger>> = OnceLock::new();

/// Build the process-wide logger and make it the global `tracing` subscriber.
///
/// Host and library diagnostics emitted through `tracing` land in the same
/// JSON stream as request records. `RUST_LOG`, when set, narrows what the
/// host emits further. Calling this again returns the installed logger.
pub fn install(config: &ObservabilityConfig) -> Result<Arc<StructuredLogger>, LoggingError> {
    if let Some(existing) = INSTALLED.get() {
        return Ok(Arc::clone(existing));
    }
    install_logger(StructuredLogger::from_config(config))
}

/// Install an already built logger as the global subscriber.
///
/// A no-op returning the first logger if one was installed before.
pub fn install_logger(logger: StructuredLogger) -> Result<Arc<StructuredLogger>, LoggingError> {
    if let Some(existing) = INSTALLED.get() {
        return Ok(Arc::clone(existing));
    }

    let logger = Arc::new(logger);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().ok())
        .with(StructuredLayer::new(Arc::clone(&logger)))
        .try_init()
        .map_err(|e| LoggingError::SubscriberConflict(e.to_string()))?;

    let installed = INSTALLED.get_or_init(|| logger);
    Ok(Arc::clone(installed))
}
