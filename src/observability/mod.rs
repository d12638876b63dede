//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Finished exchange  → access_log.rs  ─┐
//! Failed exchange    → http::errors   ─┤
//! Blocked event loop → watchdog.rs    ─┼─→ logging.rs (JSON lines)
//! Host `tracing` events               ─┘
//! ```
//!
//! # Design Decisions
//! - One sink per process; every record is one JSON object on one line
//! - Request records omit absent fields instead of writing null
//! - The watchdog lives on the loop it watches; no extra threads

pub mod access_log;
pub mod logging;
pub mod telemetry;
pub mod watchdog;

pub use access_log::AccessLogRecorder;
pub use logging::{LogRecord, LogSink, MemorySink, Severity, StructuredLogger};
pub use telemetry::Telemetry;
pub use watchdog::{LoopLatencyWatchdog, WatchdogLauncher};
