//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Bind socket → Build hooks → Spawn workers (worker.rs)
//!
//! Worker (worker.rs):
//!     Worker hooks (watchdog) → Attach listener → Accept loop
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     SIGTERM/SIGINT → Stop accepting → Drain connections → Join workers
//! ```
//!
//! # Design Decisions
//! - Ordered startup: worker hooks run before the first accept
//! - Shutdown has a deadline: workers give up on open connections after
//!   the grace period

pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod worker;

pub use shutdown::Shutdown;
pub use startup::{RunningServer, StartupError};
pub use worker::{WorkerBridge, WorkerError, WorkerOptions};
