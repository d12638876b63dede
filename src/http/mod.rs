//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted connection
//!     → server.rs (hyper HTTP/1.1, one RequestRecord per exchange)
//!     → axum Router (application)
//!     → CountingBody (bytes handed to the transport)
//!     → hooks.rs
//!         ├─ body finished   → on_exchange_complete
//!         └─ transport error → on_exchange_error → errors.rs classifier
//! ```
//!
//! # Design Decisions
//! - Exactly one hook per exchange: the record lives in an `ExchangeSlot`
//!   and whichever path takes it first owns it
//! - Hooks are traits so the host never depends on the logging backend

pub mod errors;
pub mod exchange;
pub mod hooks;
pub mod server;

pub use errors::{classify, handle_exchange_error, Disposition, TransportErrorKind};
pub use exchange::{
    ExchangeSlot, LogContext, PeerAddr, RawUri, RequestRecord, X_FORWARD_FOR, X_UNIQUE_ID,
};
pub use hooks::{
    DefaultHooks, ErrorOutcome, ExchangeFailure, ExchangeHooks, WorkerContext, WorkerHooks,
};
pub use server::{CountingBody, HttpServer};
