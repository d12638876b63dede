//! HTTP worker with structured access logging and blocking detection.
//!
//! ```text
//!  accept ──▶ http::server ──▶ axum Router (app)
//!                │
//!                ├─ exchange finished ──▶ observability::access_log ─┐
//!                └─ transport error   ──▶ http::errors classifier   ─┼─▶ StructuredLogger
//!  worker start ──▶ lifecycle::worker ──▶ observability::watchdog  ──┘
//! ```

pub mod app;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::ServerConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
