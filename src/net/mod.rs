//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! startup: listener.rs binds TCP or Unix socket once
//!     → one clone per worker, attached to that worker's event loop
//!     → accept (bounded by max_connections)
//!     → connection.rs (id, open-connection tracking)
//!     → hand off to the HTTP layer
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each connection tracked so a stopping worker can drain

pub mod connection;
pub mod listener;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{Accepted, BoundSocket, Listener, ListenerError};
