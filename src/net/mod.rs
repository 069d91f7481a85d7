//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (ID, lifecycle tracking)
//!     → tls.rs (optional certificate material for the TLS conduits)
//!     → driver.rs (head parsing, dispatch, completion, upgrades)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - TLS is optional and handled transparently below the wire

pub mod connection;
pub mod driver;
pub mod listener;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use driver::{Driver, DriverSettings};
pub use listener::{Listener, ListenerError};
