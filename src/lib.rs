//! sluice: an embeddable, non-blocking HTTP/1.1 server engine.
//!
//! # Architecture Overview
//!
//! ```text
//!   socket ──▶ net::driver ──▶ exchange ──▶ handler chain ──▶ dispatcher
//!                 │               │                             │
//!                 │          conduit chain               I/O task │ worker pool
//!                 │     (fixed / chunked / gzip)                  │
//!                 ▼               │                               ▼
//!           TLS conduits      buffer pool                 upgrade manager
//!                                                         (WebSocket, ...)
//! ```
//!
//! Handlers see one [`Exchange`] at a time: they obtain request and response
//! channels, write through the conduit chain and return a [`Flow`] telling
//! the driver what to do next.

// Core engine
pub mod buffer;
pub mod conduit;
pub mod error;
pub mod exchange;
pub mod handler;
pub mod upgrade;

// Serving
pub mod http;
pub mod net;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;

pub use buffer::BufferPool;
pub use config::schema::ServerConfig;
pub use error::{Error, ErrorKind, Result};
pub use exchange::Exchange;
pub use handler::{Flow, Handler};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
