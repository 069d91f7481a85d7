//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// I/O and worker thread counts.
    pub threads: ThreadConfig,

    /// Buffer pool sizing.
    pub buffers: BufferConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Request and body limits.
    pub limits: LimitsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
            max_connections: 10_000,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Thread counts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ThreadConfig {
    /// Runtime worker threads driving connections. 0 = one per core.
    pub io_threads: usize,

    /// Upper bound of the blocking pool handlers dispatch to.
    pub worker_threads: usize,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            io_threads: 0,
            worker_threads: 64,
        }
    }
}

/// Buffer pool sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Size of every pooled buffer in bytes.
    pub buffer_size: usize,

    /// Maximum number of buffers alive at once.
    pub pool_capacity: usize,

    /// Allocate every buffer at startup.
    pub preallocate: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_size: 16 * 1024,
            pool_capacity: 4096,
            preallocate: false,
        }
    }
}

/// Timeout configuration, in milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time allowed between requests on a persistent connection.
    pub idle_ms: u64,

    /// Time allowed without read progress while a request is in flight.
    pub read_ms: u64,

    /// Time allowed without write progress.
    pub write_ms: u64,

    /// Time connections get to finish after shutdown starts.
    pub shutdown_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle_ms: 60_000,
            read_ms: 30_000,
            write_ms: 30_000,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Request and body limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest request head accepted; larger heads get 431.
    pub max_header_bytes: usize,

    /// Most header fields accepted in one head.
    pub max_headers: usize,

    /// Unread request body discarded to keep a connection alive.
    pub max_drain_bytes: u64,

    /// Hand chunked trailers to handlers instead of discarding them.
    pub surface_trailers: bool,

    /// Largest trailer section accepted.
    pub max_trailer_bytes: usize,

    /// flate2 compression level (0-9).
    pub compression_level: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: 8 * 1024,
            max_headers: 100,
            max_drain_bytes: 1024 * 1024,
            surface_trailers: false,
            max_trailer_bytes: 8 * 1024,
            compression_level: 6,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
