//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (sizes > 0, addresses parse, levels in range)
//! - Check limits against each other (a head must fit in one buffer)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::ServerConfig;

/// One semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Smallest buffer that still holds a chunk frame and a minimal head.
const MIN_BUFFER_SIZE: usize = 256;

/// Check every semantic constraint and report all violations.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }
    if let Some(tls) = &config.listener.tls {
        if tls.cert_path.is_empty() {
            errors.push(ValidationError::new("listener.tls.cert_path", "must not be empty"));
        }
        if tls.key_path.is_empty() {
            errors.push(ValidationError::new("listener.tls.key_path", "must not be empty"));
        }
    }

    if config.threads.worker_threads == 0 {
        errors.push(ValidationError::new("threads.worker_threads", "must be greater than 0"));
    }

    if config.buffers.buffer_size < MIN_BUFFER_SIZE {
        errors.push(ValidationError::new(
            "buffers.buffer_size",
            format!("must be at least {} bytes", MIN_BUFFER_SIZE),
        ));
    }
    // Each connection holds an inbound and an outbound buffer.
    if config.buffers.pool_capacity < 2 {
        errors.push(ValidationError::new("buffers.pool_capacity", "must be at least 2"));
    }

    for (field, value) in [
        ("timeouts.idle_ms", config.timeouts.idle_ms),
        ("timeouts.read_ms", config.timeouts.read_ms),
        ("timeouts.write_ms", config.timeouts.write_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    if config.limits.max_header_bytes == 0 {
        errors.push(ValidationError::new("limits.max_header_bytes", "must be greater than 0"));
    } else if config.limits.max_header_bytes > config.buffers.buffer_size {
        errors.push(ValidationError::new(
            "limits.max_header_bytes",
            format!(
                "{} exceeds buffers.buffer_size ({})",
                config.limits.max_header_bytes, config.buffers.buffer_size
            ),
        ));
    }
    if config.limits.max_headers == 0 {
        errors.push(ValidationError::new("limits.max_headers", "must be greater than 0"));
    }
    if config.limits.compression_level > 9 {
        errors.push(ValidationError::new("limits.compression_level", "must be between 0 and 9"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_config(&ServerConfig::default()), Ok(()));
    }

    #[test]
    fn reports_every_error() {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "nowhere".to_string();
        config.buffers.buffer_size = 4096;
        config.limits.max_header_bytes = 8192;
        config.timeouts.idle_ms = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec!["listener.bind_address", "timeouts.idle_ms", "limits.max_header_bytes"]
        );
    }
}
