//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::ServerConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<ServerConfig, ConfigError> {
    let config: ServerConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = parse_config(
            r#"
            [listener]
            bind_address = "127.0.0.1:9000"

            [limits]
            surface_trailers = true

            [observability]
            log_format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.listener.bind_address, "127.0.0.1:9000");
        assert!(config.limits.surface_trailers);
        assert_eq!(config.buffers.buffer_size, 16 * 1024);
        assert_eq!(config.observability.log_format, crate::config::schema::LogFormat::Json);
    }

    #[test]
    fn validation_errors_are_joined() {
        let err = parse_config("[limits]\ncompression_level = 12\nmax_headers = 0\n").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation failed: limits.max_headers: must be greater than 0, \
             limits.compression_level: must be between 0 and 9"
        );
    }

    #[test]
    fn syntax_errors_surface() {
        assert!(matches!(parse_config("[listener"), Err(ConfigError::Parse(_))));
    }
}
