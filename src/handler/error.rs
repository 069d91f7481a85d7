//! Handler failure reporting.
//!
//! When a handler returns an error or panics, the dispatcher marks the
//! exchange abrupt and gives it to the error handler once.

use std::fmt;

use http::StatusCode;

use crate::error::{Error, ErrorClass};
use crate::exchange::Exchange;

/// Why a handler did not finish normally.
#[derive(Debug)]
pub enum Failure {
    Error(Error),
    Panic(String),
}

impl Failure {
    /// Status the default error handler answers with.
    pub fn status(&self) -> StatusCode {
        match self {
            Failure::Error(e) => match e.class() {
                ErrorClass::Framing => StatusCode::BAD_REQUEST,
                ErrorClass::Acquisition => StatusCode::SERVICE_UNAVAILABLE,
                ErrorClass::Usage | ErrorClass::Io => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Failure::Panic(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Error(e) => write!(f, "{}", e),
            Failure::Panic(message) => write!(f, "handler panicked: {}", message),
        }
    }
}

/// Produces the response for a failed exchange.
pub trait ErrorHandler: Send + Sync + 'static {
    fn handle_error(&self, exchange: &mut Exchange, failure: &Failure);
}

/// Answers with an empty 400, 503 or 500 when the response has not started yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorHandler;

impl ErrorHandler for DefaultErrorHandler {
    fn handle_error(&self, exchange: &mut Exchange, failure: &Failure) {
        if exchange.is_response_started() {
            return;
        }
        exchange.close_connection();
        let status = failure.status();
        if let Err(e) = exchange.send(status, bytes::Bytes::new()) {
            tracing::debug!(request_id = %exchange.request_id(), error = %e, "Error response not sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, FramingError};
    use crate::exchange::test_support::{complete, exchange};
    use crate::BufferPool;

    #[test]
    fn status_follows_error_class() {
        assert_eq!(
            Failure::Error(FramingError::InvalidChunkSize.into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Failure::Error(ErrorKind::BufferPoolExhausted.into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Failure::Panic("boom".to_string()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn default_handler_closes_with_empty_body() {
        let pool = BufferPool::new(1024, 8);
        let mut ex = exchange(&pool, b"GET / HTTP/1.1\r\n\r\n");
        DefaultErrorHandler.handle_error(&mut ex, &Failure::Panic("boom".to_string()));

        let mut out = Vec::new();
        let report = complete(&mut ex, &mut out);
        assert!(!report.persistent);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
        );
    }
}
