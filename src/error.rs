//! Error catalogue for the engine.
//!
//! # Responsibilities
//! - Name every failure condition a caller of the exchange contract must handle
//! - Classify failures (usage, framing, acquisition, I/O)
//! - Decide whether a failure is fatal for the owning connection
//!
//! # Design Decisions
//! - Closed enumeration; the numeric codes are stable and appear in logs
//! - Framing failures carry their own sub-kind so the wire cause is visible
//! - The I/O source is kept for `std::error::Error::source` chains

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Malformed or inconsistent wire data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("invalid chunk size line")]
    InvalidChunkSize,
    #[error("chunk size line too long")]
    ChunkLineTooLong,
    #[error("missing CRLF after chunk data")]
    MissingChunkTerminator,
    #[error("invalid Content-Length header")]
    InvalidContentLength,
    #[error("conflicting Content-Length headers")]
    ConflictingContentLength,
    #[error("unsupported Transfer-Encoding")]
    UnsupportedTransferEncoding,
    #[error("body exceeds declared length")]
    LengthOverflow,
    #[error("body shorter than declared length ({remaining} bytes missing)")]
    LengthUnderflow { remaining: u64 },
    #[error("peer closed before the body was complete")]
    PrematureEof,
    #[error("malformed request head")]
    MalformedHead,
    #[error("request head too large")]
    HeadTooLarge,
    #[error("trailer section too large")]
    TrailersTooLarge,
}

/// The named failure conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    ResponseAlreadyStarted,
    ResponseChannelAlreadyProvided,
    RequestChannelAlreadyProvided,
    FailedToAcquireRequestChannel,
    FailedToAcquireResponseChannel,
    HandlerCannotBeNull,
    PathMustBeSpecified,
    BufferPoolExhausted,
    Framing(FramingError),
    Io,
    Tls,
    ChannelNotObtained,
    Timeout,
    Upgrade,
}

/// Broad class of a failure, used to pick the recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Programmer misuse of the exchange contract. Never retried.
    Usage,
    /// Malformed wire data. Fatal for the connection.
    Framing,
    /// Transient resource shortage.
    Acquisition,
    /// Socket or TLS failure. Fatal for the connection.
    Io,
}

impl ErrorKind {
    /// Stable numeric code.
    pub fn code(&self) -> u16 {
        match self {
            ErrorKind::ResponseAlreadyStarted => 2,
            ErrorKind::ResponseChannelAlreadyProvided => 4,
            ErrorKind::RequestChannelAlreadyProvided => 5,
            ErrorKind::FailedToAcquireRequestChannel => 6,
            ErrorKind::FailedToAcquireResponseChannel => 7,
            ErrorKind::HandlerCannotBeNull => 8,
            ErrorKind::PathMustBeSpecified => 9,
            ErrorKind::BufferPoolExhausted => 10,
            ErrorKind::Framing(_) => 11,
            ErrorKind::Io => 12,
            ErrorKind::Tls => 13,
            ErrorKind::ChannelNotObtained => 14,
            ErrorKind::Timeout => 15,
            ErrorKind::Upgrade => 16,
        }
    }

    /// Class of this condition.
    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorKind::ResponseAlreadyStarted
            | ErrorKind::ResponseChannelAlreadyProvided
            | ErrorKind::RequestChannelAlreadyProvided
            | ErrorKind::HandlerCannotBeNull
            | ErrorKind::PathMustBeSpecified
            | ErrorKind::ChannelNotObtained
            | ErrorKind::Upgrade => ErrorClass::Usage,
            ErrorKind::FailedToAcquireRequestChannel
            | ErrorKind::FailedToAcquireResponseChannel
            | ErrorKind::BufferPoolExhausted => ErrorClass::Acquisition,
            ErrorKind::Framing(_) => ErrorClass::Framing,
            ErrorKind::Io | ErrorKind::Tls | ErrorKind::Timeout => ErrorClass::Io,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ResponseAlreadyStarted => f.write_str("the response has already been started"),
            ErrorKind::ResponseChannelAlreadyProvided => {
                f.write_str("the response channel has already been provided")
            }
            ErrorKind::RequestChannelAlreadyProvided => {
                f.write_str("the request channel has already been provided")
            }
            ErrorKind::FailedToAcquireRequestChannel => f.write_str("failed to acquire request channel"),
            ErrorKind::FailedToAcquireResponseChannel => f.write_str("failed to acquire response channel"),
            ErrorKind::HandlerCannotBeNull => f.write_str("handler cannot be null"),
            ErrorKind::PathMustBeSpecified => f.write_str("path must be specified"),
            ErrorKind::BufferPoolExhausted => f.write_str("buffer pool exhausted"),
            ErrorKind::Framing(e) => write!(f, "framing error: {}", e),
            ErrorKind::Io => f.write_str("I/O failure"),
            ErrorKind::Tls => f.write_str("TLS failure"),
            ErrorKind::ChannelNotObtained => f.write_str("channel has not been obtained"),
            ErrorKind::Timeout => f.write_str("timed out"),
            ErrorKind::Upgrade => f.write_str("protocol upgrade failed"),
        }
    }
}

/// Error returned by every fallible engine operation.
#[derive(Debug, thiserror::Error)]
#[error("SLUICE{code:03}: {kind}", code = .kind.code())]
pub struct Error {
    kind: ErrorKind,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    /// Create an error of the given kind caused by `source`.
    pub fn with_source(
        kind: ErrorKind,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            kind,
            source: Some(source.into()),
        }
    }

    /// The named condition.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Class of the condition.
    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    /// Framing and I/O failures end the connection; the rest stay local to the exchange.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(self.class(), ErrorClass::Framing | ErrorClass::Io)
    }

    pub fn is_framing(&self) -> bool {
        matches!(self.kind, ErrorKind::Framing(_))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<FramingError> for Error {
    fn from(e: FramingError) -> Self {
        Error::new(ErrorKind::Framing(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            return Error::with_source(ErrorKind::Timeout, e);
        }
        Error::with_source(ErrorKind::Io, e)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::with_source(ErrorKind::Tls, e)
    }
}
