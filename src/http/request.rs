//! Request head parsing and request-side framing.
//!
//! # Responsibilities
//! - Parse the request line and headers out of the inbound buffer
//! - Enforce head size and header count limits
//! - Generate the request ID used for log correlation
//! - Decide how the request body is framed
//!
//! # Design Decisions
//! - Parsing is incremental: a partial head leaves the buffer untouched
//! - Duplicate headers are preserved in arrival order (`HeaderMap::append`)
//! - Transfer-Encoding wins over Content-Length; anything but a lone
//!   `chunked` coding is refused

use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Uri, Version};
use uuid::Uuid;

use crate::error::FramingError;

/// Unique identifier for one exchange, carried in every log line about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Parsed request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, uri: Uri, version: Version) -> Self {
        Self {
            method,
            uri,
            version,
            headers: HeaderMap::new(),
        }
    }

    /// Whether any comma-separated element of `name` equals `token`, case-insensitively.
    pub fn header_has_token(&self, name: &HeaderName, token: &str) -> bool {
        header_has_token(&self.headers, name, token)
    }

    /// `Connection` semantics for this request alone.
    pub fn wants_keep_alive(&self) -> bool {
        let connection = http::header::CONNECTION;
        match self.version {
            Version::HTTP_11 => !self.header_has_token(&connection, "close"),
            Version::HTTP_10 => self.header_has_token(&connection, "keep-alive"),
            _ => false,
        }
    }

    pub fn expects_continue(&self) -> bool {
        self.version == Version::HTTP_11 && self.header_has_token(&http::header::EXPECT, "100-continue")
    }
}

pub(crate) fn header_has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Limits applied while parsing a head.
#[derive(Debug, Clone, Copy)]
pub struct HeadLimits {
    pub max_header_bytes: usize,
    pub max_headers: usize,
}

/// Try to parse a complete head from `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the head and the
/// number of bytes it occupied.
pub fn parse_head(buf: &[u8], limits: HeadLimits) -> Result<Option<(RequestHead, usize)>, FramingError> {
    let mut headers = vec![httparse::EMPTY_HEADER; limits.max_headers];
    let mut req = httparse::Request::new(&mut headers);
    let consumed = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            if buf.len() >= limits.max_header_bytes {
                return Err(FramingError::HeadTooLarge);
            }
            return Ok(None);
        }
        Err(httparse::Error::TooManyHeaders) => return Err(FramingError::HeadTooLarge),
        Err(_) => return Err(FramingError::MalformedHead),
    };
    if consumed > limits.max_header_bytes {
        return Err(FramingError::HeadTooLarge);
    }

    let method = req
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or(FramingError::MalformedHead)?;
    let uri = req
        .path
        .and_then(|p| p.parse::<Uri>().ok())
        .ok_or(FramingError::MalformedHead)?;
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(FramingError::MalformedHead),
    };

    let mut head = RequestHead::new(method, uri, version);
    for header in req.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| FramingError::MalformedHead)?;
        let value = HeaderValue::from_bytes(header.value).map_err(|_| FramingError::MalformedHead)?;
        head.headers.append(name, value);
    }
    Ok(Some((head, consumed)))
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// Exactly this many bytes (0 = no body).
    Fixed(u64),
    Chunked,
    /// Raw bytes until the connection closes (responses only).
    UntilClose,
}

/// Body framing of a request, from its headers.
pub fn request_framing(headers: &HeaderMap) -> Result<BodyFraming, FramingError> {
    if headers.contains_key(TRANSFER_ENCODING) {
        let codings: Vec<String> = headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .map(|v| v.to_str().map_err(|_| FramingError::UnsupportedTransferEncoding))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        return match codings.as_slice() {
            [only] if only == "chunked" => Ok(BodyFraming::Chunked),
            _ => Err(FramingError::UnsupportedTransferEncoding),
        };
    }
    match content_length(headers)? {
        Some(n) => Ok(BodyFraming::Fixed(n)),
        None => Ok(BodyFraming::Fixed(0)),
    }
}

/// The declared Content-Length. Repeated identical values are accepted; differing ones are not.
pub fn content_length(headers: &HeaderMap) -> Result<Option<u64>, FramingError> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let value = value.to_str().map_err(|_| FramingError::InvalidContentLength)?;
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(FramingError::InvalidContentLength);
            }
            let n: u64 = part.parse().map_err(|_| FramingError::InvalidContentLength)?;
            match length {
                Some(existing) if existing != n => return Err(FramingError::ConflictingContentLength),
                _ => length = Some(n),
            }
        }
    }
    Ok(length)
}
