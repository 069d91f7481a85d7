//! Response head serialization and response-side framing.
//!
//! # Responsibilities
//! - Choose how the response body is delimited (length, chunked, until close)
//! - Fix up framing and connection headers to match that choice
//! - Write the status line and headers into the outbound buffer
//!
//! # Design Decisions
//! - The status line always says HTTP/1.1; 1.0 peers get 1.0-compatible framing
//! - Bodiless responses (HEAD, 1xx, 204, 304) are fixed at zero bytes
//! - A content coding drops any declared length and falls back to chunked

use bytes::BytesMut;
use http::header::{
    HeaderValue, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING, VARY,
};
use http::{HeaderMap, Method, StatusCode, Version};

use crate::conduit::Encoding;
use crate::error::FramingError;
use crate::http::request::{content_length, BodyFraming};

/// Status and headers of a response under construction.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl Default for ResponseHead {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        }
    }
}

/// Whether a response to `method` with `status` may carry a body at all.
pub fn permits_body(method: &Method, status: StatusCode) -> bool {
    !(method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// Decide the framing of a response and rewrite its headers to match.
///
/// `persistent` is cleared when the chosen framing needs the connection to
/// close (an HTTP/1.0 peer and no declared length).
pub fn prepare_framing(
    method: &Method,
    version: Version,
    head: &mut ResponseHead,
    encoding: Option<Encoding>,
    persistent: &mut bool,
) -> Result<BodyFraming, FramingError> {
    let framing = if !permits_body(method, head.status) {
        BodyFraming::Fixed(0)
    } else {
        if let Some(encoding) = encoding {
            head.headers.remove(CONTENT_LENGTH);
            head.headers
                .insert(CONTENT_ENCODING, HeaderValue::from_static(encoding.as_str()));
            head.headers
                .append(VARY, HeaderValue::from_static("accept-encoding"));
        }
        match content_length(&head.headers)? {
            Some(n) => {
                head.headers.remove(TRANSFER_ENCODING);
                BodyFraming::Fixed(n)
            }
            None if version == Version::HTTP_11 => {
                head.headers
                    .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                BodyFraming::Chunked
            }
            None => {
                *persistent = false;
                BodyFraming::UntilClose
            }
        }
    };

    if head.status != StatusCode::SWITCHING_PROTOCOLS {
        head.headers.remove(CONNECTION);
        if !*persistent {
            head.headers.insert(CONNECTION, HeaderValue::from_static("close"));
        } else if version == Version::HTTP_10 {
            head.headers
                .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        }
    }
    Ok(framing)
}

/// Serialize a status line and headers, followed by the blank line.
pub fn encode_head(status: StatusCode, headers: &HeaderMap, dst: &mut BytesMut) {
    dst.extend_from_slice(b"HTTP/1.1 ");
    dst.extend_from_slice(status.as_str().as_bytes());
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    dst.extend_from_slice(b"\r\n");
    for (name, value) in headers.iter() {
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
    dst.extend_from_slice(b"\r\n");
}

/// Size of the serialized head, to check it fits the outbound buffer before writing.
pub fn encoded_len(status: StatusCode, headers: &HeaderMap) -> usize {
    let line = "HTTP/1.1 ".len()
        + 3
        + 1
        + status.canonical_reason().unwrap_or("Unknown").len()
        + 2;
    let fields: usize = headers
        .iter()
        .map(|(name, value)| name.as_str().len() + 2 + value.len() + 2)
        .sum();
    line + fields + 2
}

/// A complete, bodiless response used when no exchange can be built (bad head, oversized head).
pub fn canned(status: StatusCode) -> BytesMut {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    let mut dst = BytesMut::with_capacity(encoded_len(status, &headers));
    encode_head(status, &headers, &mut dst);
    dst
}
