//! `Accept-Encoding` negotiation.

use http::header::ACCEPT_ENCODING;
use http::HeaderMap;

use super::{Flow, Handler};
use crate::conduit::Encoding;
use crate::error::Result;
use crate::exchange::Exchange;

/// Installs the compression conduit when the client accepts gzip or deflate,
/// then passes the exchange on.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompressionHandler;

impl Handler for CompressionHandler {
    fn handle(&self, exchange: &mut Exchange) -> Result<Flow> {
        if exchange.is_response_started() {
            return Ok(Flow::Next);
        }
        if let Some(encoding) = negotiate(exchange.request_headers()) {
            exchange.set_response_encoding(encoding)?;
            tracing::trace!(request_id = %exchange.request_id(), encoding = encoding.as_str(), "Compressing response");
        }
        Ok(Flow::Next)
    }
}

/// Quality weight of one `Accept-Encoding` element, in thousandths.
fn quality(params: &str) -> u16 {
    params
        .split(';')
        .filter_map(|p| p.trim().strip_prefix("q=").or_else(|| p.trim().strip_prefix("Q=")))
        .next()
        .and_then(|q| q.trim().parse::<f32>().ok())
        .map(|q| (q.clamp(0.0, 1.0) * 1000.0).round() as u16)
        .unwrap_or(1000)
}

/// Pick the preferred supported coding. Ties go to gzip.
pub fn negotiate(headers: &HeaderMap) -> Option<Encoding> {
    let mut gzip = None;
    let mut deflate = None;
    let mut wildcard = None;
    for value in headers.get_all(ACCEPT_ENCODING) {
        let Ok(value) = value.to_str() else { continue };
        for element in value.split(',') {
            let (token, params) = element.split_once(';').unwrap_or((element, ""));
            let q = quality(params);
            let token = token.trim();
            match Encoding::from_token(token) {
                Some(Encoding::Gzip) => gzip = Some(q),
                Some(Encoding::Deflate) => deflate = Some(q),
                None if token == "*" => wildcard = Some(q),
                None => {}
            }
        }
    }
    let gzip = gzip.or(wildcard).unwrap_or(0);
    let deflate = deflate.or(wildcard).unwrap_or(0);
    match (gzip, deflate) {
        (0, 0) => None,
        (g, d) if g >= d => Some(Encoding::Gzip),
        _ => Some(Encoding::Deflate),
    }
}
