//! Streams the request body back as the response body.

use std::sync::Arc;

use bytes::Bytes;
use http::header::CONTENT_TYPE;

use super::{Flow, Handler, Interest};
use crate::conduit::Read;
use crate::error::Result;
use crate::exchange::{Exchange, Flag};

/// Bytes read from the request but not yet accepted by the response.
#[derive(Debug, Clone, Default)]
struct Backlog(Bytes);

/// Echoes the request body without buffering it whole.
///
/// Suspends on readability when the peer has not sent the next piece yet
/// and on writability when the outbound buffer is full.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl EchoHandler {
    fn suspend(interest: Interest) -> Flow {
        Flow::Suspend(interest, Arc::new(EchoHandler))
    }
}

impl Handler for EchoHandler {
    fn handle(&self, exchange: &mut Exchange) -> Result<Flow> {
        if !exchange.flags().contains(Flag::RequestChannelObtained) {
            exchange.obtain_request_channel()?;
        }
        if !exchange.flags().contains(Flag::ResponseChannelObtained) {
            if let Some(content_type) = exchange.request_headers().get(CONTENT_TYPE).cloned() {
                exchange.response_headers_mut().insert(CONTENT_TYPE, content_type);
            }
            exchange.obtain_response_channel()?;
        }

        let mut backlog = exchange
            .extensions_mut()
            .remove::<Backlog>()
            .unwrap_or_default()
            .0;
        let mut buf = [0u8; 4096];
        loop {
            while !backlog.is_empty() {
                if exchange.response_channel()?.write_buf(&mut backlog)? == 0 {
                    exchange.extensions_mut().insert(Backlog(backlog));
                    return Ok(Self::suspend(Interest::Writable));
                }
            }
            match exchange.request_channel()?.read(&mut buf)? {
                Read::Data(n) => backlog = Bytes::copy_from_slice(&buf[..n]),
                Read::Pending => return Ok(Self::suspend(Interest::Readable)),
                Read::Eof => break,
            }
        }

        if exchange.response_channel()?.shutdown()? {
            Ok(Flow::Done)
        } else {
            Ok(Self::suspend(Interest::Writable))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::test_support::{complete, exchange};
    use crate::BufferPool;

    #[test]
    fn echoes_a_complete_body() {
        let pool = BufferPool::new(1024, 8);
        let mut ex = exchange(
            &pool,
            b"POST / HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello",
        );
        assert!(matches!(EchoHandler.handle(&mut ex).unwrap(), Flow::Done));

        let mut out = Vec::new();
        let report = complete(&mut ex, &mut out);
        assert!(report.persistent);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ntransfer-encoding: chunked\r\n\r\n\
             5\r\nhello\r\n0\r\n\r\n"
        );
    }

    #[test]
    fn suspends_until_more_body_arrives() {
        let pool = BufferPool::new(1024, 8);
        let mut ex = exchange(&pool, b"POST / HTTP/1.1\r\nContent-Length: 6\r\n\r\nabc");
        let flow = EchoHandler.handle(&mut ex).unwrap();
        assert!(matches!(flow, Flow::Suspend(Interest::Readable, _)));

        ex.wire_mut().feed(b"def");
        let Flow::Suspend(_, resume) = flow else { unreachable!() };
        assert!(matches!(resume.handle(&mut ex).unwrap(), Flow::Done));

        let out = ex.wire_mut().take_output();
        let text = String::from_utf8_lossy(&out);
        assert!(text.ends_with("3\r\nabc\r\n3\r\ndef\r\n0\r\n\r\n"));
    }
}
