//! WebSocket (RFC 6455, version 13) over an upgraded connection.
//!
//! # Responsibilities
//! - Validate the opening handshake and compute `Sec-WebSocket-Accept`
//! - Select a subprotocol from the client's offer
//! - Decode masked client frames and encode unmasked server frames, using
//!   tungstenite's frame headers
//! - Provide an echo owner: messages are echoed, pings answered, closes mirrored

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{Buf, BytesMut};
use http::header::{
    HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION,
};
use http::{Method, StatusCode};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Control, Data, OpCode};
use tokio_tungstenite::tungstenite::protocol::frame::FrameHeader;

use super::{Acceptance, ConnectionOwner, OwnerState, Rejection, UpgradeAcceptor, UpgradedConnection};
use crate::conduit::Read;
use crate::error::Result;
use crate::http::request::RequestHead;

/// Largest reassembled message the echo owner accepts.
pub const DEFAULT_MAX_MESSAGE: usize = 1 << 20;

/// `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(key: &str) -> String {
    derive_accept_key(key.trim().as_bytes())
}

type OwnerFactory = Arc<dyn Fn(Option<&str>) -> Box<dyn ConnectionOwner> + Send + Sync>;

/// Accepts `Upgrade: websocket`.
#[derive(Clone)]
pub struct WebSocketAcceptor {
    subprotocols: Vec<String>,
    factory: OwnerFactory,
}

impl fmt::Debug for WebSocketAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketAcceptor")
            .field("subprotocols", &self.subprotocols)
            .finish_non_exhaustive()
    }
}

impl WebSocketAcceptor {
    /// `factory` builds the owner of each accepted connection from the selected subprotocol.
    pub fn new<F, O>(factory: F) -> Self
    where
        F: Fn(Option<&str>) -> O + Send + Sync + 'static,
        O: ConnectionOwner,
    {
        Self {
            subprotocols: Vec::new(),
            factory: Arc::new(move |subprotocol: Option<&str>| {
                Box::new(factory(subprotocol)) as Box<dyn ConnectionOwner>
            }),
        }
    }

    /// Echo every message back to the client.
    pub fn echo() -> Self {
        Self::new(|_| EchoOwner::new(DEFAULT_MAX_MESSAGE))
    }

    /// Subprotocols this server speaks, in no particular order; the client's preference wins.
    pub fn with_subprotocols<I, S>(mut self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = subprotocols.into_iter().map(Into::into).collect();
        self
    }

    fn select_subprotocol(&self, request: &RequestHead) -> Option<String> {
        request
            .headers
            .get_all(SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .find(|offered| self.subprotocols.iter().any(|s| s.as_str() == *offered))
            .map(str::to_string)
    }
}

impl UpgradeAcceptor for WebSocketAcceptor {
    fn protocol(&self) -> &str {
        "websocket"
    }

    fn negotiate(&self, request: &RequestHead) -> std::result::Result<Acceptance, Rejection> {
        if request.method != Method::GET {
            return Err(Rejection::new(StatusCode::BAD_REQUEST, "websocket upgrade requires GET"));
        }
        let version = request.headers.get(SEC_WEBSOCKET_VERSION).and_then(|v| v.to_str().ok());
        if version.map(str::trim) != Some("13") {
            return Err(Rejection::new(StatusCode::UPGRADE_REQUIRED, "unsupported websocket version")
                .with_header(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13")));
        }
        let key = request
            .headers
            .get(SEC_WEBSOCKET_KEY)
            .and_then(|v| v.to_str().ok())
            .filter(|k| STANDARD.decode(k.trim()).map(|raw| raw.len() == 16).unwrap_or(false))
            .ok_or_else(|| Rejection::new(StatusCode::BAD_REQUEST, "missing or invalid Sec-WebSocket-Key"))?;

        let accept = HeaderValue::from_str(&accept_key(key))
            .map_err(|_| Rejection::new(StatusCode::BAD_REQUEST, "invalid Sec-WebSocket-Key"))?;
        let subprotocol = self.select_subprotocol(request);
        let owner = (self.factory)(subprotocol.as_deref());
        let mut acceptance = Acceptance::boxed(owner).with_header(SEC_WEBSOCKET_ACCEPT, accept);
        if let Some(value) = subprotocol.and_then(|s| HeaderValue::from_str(&s).ok()) {
            acceptance = acceptance.with_header(SEC_WEBSOCKET_PROTOCOL, value);
        }
        Ok(acceptance)
    }
}

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_wire(code: OpCode) -> Option<Self> {
        match code {
            OpCode::Data(Data::Continue) => Some(Opcode::Continuation),
            OpCode::Data(Data::Text) => Some(Opcode::Text),
            OpCode::Data(Data::Binary) => Some(Opcode::Binary),
            OpCode::Control(Control::Close) => Some(Opcode::Close),
            OpCode::Control(Control::Ping) => Some(Opcode::Ping),
            OpCode::Control(Control::Pong) => Some(Opcode::Pong),
            OpCode::Data(Data::Reserved(_)) | OpCode::Control(Control::Reserved(_)) => None,
        }
    }

    fn to_wire(self) -> OpCode {
        match self {
            Opcode::Continuation => OpCode::Data(Data::Continue),
            Opcode::Text => OpCode::Data(Data::Text),
            Opcode::Binary => OpCode::Data(Data::Binary),
            Opcode::Close => OpCode::Control(Control::Close),
            Opcode::Ping => OpCode::Control(Control::Ping),
            Opcode::Pong => OpCode::Control(Control::Pong),
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// One WebSocket frame with its payload unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    /// A close frame carrying `code` and no reason.
    pub fn close(code: u16) -> Self {
        Self::new(Opcode::Close, code.to_be_bytes().to_vec())
    }
}

/// Violations that end a WebSocket connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WsError {
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("message exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("text message is not valid UTF-8")]
    InvalidUtf8,
}

impl WsError {
    /// Close status code sent to the peer.
    pub fn close_code(&self) -> u16 {
        match self {
            WsError::Protocol(_) => 1002,
            WsError::TooLarge { .. } => 1009,
            WsError::InvalidUtf8 => 1007,
        }
    }
}

/// Decode one client frame from the front of `buf`.
///
/// Returns `Ok(None)` until a whole frame is buffered. Client frames must be masked.
pub fn decode_frame(buf: &mut BytesMut, max_payload: usize) -> std::result::Result<Option<Frame>, WsError> {
    let mut cursor = Cursor::new(&buf[..]);
    let (header, len) = match FrameHeader::parse(&mut cursor) {
        Ok(Some(parsed)) => parsed,
        Ok(None) => return Ok(None),
        Err(_) => return Err(WsError::Protocol("unknown opcode")),
    };
    let header_len = cursor.position() as usize;

    if header.rsv1 || header.rsv2 || header.rsv3 {
        return Err(WsError::Protocol("reserved bits set"));
    }
    let opcode = Opcode::from_wire(header.opcode).ok_or(WsError::Protocol("unknown opcode"))?;
    let Some(mask) = header.mask else {
        return Err(WsError::Protocol("client frame not masked"));
    };
    if len >> 63 != 0 {
        return Err(WsError::Protocol("payload length high bit set"));
    }
    if opcode.is_control() && (!header.is_final || len > 125) {
        return Err(WsError::Protocol("invalid control frame"));
    }
    if len > max_payload as u64 {
        return Err(WsError::TooLarge { limit: max_payload });
    }
    let len = len as usize;
    if buf.len() < header_len + len {
        return Ok(None);
    }

    buf.advance(header_len);
    let mut payload = buf.split_to(len).to_vec();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
    Ok(Some(Frame {
        fin: header.is_final,
        opcode,
        payload,
    }))
}

/// Encode a server frame (unmasked) onto `dst`.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) {
    let header = FrameHeader {
        is_final: frame.fin,
        opcode: frame.opcode.to_wire(),
        ..FrameHeader::default()
    };
    let len = frame.payload.len() as u64;
    let mut head = Vec::with_capacity(header.len(len));
    // Formatting into a Vec cannot fail.
    let _ = header.format(len, &mut head);
    dst.extend_from_slice(&head);
    dst.extend_from_slice(&frame.payload);
}

/// Echoes text and binary messages, answers pings and mirrors the close handshake.
#[derive(Debug)]
pub struct EchoOwner {
    max_message: usize,
    inbound: BytesMut,
    outbound: BytesMut,
    message: Option<(Opcode, Vec<u8>)>,
    closing: bool,
    peer_gone: bool,
}

impl EchoOwner {
    pub fn new(max_message: usize) -> Self {
        Self {
            max_message,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            message: None,
            closing: false,
            peer_gone: false,
        }
    }

    fn queue(&mut self, frame: &Frame) {
        encode_frame(frame, &mut self.outbound);
    }

    fn fail(&mut self, err: &WsError) {
        tracing::debug!(error = %err, "Closing websocket");
        self.queue(&Frame::close(err.close_code()));
        self.closing = true;
        self.message = None;
    }

    fn finish_message(&mut self, opcode: Opcode, payload: Vec<u8>) -> std::result::Result<(), WsError> {
        if opcode == Opcode::Text && std::str::from_utf8(&payload).is_err() {
            return Err(WsError::InvalidUtf8);
        }
        self.queue(&Frame::new(opcode, payload));
        Ok(())
    }

    fn on_frame(&mut self, frame: Frame) -> std::result::Result<(), WsError> {
        match frame.opcode {
            Opcode::Text | Opcode::Binary => {
                if self.message.is_some() {
                    return Err(WsError::Protocol("expected continuation frame"));
                }
                if frame.fin {
                    self.finish_message(frame.opcode, frame.payload)?;
                } else {
                    self.message = Some((frame.opcode, frame.payload));
                }
            }
            Opcode::Continuation => {
                let Some((opcode, mut payload)) = self.message.take() else {
                    return Err(WsError::Protocol("continuation without a message"));
                };
                if payload.len() + frame.payload.len() > self.max_message {
                    return Err(WsError::TooLarge {
                        limit: self.max_message,
                    });
                }
                payload.extend_from_slice(&frame.payload);
                if frame.fin {
                    self.finish_message(opcode, payload)?;
                } else {
                    self.message = Some((opcode, payload));
                }
            }
            Opcode::Ping => self.queue(&Frame::new(Opcode::Pong, frame.payload)),
            Opcode::Pong => {}
            Opcode::Close => {
                if frame.payload.len() == 1 {
                    return Err(WsError::Protocol("close payload of one byte"));
                }
                let reply = if frame.payload.len() >= 2 {
                    Frame::new(Opcode::Close, frame.payload[..2].to_vec())
                } else {
                    Frame::new(Opcode::Close, Vec::new())
                };
                self.queue(&reply);
                self.closing = true;
            }
        }
        Ok(())
    }

    fn write_out(&mut self, conn: &mut UpgradedConnection) -> Result<OwnerState> {
        while !self.outbound.is_empty() {
            let n = conn.write(&self.outbound)?;
            if n == 0 {
                return Ok(OwnerState::Continue);
            }
            self.outbound.advance(n);
        }
        if self.closing || self.peer_gone {
            conn.close()?;
            return Ok(OwnerState::Close);
        }
        Ok(OwnerState::Continue)
    }
}

impl ConnectionOwner for EchoOwner {
    fn on_readable(&mut self, conn: &mut UpgradedConnection) -> Result<OwnerState> {
        let mut buf = [0u8; 4096];
        loop {
            match conn.read(&mut buf)? {
                Read::Data(n) => self.inbound.extend_from_slice(&buf[..n]),
                Read::Pending => break,
                Read::Eof => {
                    self.peer_gone = true;
                    break;
                }
            }
        }
        while !self.closing {
            match decode_frame(&mut self.inbound, self.max_message) {
                Ok(Some(frame)) => {
                    if let Err(e) = self.on_frame(frame) {
                        self.fail(&e);
                    }
                }
                Ok(None) => break,
                Err(e) => self.fail(&e),
            }
        }
        self.write_out(conn)
    }

    fn on_writable(&mut self, conn: &mut UpgradedConnection) -> Result<OwnerState> {
        self.write_out(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn masked(opcode: u8, fin: bool, payload: &[u8]) -> BytesMut {
        let mask = [0x12, 0x34, 0x56, 0x78];
        let mut buf = BytesMut::new();
        buf.put_u8((if fin { 0x80 } else { 0 }) | opcode);
        if payload.len() < 126 {
            buf.put_u8(0x80 | payload.len() as u8);
        } else {
            buf.put_u8(0x80 | 126);
            buf.put_u16(payload.len() as u16);
        }
        buf.extend_from_slice(&mask);
        buf.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        buf
    }

    fn request(raw: &str) -> RequestHead {
        let limits = crate::http::request::HeadLimits {
            max_header_bytes: 4096,
            max_headers: 32,
        };
        crate::http::request::parse_head(raw.as_bytes(), limits).unwrap().unwrap().0
    }

    #[test]
    fn rfc_sample_accept_key() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn handshake_validation() {
        let acceptor = WebSocketAcceptor::echo().with_subprotocols(["chat"]);
        let ok = request(
            "GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Protocol: superchat, chat\r\n\r\n",
        );
        let acceptance = acceptor.negotiate(&ok).unwrap();
        assert_eq!(acceptance.headers()[SEC_WEBSOCKET_ACCEPT], "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(acceptance.headers()[SEC_WEBSOCKET_PROTOCOL], "chat");

        let old = request(
            "GET /ws HTTP/1.1\r\nSec-WebSocket-Version: 8\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        );
        let rejection = acceptor.negotiate(&old).unwrap_err();
        assert_eq!(rejection.status, StatusCode::UPGRADE_REQUIRED);
        assert_eq!(rejection.headers[SEC_WEBSOCKET_VERSION], "13");

        let keyless = request("GET /ws HTTP/1.1\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: short\r\n\r\n");
        assert_eq!(acceptor.negotiate(&keyless).unwrap_err().status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn decodes_partial_and_masked_frames() {
        let full = masked(0x1, true, b"hello");
        let mut buf = BytesMut::from(&full[..4]);
        assert_eq!(decode_frame(&mut buf, 1024).unwrap(), None);
        buf.extend_from_slice(&full[4..]);
        let frame = decode_frame(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(frame, Frame::new(Opcode::Text, b"hello".to_vec()));
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_unmasked_and_oversized() {
        let mut unmasked = BytesMut::from(&[0x81u8, 0x01, b'a'][..]);
        assert!(matches!(decode_frame(&mut unmasked, 1024), Err(WsError::Protocol(_))));

        let mut big = masked(0x2, true, &[0u8; 300]);
        assert_eq!(
            decode_frame(&mut big, 100).unwrap_err(),
            WsError::TooLarge { limit: 100 }
        );
    }

    #[test]
    fn rejects_reserved_bits_and_opcodes() {
        let mut rsv = masked(0x1, true, b"x");
        rsv[0] |= 0x40;
        assert_eq!(decode_frame(&mut rsv, 1024).unwrap_err(), WsError::Protocol("reserved bits set"));

        let mut reserved_opcode = masked(0x3, true, b"x");
        assert!(matches!(decode_frame(&mut reserved_opcode, 1024), Err(WsError::Protocol(_))));

        let mut long_ping = masked(0x9, true, &[0u8; 126]);
        assert_eq!(
            decode_frame(&mut long_ping, 1024).unwrap_err(),
            WsError::Protocol("invalid control frame")
        );
    }

    #[test]
    fn encodes_extended_lengths() {
        let mut dst = BytesMut::new();
        encode_frame(&Frame::new(Opcode::Binary, vec![7u8; 200]), &mut dst);
        assert_eq!(&dst[..4], &[0x82, 126, 0, 200]);
        assert_eq!(dst.len(), 204);
    }

    #[test]
    fn echo_reassembles_fragments_and_answers_control_frames() {
        let mut owner = EchoOwner::new(1024);
        let mut input = masked(0x1, false, b"hel");
        input.extend_from_slice(&masked(0x9, true, b"p"));
        input.extend_from_slice(&masked(0x0, true, b"lo"));
        input.extend_from_slice(&masked(0x8, true, &1000u16.to_be_bytes()));
        owner.inbound = input;

        let mut frames = Vec::new();
        while let Some(frame) = decode_frame(&mut owner.inbound, 1024).unwrap() {
            frames.push(frame);
        }
        for frame in frames {
            owner.on_frame(frame).unwrap();
        }

        let mut expected = BytesMut::new();
        encode_frame(&Frame::new(Opcode::Pong, b"p".to_vec()), &mut expected);
        encode_frame(&Frame::new(Opcode::Text, b"hello".to_vec()), &mut expected);
        encode_frame(&Frame::close(1000), &mut expected);
        assert_eq!(owner.outbound, expected);
        assert!(owner.closing);
    }

    #[test]
    fn invalid_utf8_text_is_refused() {
        let mut owner = EchoOwner::new(1024);
        let err = owner.on_frame(Frame::new(Opcode::Text, vec![0xFF, 0xFE])).unwrap_err();
        assert_eq!(err.close_code(), 1007);
    }
}
