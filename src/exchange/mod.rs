//! Exchange subsystem: one request/response cycle.
//!
//! # Data Flow
//! ```text
//! connection driver parses a head
//!     → Exchange::new (owns the wire for its lifetime)
//!     → handlers: obtain channels, start the response, register listeners
//!     → end_exchange
//!     → poll_complete (finish response, drain request, run listeners)
//!     → into_wire (next request) | into_upgraded (protocol switch)
//! ```
//!
//! # Design Decisions
//! - Channels are built lazily, once, on first obtain
//! - Lifecycle facts live in an explicit flag set; the monotonic ones can
//!   never be cleared
//! - Completion never blocks: it reports whether the driver must read or
//!   write before it can make progress

pub mod channel;
pub mod listeners;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, Bytes};
use http::header::{HeaderValue, CONNECTION, CONTENT_LENGTH, UPGRADE};
use http::{Extensions, HeaderMap, Method, StatusCode, Uri, Version};

use crate::buffer::BufferPool;
use crate::conduit::{
    ChunkedSink, ChunkedSource, CompressingSink, ConduitChain, Encoding, FixedLengthSink,
    FixedLengthSource, RawSink, RawSource, Read, ReadConduit, Wire, WriteConduit,
};
use crate::error::{Error, ErrorKind, Result};
use crate::http::request::{request_framing, BodyFraming, RequestHead, RequestId};
use crate::http::response::{encode_head, encoded_len, permits_body, prepare_framing, ResponseHead};
use crate::net::connection::ConnectionId;
use crate::observability::metrics;

pub use channel::{RequestChannel, ResponseChannel};
pub use listeners::{CompletionError, ExchangeSummary, ListenerError, ListenerFailure};
pub use state::{Flag, Flags, Phase};

use listeners::CompletionListeners;

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Per-exchange settings, shared by every exchange on a server.
#[derive(Debug, Clone)]
pub struct ExchangeSettings {
    /// Keep chunked trailers for handlers instead of discarding them.
    pub surface_trailers: bool,
    pub max_trailer_bytes: usize,
    /// Unread request body the server will discard to keep a connection alive.
    pub max_drain_bytes: u64,
    pub compression_level: u32,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            surface_trailers: false,
            max_trailer_bytes: 8 * 1024,
            max_drain_bytes: 1024 * 1024,
            compression_level: 6,
        }
    }
}

/// Connection-scoped facts every exchange on it shares.
#[derive(Debug, Clone)]
pub struct ExchangeContext {
    pub connection_id: ConnectionId,
    pub peer_addr: Option<SocketAddr>,
    pub pool: BufferPool,
    pub settings: Arc<ExchangeSettings>,
}

/// Progress of [`Exchange::poll_complete`].
#[derive(Debug)]
pub enum Completion {
    /// Inbound bytes are needed to finish draining the request body.
    NeedsRead,
    /// The outbound buffer must be flushed before the response can finish.
    NeedsWrite,
    Complete(CompletionReport),
}

/// Outcome of a finished exchange.
#[derive(Debug)]
pub struct CompletionReport {
    pub status: StatusCode,
    /// The connection may carry another request.
    pub persistent: bool,
    pub abrupt: bool,
    /// The first framing or I/O failure seen while completing.
    pub failure: Option<Error>,
    pub listener_error: Option<CompletionError>,
}

/// Protocol switch accepted but not yet performed.
#[derive(Debug)]
struct PendingUpgrade {
    protocol: String,
    chain: ConduitChain,
}

/// A connection that has left HTTP, handed to a protocol owner.
#[derive(Debug)]
pub struct UpgradedConnection {
    pub(crate) wire: Wire,
    pub(crate) chain: ConduitChain,
    protocol: String,
    request_id: RequestId,
    connection_id: ConnectionId,
    write_interest: bool,
}

impl UpgradedConnection {
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Read raw protocol bytes. Never blocks.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<Read> {
        self.chain.source.transfer(&mut self.wire, dst)
    }

    /// Write raw protocol bytes. A short write registers interest in writability.
    pub fn write(&mut self, src: &[u8]) -> Result<usize> {
        let n = self.chain.sink.transfer(&mut self.wire, src)?;
        if n < src.len() {
            self.write_interest = true;
        }
        Ok(n)
    }

    /// Close the write direction once queued bytes are out.
    pub fn close(&mut self) -> Result<bool> {
        self.chain.sink.terminate(&mut self.wire)
    }

    pub fn is_read_closed(&self) -> bool {
        self.wire.is_read_closed() && self.wire.inbound().is_empty()
    }

    pub(crate) fn take_write_interest(&mut self) -> bool {
        std::mem::take(&mut self.write_interest)
    }

    pub(crate) fn wire_mut(&mut self) -> &mut Wire {
        &mut self.wire
    }
}

/// One HTTP request/response cycle.
#[derive(Debug)]
pub struct Exchange {
    id: RequestId,
    context: ExchangeContext,
    request: RequestHead,
    response: ResponseHead,
    flags: Flags,
    listeners: CompletionListeners,
    wire: Wire,
    source: Option<ReadConduit>,
    sink: Option<WriteConduit>,
    response_framing: Option<BodyFraming>,
    encoding: Option<Encoding>,
    queued: Option<Bytes>,
    upgrade: Option<PendingUpgrade>,
    extensions: Extensions,
    failure: Option<Error>,
    drained: u64,
    started_at: Instant,
}

impl Exchange {
    pub fn new(request: RequestHead, wire: Wire, context: ExchangeContext) -> Self {
        let mut flags = Flags::default();
        if request.wants_keep_alive() {
            flags.insert(Flag::Persistent);
        }
        Self {
            id: RequestId::new(),
            context,
            request,
            response: ResponseHead::default(),
            flags,
            listeners: CompletionListeners::default(),
            wire,
            source: None,
            sink: None,
            response_framing: None,
            encoding: None,
            queued: None,
            upgrade: None,
            extensions: Extensions::new(),
            failure: None,
            drained: 0,
            started_at: Instant::now(),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.context.connection_id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.context.peer_addr
    }

    pub fn request(&self) -> &RequestHead {
        &self.request
    }

    pub fn method(&self) -> &Method {
        &self.request.method
    }

    pub fn uri(&self) -> &Uri {
        &self.request.uri
    }

    pub fn version(&self) -> Version {
        self.request.version
    }

    pub fn request_headers(&self) -> &HeaderMap {
        &self.request.headers
    }

    pub fn status(&self) -> StatusCode {
        self.response.status
    }

    /// Set the response status. Fails once the head has been written.
    pub fn set_status(&mut self, status: StatusCode) -> Result<()> {
        if self.is_response_started() {
            return Err(ErrorKind::ResponseAlreadyStarted.into());
        }
        self.response.status = status;
        Ok(())
    }

    /// Response headers. Changes after the response started are not sent.
    pub fn response_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.response.headers
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.response.headers
    }

    /// Compress the response body with `encoding`. Fails once the head has been written.
    pub fn set_response_encoding(&mut self, encoding: Encoding) -> Result<()> {
        if self.is_response_started() {
            return Err(ErrorKind::ResponseAlreadyStarted.into());
        }
        self.encoding = Some(encoding);
        Ok(())
    }

    pub fn response_encoding(&self) -> Option<Encoding> {
        self.encoding
    }

    /// Handler-owned state that travels with the exchange across dispatches.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn phase(&self) -> Phase {
        Phase::of(&self.flags)
    }

    pub fn is_response_started(&self) -> bool {
        self.flags.contains(Flag::ResponseStarted)
    }

    pub fn is_persistent(&self) -> bool {
        self.flags.contains(Flag::Persistent)
    }

    /// Close the connection after this exchange.
    pub fn close_connection(&mut self) {
        self.flags.remove(Flag::Persistent);
    }

    pub fn is_upgraded(&self) -> bool {
        self.flags.contains(Flag::Upgraded)
    }

    pub fn is_abrupt(&self) -> bool {
        self.flags.contains(Flag::Abrupt)
    }

    pub(crate) fn wire(&self) -> &Wire {
        &self.wire
    }

    pub(crate) fn wire_mut(&mut self) -> &mut Wire {
        &mut self.wire
    }

    /// Register a listener to run once the exchange is complete.
    pub fn add_completion_listener<F>(&mut self, listener: F)
    where
        F: FnOnce(&ExchangeSummary) -> std::result::Result<(), ListenerError> + Send + 'static,
    {
        self.listeners.push(listener);
    }

    /// Mark the connection as unusable after this exchange.
    pub(crate) fn mark_abrupt(&mut self) {
        self.flags.insert(Flag::Abrupt);
        self.flags.remove(Flag::Persistent);
    }

    pub(crate) fn mark_in_transit(&mut self) {
        self.flags.insert(Flag::InTransit);
    }

    pub(crate) fn pick_up(&mut self) {
        self.flags.remove(Flag::InTransit);
    }

    /// Returns `true` the first time only; the error handler runs once per exchange.
    pub(crate) fn claim_error_handling(&mut self) -> bool {
        self.flags.insert(Flag::ErrorHandled)
    }

    fn record_failure(&mut self, err: Error) {
        tracing::warn!(
            request_id = %self.id,
            connection_id = %self.context.connection_id,
            error = %err,
            "Exchange failed"
        );
        self.mark_abrupt();
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }

    // ---- request side ----

    fn build_request_chain(&self) -> Result<ReadConduit> {
        let raw = ReadConduit::Raw(RawSource::new());
        Ok(match request_framing(&self.request.headers)? {
            BodyFraming::Chunked => ReadConduit::Chunked(ChunkedSource::new(
                raw,
                self.context.settings.surface_trailers,
                self.context.settings.max_trailer_bytes,
            )),
            BodyFraming::Fixed(n) => ReadConduit::FixedLength(FixedLengthSource::new(n, raw)),
            BodyFraming::UntilClose => ReadConduit::FixedLength(FixedLengthSource::new(0, raw)),
        })
    }

    fn request_has_body(&self) -> bool {
        !matches!(request_framing(&self.request.headers), Ok(BodyFraming::Fixed(0)))
    }

    /// Build the request body stream. Succeeds once per exchange.
    pub fn obtain_request_channel(&mut self) -> Result<RequestChannel<'_>> {
        if self.flags.contains(Flag::RequestChannelObtained) {
            return Err(ErrorKind::RequestChannelAlreadyProvided.into());
        }
        let source = self
            .build_request_chain()
            .map_err(|e| Error::with_source(ErrorKind::FailedToAcquireRequestChannel, e))?;
        self.source = Some(source);
        self.flags.insert(Flag::RequestChannelObtained);

        if self.request.expects_continue() && self.request_has_body() && !self.is_response_started() {
            self.send_continue();
        }
        self.request_channel()
    }

    /// The request body stream obtained earlier.
    pub fn request_channel(&mut self) -> Result<RequestChannel<'_>> {
        if !self.flags.contains(Flag::RequestChannelObtained) {
            return Err(ErrorKind::ChannelNotObtained.into());
        }
        let source = self.source.as_mut().ok_or(ErrorKind::ChannelNotObtained)?;
        Ok(RequestChannel {
            source,
            wire: &mut self.wire,
            flags: &mut self.flags,
        })
    }

    fn send_continue(&mut self) {
        if self.wire.outbound_spare() >= CONTINUE.len() && self.flags.insert(Flag::ContinueSent) {
            self.wire.outbound_mut().extend_from_slice(CONTINUE);
            tracing::trace!(request_id = %self.id, "Sent 100 Continue");
        }
    }

    // ---- response side ----

    /// Write the status line and headers. Succeeds once per exchange.
    pub fn start_response(&mut self) -> Result<()> {
        if self.is_response_started() {
            return Err(ErrorKind::ResponseAlreadyStarted.into());
        }
        let mut persistent = self.is_persistent();
        let framing = prepare_framing(
            &self.request.method,
            self.request.version,
            &mut self.response,
            self.encoding,
            &mut persistent,
        )?;
        if !persistent {
            self.flags.remove(Flag::Persistent);
        }

        let len = encoded_len(self.response.status, &self.response.headers);
        if len > self.wire.outbound_spare() {
            return Err(Error::with_source(
                ErrorKind::FailedToAcquireResponseChannel,
                std::io::Error::new(std::io::ErrorKind::OutOfMemory, "response head exceeds the buffer size"),
            ));
        }
        encode_head(self.response.status, &self.response.headers, self.wire.outbound_mut());
        self.response_framing = Some(framing);
        self.flags.insert(Flag::ResponseStarted);

        tracing::debug!(
            request_id = %self.id,
            status = self.response.status.as_u16(),
            framing = ?framing,
            "Response started"
        );
        Ok(())
    }

    fn build_response_chain(&self) -> Result<WriteConduit> {
        let framing = self.response_framing.unwrap_or(BodyFraming::Fixed(0));
        let raw = WriteConduit::Raw(RawSink::new());
        let framed = match framing {
            BodyFraming::Fixed(n) => WriteConduit::FixedLength(FixedLengthSink::new(n, raw)),
            BodyFraming::Chunked => {
                WriteConduit::Chunked(ChunkedSink::new(self.context.pool.checkout()?, raw))
            }
            BodyFraming::UntilClose => raw,
        };
        match self.encoding {
            Some(encoding) if framing != BodyFraming::Fixed(0) => Ok(WriteConduit::Compressed(
                CompressingSink::new(
                    encoding,
                    self.context.settings.compression_level,
                    self.context.pool.checkout()?,
                    framed,
                ),
            )),
            _ => Ok(framed),
        }
    }

    /// Build the response body stream, starting the response if needed. Succeeds once per exchange.
    pub fn obtain_response_channel(&mut self) -> Result<ResponseChannel<'_>> {
        if self.flags.contains(Flag::ResponseChannelObtained) {
            return Err(ErrorKind::ResponseChannelAlreadyProvided.into());
        }
        let acquire = |e: Error| Error::with_source(ErrorKind::FailedToAcquireResponseChannel, e);
        if !self.is_response_started() {
            self.start_response().map_err(acquire)?;
        }
        let sink = self.build_response_chain().map_err(acquire)?;
        self.sink = Some(sink);
        self.flags.insert(Flag::ResponseChannelObtained);
        self.response_channel()
    }

    /// The response body stream obtained earlier.
    pub fn response_channel(&mut self) -> Result<ResponseChannel<'_>> {
        if !self.flags.contains(Flag::ResponseChannelObtained) {
            return Err(ErrorKind::ChannelNotObtained.into());
        }
        let sink = self.sink.as_mut().ok_or(ErrorKind::ChannelNotObtained)?;
        Ok(ResponseChannel {
            sink,
            wire: &mut self.wire,
            flags: &mut self.flags,
        })
    }

    /// Respond with `status` and a complete body, written during completion.
    pub fn send(&mut self, status: StatusCode, body: impl Into<Bytes>) -> Result<()> {
        if self.is_response_started() {
            return Err(ErrorKind::ResponseAlreadyStarted.into());
        }
        let body = body.into();
        self.response.status = status;
        if !(status.is_informational() || status == StatusCode::NO_CONTENT) {
            self.response
                .headers
                .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        }
        self.queued = Some(body);
        Ok(())
    }

    // ---- upgrade ----

    /// Write a `101 Switching Protocols` head and stage the replacement chain.
    pub(crate) fn accept_upgrade(
        &mut self,
        protocol: &str,
        headers: HeaderMap,
        chain: ConduitChain,
    ) -> Result<()> {
        if self.is_response_started() {
            return Err(ErrorKind::ResponseAlreadyStarted.into());
        }
        self.response.status = StatusCode::SWITCHING_PROTOCOLS;
        let upgrade = HeaderValue::from_str(protocol)
            .map_err(|e| Error::with_source(ErrorKind::Upgrade, e))?;
        self.response.headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        self.response.headers.insert(UPGRADE, upgrade);
        for (name, value) in headers.iter() {
            self.response.headers.append(name.clone(), value.clone());
        }
        self.start_response()?;
        self.upgrade = Some(PendingUpgrade {
            protocol: protocol.to_string(),
            chain,
        });
        Ok(())
    }

    pub fn has_pending_upgrade(&self) -> bool {
        self.upgrade.is_some()
    }

    /// Swap in the upgraded chain and give up the connection. The 101 must already be flushed.
    pub(crate) fn into_upgraded(mut self) -> Result<UpgradedConnection> {
        let pending = self.upgrade.take().ok_or(ErrorKind::Upgrade)?;
        self.flags.insert(Flag::Upgraded);
        self.flags.insert(Flag::RequestTerminated);
        self.flags.insert(Flag::ResponseTerminated);
        self.flags.insert(Flag::Ended);
        self.source = None;
        self.sink = None;

        let summary = self.summary();
        if self.flags.insert(Flag::Completed) {
            if let Err(e) = self.listeners.fire(&summary) {
                tracing::warn!(request_id = %self.id, error = %e, "Listeners failed on upgrade");
            }
        }
        metrics::record_upgrade(&pending.protocol);
        tracing::info!(
            request_id = %self.id,
            connection_id = %self.context.connection_id,
            protocol = %pending.protocol,
            "Connection upgraded"
        );

        Ok(UpgradedConnection {
            wire: self.wire,
            chain: pending.chain,
            protocol: pending.protocol,
            request_id: self.id,
            connection_id: self.context.connection_id,
            write_interest: false,
        })
    }

    // ---- completion ----

    /// The handler chain is done with this exchange.
    pub fn end_exchange(&mut self) {
        self.flags.insert(Flag::Ended);
    }

    /// Drive the exchange to completion without blocking.
    ///
    /// Finishes the response (starting it if no handler did), drains an
    /// unread request body within the configured bound, then runs the
    /// completion listeners exactly once.
    pub fn poll_complete(&mut self) -> Completion {
        self.end_exchange();
        if let Some(pending) = self.complete_response() {
            return pending;
        }
        if let Some(pending) = self.complete_request() {
            return pending;
        }

        let listener_error = if self.flags.insert(Flag::Completed) {
            let summary = self.summary();
            metrics::record_exchange(summary.status, summary.elapsed);
            tracing::debug!(
                request_id = %self.id,
                connection_id = %self.context.connection_id,
                method = %summary.method,
                path = %summary.path,
                status = summary.status.as_u16(),
                elapsed_ms = summary.elapsed.as_millis() as u64,
                persistent = summary.persistent,
                "Exchange complete"
            );
            self.listeners.fire(&summary).err()
        } else {
            None
        };

        Completion::Complete(CompletionReport {
            status: self.response.status,
            persistent: self.is_persistent() && !self.is_abrupt(),
            abrupt: self.is_abrupt(),
            failure: self.failure.take(),
            listener_error,
        })
    }

    fn complete_response(&mut self) -> Option<Completion> {
        if self.flags.contains(Flag::ResponseTerminated) {
            return None;
        }
        if self.is_abrupt() && self.is_response_started() {
            // The peer gets a truncated body and the connection closes.
            self.flags.insert(Flag::ResponseTerminated);
            return None;
        }
        if !self.is_response_started() {
            if self.queued.is_none()
                && self.encoding.is_none()
                && permits_body(&self.request.method, self.response.status)
                && !self.response.headers.contains_key(CONTENT_LENGTH)
            {
                self.response
                    .headers
                    .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
            }
            if let Err(e) = self.start_response() {
                self.record_failure(e);
                self.flags.insert(Flag::ResponseTerminated);
                return None;
            }
        }
        if !permits_body(&self.request.method, self.response.status) {
            // HEAD keeps the declared length; none of these carry the bytes.
            self.queued = None;
        }
        if self.sink.is_none() {
            match self.build_response_chain() {
                Ok(sink) => self.sink = Some(sink),
                Err(e) => {
                    self.record_failure(e);
                    self.flags.insert(Flag::ResponseTerminated);
                    return None;
                }
            }
        }

        let result = self.write_queued_and_terminate();
        match result {
            Ok(true) => {
                self.flags.insert(Flag::ResponseTerminated);
                None
            }
            Ok(false) => Some(Completion::NeedsWrite),
            Err(e) => {
                self.record_failure(e);
                self.flags.insert(Flag::ResponseTerminated);
                None
            }
        }
    }

    fn write_queued_and_terminate(&mut self) -> Result<bool> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(true);
        };
        if let Some(body) = self.queued.as_mut() {
            while !body.is_empty() {
                let n = sink.transfer(&mut self.wire, body)?;
                if n == 0 {
                    return Ok(false);
                }
                body.advance(n);
            }
            self.queued = None;
        }
        sink.terminate(&mut self.wire)
    }

    fn complete_request(&mut self) -> Option<Completion> {
        if self.flags.contains(Flag::RequestTerminated) {
            return None;
        }
        let unsolicited_body = self.request.expects_continue()
            && !self.flags.contains(Flag::ContinueSent)
            && self.request_has_body();
        if self.is_abrupt() || unsolicited_body {
            // The body is left unread, so the connection cannot carry another request.
            self.mark_abrupt();
            self.flags.insert(Flag::RequestTerminated);
            return None;
        }
        if self.source.is_none() {
            match self.build_request_chain() {
                Ok(source) => self.source = Some(source),
                Err(e) => {
                    self.record_failure(e);
                    self.flags.insert(Flag::RequestTerminated);
                    return None;
                }
            }
        }

        let limit = self.context.settings.max_drain_bytes;
        let mut scratch = [0u8; 2048];
        loop {
            let Some(source) = self.source.as_mut() else {
                return None;
            };
            match source.transfer(&mut self.wire, &mut scratch) {
                Ok(Read::Data(n)) => {
                    self.drained += n as u64;
                    if self.drained > limit {
                        tracing::debug!(
                            request_id = %self.id,
                            drained = self.drained,
                            "Request body exceeds drain limit"
                        );
                        self.mark_abrupt();
                        self.flags.insert(Flag::RequestTerminated);
                        return None;
                    }
                }
                Ok(Read::Pending) => return Some(Completion::NeedsRead),
                Ok(Read::Eof) => {
                    self.flags.insert(Flag::RequestTerminated);
                    return None;
                }
                Err(e) => {
                    self.record_failure(e);
                    self.flags.insert(Flag::RequestTerminated);
                    return None;
                }
            }
        }
    }

    fn summary(&self) -> ExchangeSummary {
        ExchangeSummary {
            request_id: self.id,
            connection_id: self.context.connection_id,
            peer_addr: self.context.peer_addr,
            method: self.request.method.clone(),
            path: self.request.uri.path().to_string(),
            status: self.response.status,
            persistent: self.is_persistent() && !self.is_abrupt(),
            abrupt: self.is_abrupt(),
            upgraded: self.is_upgraded(),
            elapsed: self.started_at.elapsed(),
        }
    }

    /// Give the wire back for the next request on this connection.
    pub(crate) fn into_wire(self) -> Wire {
        self.wire
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::http::request::{parse_head, HeadLimits};

    pub fn context(pool: &BufferPool) -> ExchangeContext {
        ExchangeContext {
            connection_id: ConnectionId::new(),
            peer_addr: None,
            pool: pool.clone(),
            settings: Arc::new(ExchangeSettings::default()),
        }
    }

    /// Parse `raw` as a request and build an exchange whose wire holds the bytes after the head.
    pub fn exchange(pool: &BufferPool, raw: &[u8]) -> Exchange {
        let mut wire = Wire::new(pool).unwrap();
        wire.feed(raw);
        let limits = HeadLimits {
            max_header_bytes: 8192,
            max_headers: 64,
        };
        let (head, consumed) = parse_head(wire.inbound(), limits).unwrap().unwrap();
        wire.inbound_mut().advance(consumed);
        Exchange::new(head, wire, context(pool))
    }

    /// Drive completion, collecting output, with the peer having sent everything already.
    pub fn complete(exchange: &mut Exchange, out: &mut Vec<u8>) -> CompletionReport {
        loop {
            match exchange.poll_complete() {
                Completion::Complete(report) => {
                    out.extend_from_slice(&exchange.wire_mut().take_output());
                    return report;
                }
                Completion::NeedsWrite => out.extend_from_slice(&exchange.wire_mut().take_output()),
                Completion::NeedsRead => exchange.wire_mut().mark_read_closed(),
            }
        }
    }
}
