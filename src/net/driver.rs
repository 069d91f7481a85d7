//! Per-connection driver: the socket I/O around sans-I/O exchanges.
//!
//! # Responsibilities
//! - Fill the wire from the socket and drain it back, under deadlines
//! - Parse request heads and reject bad or oversized ones
//! - Run the handler chain and resume suspended exchanges on readiness
//! - Complete exchanges and reuse the wire for pipelined requests
//! - Hand upgraded connections to their protocol owner
//!
//! # Design Decisions
//! - One task per connection; requests on it are processed strictly in order
//! - TLS sits between the socket and the plaintext wire as a conduit pair,
//!   so exchanges never know whether the connection is encrypted
//! - Idle timeout closes without a response; read and write deadlines bound
//!   each wait for progress

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Buf;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer::BufferPool;
use crate::conduit::tls::new_session;
use crate::conduit::{RawSink, RawSource, Read, ReadConduit, TlsSink, TlsSource, Wire, WriteConduit};
use crate::config::ServerConfig;
use crate::error::{Error, ErrorKind, FramingError, Result};
use crate::exchange::{Completion, CompletionReport, Exchange, ExchangeContext, ExchangeSettings, UpgradedConnection};
use crate::handler::{Dispatcher, Failure, Interest, Outcome, SharedHandler};
use crate::http::request::{parse_head, HeadLimits, RequestHead};
use crate::http::response::canned;
use crate::net::connection::ConnectionId;
use crate::upgrade::{ConnectionOwner, OwnerState};

/// Deadlines and limits the driver enforces.
#[derive(Debug, Clone, Copy)]
pub struct DriverSettings {
    pub head_limits: HeadLimits,
    pub idle_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl DriverSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            head_limits: HeadLimits {
                max_header_bytes: config.limits.max_header_bytes,
                max_headers: config.limits.max_headers,
            },
            idle_timeout: config.timeouts.idle(),
            read_timeout: config.timeouts.read(),
            write_timeout: config.timeouts.write(),
        }
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Serves connections: everything a connection task needs, shared by all of them.
pub struct Driver {
    handler: SharedHandler,
    dispatcher: Dispatcher,
    pool: BufferPool,
    exchange_settings: Arc<ExchangeSettings>,
    settings: DriverSettings,
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("pool", &self.pool)
            .field("settings", &self.settings)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

impl Driver {
    pub fn new(
        handler: SharedHandler,
        dispatcher: Dispatcher,
        pool: BufferPool,
        exchange_settings: ExchangeSettings,
        settings: DriverSettings,
    ) -> Self {
        Self {
            handler,
            dispatcher,
            pool,
            exchange_settings: Arc::new(exchange_settings),
            settings,
            tls: None,
        }
    }

    /// Terminate TLS on every connection with `config`.
    pub fn with_tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Serve one connection until it closes.
    pub async fn serve<S>(&self, stream: S, connection_id: ConnectionId, peer_addr: Option<SocketAddr>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let wire = Wire::new(&self.pool)?;
        let transport = match &self.tls {
            None => Transport::Plain,
            Some(config) => {
                let session = new_session(Arc::clone(config), self.pool.buffer_size())?;
                Transport::Tls {
                    cipher: Wire::new(&self.pool)?,
                    source: ReadConduit::Encrypted(TlsSource::new(
                        Arc::clone(&session),
                        ReadConduit::Raw(RawSource::new()),
                    )),
                    sink: WriteConduit::Encrypted(TlsSink::new(session, WriteConduit::Raw(RawSink::new()))),
                }
            }
        };
        let mut socket = Socket {
            stream,
            transport,
            scratch: vec![0u8; self.pool.buffer_size()],
        };
        let context = ExchangeContext {
            connection_id,
            peer_addr,
            pool: self.pool.clone(),
            settings: Arc::clone(&self.exchange_settings),
        };

        tracing::debug!(
            connection_id = %connection_id,
            peer_addr = ?peer_addr,
            tls = self.tls.is_some(),
            "Serving connection"
        );

        let result = self.serve_exchanges(&mut socket, wire, &context).await;
        if let Err(e) = socket.shutdown(self.settings.write_timeout).await {
            tracing::debug!(connection_id = %connection_id, error = %e, "Shutdown failed");
        }
        result
    }

    async fn serve_exchanges<S>(&self, socket: &mut Socket<S>, mut wire: Wire, context: &ExchangeContext) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let head = match self.read_head(socket, &mut wire, context.connection_id).await? {
                Head::Parsed(head) => head,
                Head::Closed => return Ok(()),
                Head::Rejected(status) => {
                    tracing::debug!(
                        connection_id = %context.connection_id,
                        status = status.as_u16(),
                        "Rejecting request head"
                    );
                    wire.outbound_mut().extend_from_slice(&canned(status));
                    return socket.flush(&mut wire, self.settings.write_timeout).await;
                }
            };

            let exchange = Box::new(Exchange::new(head, wire, context.clone()));
            let outcome = self.dispatcher.run(exchange, Arc::clone(&self.handler)).await;
            let Some(mut exchange) = self.settle(socket, outcome).await? else {
                return Ok(());
            };

            let report = self.complete(socket, &mut exchange).await?;
            if let Some(e) = &report.failure {
                tracing::debug!(
                    connection_id = %context.connection_id,
                    request_id = %exchange.request_id(),
                    error = %e,
                    "Exchange ended abruptly"
                );
            }
            if !report.persistent {
                return Ok(());
            }
            wire = (*exchange).into_wire();
        }
    }

    async fn read_head<S>(&self, socket: &mut Socket<S>, wire: &mut Wire, connection_id: ConnectionId) -> Result<Head>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            if !wire.inbound().is_empty() {
                match parse_head(wire.inbound(), self.settings.head_limits) {
                    Ok(Some((head, consumed))) => {
                        wire.inbound_mut().advance(consumed);
                        return Ok(Head::Parsed(head));
                    }
                    Ok(None) => {}
                    Err(FramingError::HeadTooLarge) => {
                        return Ok(Head::Rejected(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE))
                    }
                    Err(_) => return Ok(Head::Rejected(StatusCode::BAD_REQUEST)),
                }
            }
            if wire.is_read_closed() {
                return Ok(Head::Closed);
            }

            let idle = wire.inbound().is_empty();
            let limit = if idle {
                self.settings.idle_timeout
            } else {
                self.settings.read_timeout
            };
            match socket.fill(wire, limit).await {
                Ok(_) => {}
                Err(e) if idle && e.kind() == &ErrorKind::Timeout => {
                    tracing::debug!(connection_id = %connection_id, "Idle timeout");
                    return Ok(Head::Closed);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Follow suspensions until the handlers are done. `None` means the
    /// connection left HTTP or was lost.
    async fn settle<S>(&self, socket: &mut Socket<S>, mut outcome: Outcome) -> Result<Option<Box<Exchange>>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            match outcome {
                Outcome::Done(exchange) => return Ok(Some(exchange)),
                Outcome::Suspended(mut exchange, interest, handler) => {
                    let ready = match interest {
                        // Output queued so far (a 100 Continue, streamed chunks) must reach
                        // the peer before waiting on it.
                        Interest::Readable => match socket.flush(exchange.wire_mut(), self.settings.write_timeout).await {
                            Ok(()) => socket
                                .fill(exchange.wire_mut(), self.settings.read_timeout)
                                .await
                                .map(|_| ()),
                            Err(e) => Err(e),
                        },
                        Interest::Writable => socket.flush(exchange.wire_mut(), self.settings.write_timeout).await,
                    };
                    if let Err(e) = ready {
                        exchange.wire_mut().mark_read_closed();
                        self.dispatcher.report(&mut exchange, Failure::Error(e));
                        return Ok(Some(exchange));
                    }
                    outcome = self.dispatcher.run(exchange, handler).await;
                }
                Outcome::Upgrade(mut exchange, owner) => {
                    socket.flush(exchange.wire_mut(), self.settings.write_timeout).await?;
                    let conn = (*exchange).into_upgraded()?;
                    self.run_owner(socket, conn, owner).await?;
                    return Ok(None);
                }
                Outcome::Lost => return Ok(None),
            }
        }
    }

    async fn complete<S>(&self, socket: &mut Socket<S>, exchange: &mut Exchange) -> Result<CompletionReport>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            match exchange.poll_complete() {
                Completion::Complete(report) => {
                    socket.flush(exchange.wire_mut(), self.settings.write_timeout).await?;
                    return Ok(report);
                }
                Completion::NeedsWrite => {
                    socket.flush(exchange.wire_mut(), self.settings.write_timeout).await?;
                }
                Completion::NeedsRead => {
                    if let Err(e) = socket.fill(exchange.wire_mut(), self.settings.read_timeout).await {
                        tracing::debug!(request_id = %exchange.request_id(), error = %e, "Drain stopped");
                        exchange.mark_abrupt();
                        exchange.wire_mut().mark_read_closed();
                    }
                }
            }
        }
    }

    /// Give an upgraded connection to its owner until either side closes.
    async fn run_owner<S>(
        &self,
        socket: &mut Socket<S>,
        mut conn: UpgradedConnection,
        mut owner: Box<dyn ConnectionOwner>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut state = owner.on_open(&mut conn)?;
        // Bytes pipelined behind the upgrade request are already on the wire.
        let mut readable = !conn.wire.inbound().is_empty();
        loop {
            socket.flush(conn.wire_mut(), self.settings.write_timeout).await?;
            if state == OwnerState::Close || conn.wire.write_shutdown_requested() {
                break;
            }
            if conn.take_write_interest() {
                state = owner.on_writable(&mut conn)?;
                continue;
            }
            if readable {
                readable = false;
                state = owner.on_readable(&mut conn)?;
                continue;
            }
            if conn.wire.is_read_closed() {
                break;
            }
            // Upgraded protocols keep their own liveness; only the idle deadline applies.
            socket.fill(conn.wire_mut(), self.settings.idle_timeout).await?;
            readable = true;
        }
        tracing::debug!(
            connection_id = %conn.connection_id(),
            protocol = conn.protocol(),
            "Upgraded connection closed"
        );
        Ok(())
    }
}

enum Head {
    Parsed(RequestHead),
    /// The peer left, or went idle, before sending a request.
    Closed,
    Rejected(StatusCode),
}

/// How plaintext reaches the socket.
enum Transport {
    Plain,
    Tls {
        /// Ciphertext, as it crosses the socket.
        cipher: Wire,
        source: ReadConduit,
        sink: WriteConduit,
    },
}

struct Socket<S> {
    stream: S,
    transport: Transport,
    scratch: Vec<u8>,
}

async fn within<T>(limit: Duration, fut: impl Future<Output = io::Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ErrorKind::Timeout.into()),
    }
}

/// Write everything queued on `wire` to the stream.
async fn write_out<S>(stream: &mut S, wire: &mut Wire, limit: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    while wire.has_pending_output() {
        let n = within(limit, stream.write(wire.outbound())).await?;
        if n == 0 {
            return Err(Error::with_source(
                ErrorKind::Io,
                io::Error::from(io::ErrorKind::WriteZero),
            ));
        }
        wire.outbound_mut().advance(n);
    }
    within(limit, stream.flush()).await
}

/// Read one batch of bytes from the stream into `wire`. Returns the count; 0 is end of stream.
async fn read_in<S>(stream: &mut S, wire: &mut Wire, scratch: &mut [u8], limit: Duration) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    let room = wire.inbound_spare().min(scratch.len());
    if room == 0 {
        return Ok(0);
    }
    let n = within(limit, stream.read(&mut scratch[..room])).await?;
    if n == 0 {
        wire.mark_read_closed();
    } else {
        wire.feed(&scratch[..n]);
    }
    Ok(n)
}

impl<S> Socket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Add plaintext to `wire`. Returns `false` once the peer has closed.
    async fn fill(&mut self, wire: &mut Wire, limit: Duration) -> Result<bool> {
        if wire.is_read_closed() {
            return Ok(false);
        }
        if wire.inbound_spare() == 0 {
            return Ok(true);
        }
        match &mut self.transport {
            Transport::Plain => {
                read_in(&mut self.stream, wire, &mut self.scratch, limit).await?;
                Ok(!wire.is_read_closed())
            }
            Transport::Tls { cipher, source, sink } => loop {
                let room = wire.inbound_spare().min(self.scratch.len());
                match source.transfer(cipher, &mut self.scratch[..room])? {
                    Read::Data(n) if n > 0 => {
                        wire.feed(&self.scratch[..n]);
                        return Ok(true);
                    }
                    Read::Eof => {
                        wire.mark_read_closed();
                        return Ok(false);
                    }
                    Read::Data(_) | Read::Pending => {}
                }
                // Handshake records queued while reading.
                sink.flush(cipher)?;
                write_out(&mut self.stream, cipher, limit).await?;
                if cipher.inbound_spare() == 0 {
                    return Err(Error::with_source(
                        ErrorKind::Tls,
                        io::Error::new(io::ErrorKind::InvalidData, "TLS record buffer full"),
                    ));
                }
                read_in(&mut self.stream, cipher, &mut self.scratch, limit).await?;
            },
        }
    }

    /// Push everything queued on `wire` to the peer.
    async fn flush(&mut self, wire: &mut Wire, limit: Duration) -> Result<()> {
        match &mut self.transport {
            Transport::Plain => write_out(&mut self.stream, wire, limit).await,
            Transport::Tls { cipher, sink, .. } => loop {
                while wire.has_pending_output() {
                    let n = sink.transfer(cipher, wire.outbound())?;
                    if n == 0 {
                        break;
                    }
                    wire.outbound_mut().advance(n);
                }
                let drained = sink.flush(cipher)?;
                write_out(&mut self.stream, cipher, limit).await?;
                if drained && !wire.has_pending_output() {
                    return Ok(());
                }
            },
        }
    }

    /// Close the write direction, sending close_notify first on TLS.
    async fn shutdown(&mut self, limit: Duration) -> Result<()> {
        if let Transport::Tls { cipher, sink, .. } = &mut self.transport {
            while !sink.terminate(cipher)? {
                write_out(&mut self.stream, cipher, limit).await?;
            }
            write_out(&mut self.stream, cipher, limit).await?;
        }
        within(limit, self.stream.shutdown()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{shared, Flow};
    use tokio::io::{duplex, DuplexStream};

    fn driver(pool: BufferPool, handler: SharedHandler, settings: DriverSettings) -> Arc<Driver> {
        Arc::new(Driver::new(
            handler,
            Dispatcher::default(),
            pool,
            ExchangeSettings::default(),
            settings,
        ))
    }

    fn hello() -> SharedHandler {
        shared(|ex: &mut Exchange| -> Result<Flow> {
            ex.send(StatusCode::OK, "hello")?;
            Ok(Flow::Done)
        })
    }

    async fn run(driver: Arc<Driver>, input: &[u8]) -> String {
        let (mut client, server): (DuplexStream, DuplexStream) = duplex(64 * 1024);
        let task = tokio::spawn(async move { driver.serve(server, ConnectionId::new(), None).await });
        client.write_all(input).await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        task.await.unwrap().unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn pipelined_requests_are_answered_in_order() {
        let pool = BufferPool::new(4096, 8);
        let out = run(
            driver(pool.clone(), hello(), DriverSettings::default()),
            b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(out.ends_with("hello"));
        assert_eq!(pool.live(), 0);
    }

    #[tokio::test]
    async fn malformed_head_gets_400() {
        let pool = BufferPool::new(4096, 8);
        let out = run(driver(pool, hello(), DriverSettings::default()), b"NOT HTTP\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", out);
    }

    #[tokio::test]
    async fn oversized_head_gets_431() {
        let pool = BufferPool::new(4096, 8);
        let mut settings = DriverSettings::default();
        settings.head_limits.max_header_bytes = 64;
        let mut request = b"GET / HTTP/1.1\r\nX-Long: ".to_vec();
        request.extend(std::iter::repeat(b'a').take(200));
        request.extend_from_slice(b"\r\n\r\n");
        let out = run(driver(pool, hello(), settings), &request).await;
        assert!(out.starts_with("HTTP/1.1 431 Request Header Fields Too Large\r\n"), "{}", out);
    }

    #[tokio::test]
    async fn handler_failure_answers_500_and_closes() {
        let pool = BufferPool::new(4096, 8);
        let failing = shared(|_: &mut Exchange| -> Result<Flow> { Err(ErrorKind::Io.into()) });
        let out = run(driver(pool, failing, DriverSettings::default()), b"GET / HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{}", out);
    }

    #[tokio::test]
    async fn idle_connection_closes_silently() {
        let pool = BufferPool::new(4096, 8);
        let mut settings = DriverSettings::default();
        settings.idle_timeout = Duration::from_millis(50);
        let driver = driver(pool.clone(), hello(), settings);

        let (mut client, server) = duplex(1024);
        let task = tokio::spawn(async move { driver.serve(server, ConnectionId::new(), None).await });
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        task.await.unwrap().unwrap();
        assert!(out.is_empty());
        assert_eq!(pool.live(), 0);
    }
}
