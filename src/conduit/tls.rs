//! TLS encryption as a connection-level conduit pair.
//!
//! The sink encrypts plaintext into the socket wire; the source decrypts
//! ciphertext from the socket wire. Both halves share one rustls session.
//! Handshake records produced while reading are queued in the session and
//! pushed out by the next sink `flush`.

use std::io::{self, Read as _, Write as _};
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::ServerConnection;

use super::{Read, ReadConduit, Wire, WriteConduit};
use crate::error::{Error, ErrorKind, Result};

/// Server session shared by the two halves of an encrypted conduit.
pub type TlsSession = Arc<Mutex<ServerConnection>>;

/// Create a shared session, bounding rustls' internal buffers to `buffer_limit` bytes.
pub fn new_session(config: Arc<rustls::ServerConfig>, buffer_limit: usize) -> Result<TlsSession> {
    let mut conn = ServerConnection::new(config)?;
    conn.set_buffer_limit(Some(buffer_limit));
    Ok(Arc::new(Mutex::new(conn)))
}

/// Adapts a write conduit to `io::Write` for `write_tls`.
struct ConduitWriter<'a> {
    conduit: &'a mut WriteConduit,
    wire: &'a mut Wire,
}

impl io::Write for ConduitWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.conduit.transfer(self.wire, buf) {
            Ok(0) if !buf.is_empty() => Err(io::ErrorKind::WouldBlock.into()),
            Ok(n) => Ok(n),
            Err(e) => Err(io::Error::other(e)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Adapts a read conduit to `io::Read` for `read_tls`.
struct ConduitReader<'a> {
    conduit: &'a mut ReadConduit,
    wire: &'a mut Wire,
}

impl io::Read for ConduitReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.conduit.transfer(self.wire, buf) {
            Ok(Read::Data(n)) => Ok(n),
            Ok(Read::Eof) => Ok(0),
            Ok(Read::Pending) => Err(io::ErrorKind::WouldBlock.into()),
            Err(e) => Err(io::Error::other(e)),
        }
    }
}

fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

/// Encrypting half.
#[derive(Debug)]
pub struct TlsSink {
    session: TlsSession,
    close_notify_sent: bool,
    inner: Box<WriteConduit>,
}

impl TlsSink {
    pub fn new(session: TlsSession, inner: WriteConduit) -> Self {
        Self {
            session,
            close_notify_sent: false,
            inner: Box::new(inner),
        }
    }

    pub(crate) fn inner(&self) -> &WriteConduit {
        &self.inner
    }

    /// Move queued TLS records into the socket wire. Returns `true` when the session has nothing queued.
    fn pump(&mut self, wire: &mut Wire) -> Result<bool> {
        let mut conn = self.session.lock();
        while conn.wants_write() {
            let mut writer = ConduitWriter {
                conduit: &mut self.inner,
                wire: &mut *wire,
            };
            match conn.write_tls(&mut writer) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if would_block(&e) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(!conn.wants_write())
    }

    pub fn transfer(&mut self, wire: &mut Wire, src: &[u8]) -> Result<usize> {
        self.pump(wire)?;
        let n = {
            let mut conn = self.session.lock();
            match conn.writer().write(src) {
                Ok(n) => n,
                Err(e) if would_block(&e) => 0,
                Err(e) => return Err(e.into()),
            }
        };
        self.pump(wire)?;
        Ok(n)
    }

    /// Sends close_notify once, then waits for every record to reach the wire.
    pub fn terminate(&mut self, wire: &mut Wire) -> Result<bool> {
        if !self.close_notify_sent {
            self.session.lock().send_close_notify();
            self.close_notify_sent = true;
        }
        if !self.pump(wire)? {
            return Ok(false);
        }
        self.inner.terminate(wire)
    }

    pub fn flush(&mut self, wire: &mut Wire) -> Result<bool> {
        Ok(self.pump(wire)? && self.inner.flush(wire)?)
    }
}

/// Decrypting half.
#[derive(Debug)]
pub struct TlsSource {
    session: TlsSession,
    eof_fed: bool,
    inner: Box<ReadConduit>,
}

impl TlsSource {
    pub fn new(session: TlsSession, inner: ReadConduit) -> Self {
        Self {
            session,
            eof_fed: false,
            inner: Box::new(inner),
        }
    }

    pub(crate) fn inner(&self) -> &ReadConduit {
        &self.inner
    }

    pub fn is_handshaking(&self) -> bool {
        self.session.lock().is_handshaking()
    }

    pub fn transfer(&mut self, wire: &mut Wire, dst: &mut [u8]) -> Result<Read> {
        let mut conn = self.session.lock();

        // Feed every ciphertext byte the wire holds (and the close, once).
        while conn.wants_read() && (!wire.inbound().is_empty() || (wire.is_read_closed() && !self.eof_fed)) {
            let mut reader = ConduitReader {
                conduit: &mut self.inner,
                wire: &mut *wire,
            };
            match conn.read_tls(&mut reader) {
                Ok(0) => {
                    self.eof_fed = true;
                    break;
                }
                Ok(_) => {}
                Err(e) if would_block(&e) => break,
                Err(e) => return Err(e.into()),
            }
            conn.process_new_packets().map_err(Error::from)?;
        }

        if dst.is_empty() {
            return Ok(Read::Data(0));
        }
        match conn.reader().read(dst) {
            Ok(0) => Ok(Read::Eof),
            Ok(n) => Ok(Read::Data(n)),
            Err(e) if would_block(&e) => {
                if self.eof_fed {
                    Ok(Read::Eof)
                } else {
                    Ok(Read::Pending)
                }
            }
            // Peer closed the socket without close_notify.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(Read::Eof),
            Err(e) => Err(Error::with_source(ErrorKind::Tls, e)),
        }
    }

    pub fn terminate(&mut self, wire: &mut Wire) -> Result<bool> {
        self.inner.terminate(wire)
    }
}
