//! Conduit subsystem: non-blocking stream transformation stages.
//!
//! # Data Flow
//! ```text
//! write side (outer → inner):
//!     handler → Compressed → Chunked | FixedLength → Raw → wire.outbound
//!
//! read side (outer → inner):
//!     handler ← Chunked | FixedLength ← Raw ← wire.inbound
//!
//! TLS connections add a connection-level stack below the wire:
//!     wire (plaintext) → Encrypted → Raw → socket wire (ciphertext)
//!
//! after upgrade:
//!     owner ↔ Upgraded ↔ Raw ↔ wire
//! ```
//!
//! # Design Decisions
//! - A closed set of variants behind one `transfer / terminate / flush` surface
//! - Each wrapper owns exactly one boxed inner conduit; chains are never shared
//! - The connection's [`Wire`] is passed down every call instead of being
//!   aliased by the raw conduits, so a chain is plain owned data and moves
//!   between threads together with its exchange
//! - A write returning 0 means "would block"; the driver drains the wire and
//!   the caller retries

pub mod chunked;
pub mod compress;
pub mod fixed;
pub mod raw;
pub mod tls;
pub mod upgraded;

use bytes::{Bytes, BytesMut};

use crate::buffer::{BufferPool, PooledBuffer};
use crate::error::Result;

pub use chunked::{ChunkedSink, ChunkedSource};
pub use compress::{CompressingSink, Encoding};
pub use fixed::{FixedLengthSink, FixedLengthSource};
pub use raw::{RawSink, RawSource};
pub use tls::{TlsSession, TlsSink, TlsSource};
pub use upgraded::{UpgradedSink, UpgradedSource};

/// Result of a read-side transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Read {
    /// `n` bytes were placed in the destination.
    Data(usize),
    /// Nothing available yet; retry after the wire has been refilled.
    Pending,
    /// The stream is exhausted for this direction.
    Eof,
}

impl Read {
    /// Bytes moved, treating `Pending` and `Eof` as zero.
    pub fn bytes(&self) -> usize {
        match self {
            Read::Data(n) => *n,
            Read::Pending | Read::Eof => 0,
        }
    }
}

/// Variant tag, used for diagnostics and composition checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConduitKind {
    Raw,
    FixedLength,
    Chunked,
    Compressed,
    Encrypted,
    Upgraded,
}

/// The connection's socket-facing byte buffers.
///
/// Both buffers are checked out of the shared [`BufferPool`] for the
/// connection's lifetime and go back when the wire is dropped.
#[derive(Debug)]
pub struct Wire {
    inbound: PooledBuffer,
    outbound: PooledBuffer,
    read_closed: bool,
    write_shutdown: bool,
}

impl Wire {
    /// Check both buffers out of `pool`.
    pub fn new(pool: &BufferPool) -> Result<Self> {
        let inbound = pool.checkout()?;
        let outbound = pool.checkout()?;
        Ok(Self {
            inbound,
            outbound,
            read_closed: false,
            write_shutdown: false,
        })
    }

    /// Bytes received from the peer and not yet consumed.
    pub fn inbound(&self) -> &BytesMut {
        &self.inbound
    }

    pub(crate) fn inbound_mut(&mut self) -> &mut BytesMut {
        &mut self.inbound
    }

    /// Bytes queued for the peer.
    pub fn outbound(&self) -> &BytesMut {
        &self.outbound
    }

    pub(crate) fn outbound_mut(&mut self) -> &mut BytesMut {
        &mut self.outbound
    }

    /// Room left in the inbound buffer.
    pub fn inbound_spare(&self) -> usize {
        self.inbound.capacity_limit().saturating_sub(self.inbound.len())
    }

    /// Room left in the outbound buffer.
    pub fn outbound_spare(&self) -> usize {
        self.outbound.capacity_limit().saturating_sub(self.outbound.len())
    }

    /// Configured size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.inbound.capacity_limit()
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Append received bytes, bounded by the inbound room. Returns bytes taken.
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.inbound_spare());
        self.inbound.extend_from_slice(&bytes[..n]);
        n
    }

    /// Take everything queued for the peer.
    pub fn take_output(&mut self) -> Bytes {
        let out = Bytes::copy_from_slice(&self.outbound);
        self.outbound.clear();
        out
    }

    /// The peer will send no more bytes.
    pub fn mark_read_closed(&mut self) {
        self.read_closed = true;
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    pub(crate) fn request_write_shutdown(&mut self) {
        self.write_shutdown = true;
    }

    /// Whether a conduit asked for the write half of the socket to be closed.
    pub fn write_shutdown_requested(&self) -> bool {
        self.write_shutdown
    }
}

/// Write-side conduit variants.
#[derive(Debug)]
pub enum WriteConduit {
    Raw(RawSink),
    FixedLength(FixedLengthSink),
    Chunked(ChunkedSink),
    Compressed(CompressingSink),
    Encrypted(TlsSink),
    Upgraded(UpgradedSink),
}

impl WriteConduit {
    /// Move bytes from `src` towards the wire. Returns 0 when the chain would block.
    pub fn transfer(&mut self, wire: &mut Wire, src: &[u8]) -> Result<usize> {
        match self {
            WriteConduit::Raw(c) => c.transfer(wire, src),
            WriteConduit::FixedLength(c) => c.transfer(wire, src),
            WriteConduit::Chunked(c) => c.transfer(wire, src),
            WriteConduit::Compressed(c) => c.transfer(wire, src),
            WriteConduit::Encrypted(c) => c.transfer(wire, src),
            WriteConduit::Upgraded(c) => c.transfer(wire, src),
        }
    }

    /// Signal the end of data in this direction.
    ///
    /// Returns `true` once this conduit's trailer has been handed to the inner
    /// conduit and the inner conduit has terminated; `false` means retry after
    /// the wire has drained.
    pub fn terminate(&mut self, wire: &mut Wire) -> Result<bool> {
        match self {
            WriteConduit::Raw(c) => c.terminate(wire),
            WriteConduit::FixedLength(c) => c.terminate(wire),
            WriteConduit::Chunked(c) => c.terminate(wire),
            WriteConduit::Compressed(c) => c.terminate(wire),
            WriteConduit::Encrypted(c) => c.terminate(wire),
            WriteConduit::Upgraded(c) => c.terminate(wire),
        }
    }

    /// Push internally buffered bytes inward. Returns `true` when the chain holds nothing back.
    pub fn flush(&mut self, wire: &mut Wire) -> Result<bool> {
        match self {
            WriteConduit::Raw(c) => c.flush(wire),
            WriteConduit::FixedLength(c) => c.flush(wire),
            WriteConduit::Chunked(c) => c.flush(wire),
            WriteConduit::Compressed(c) => c.flush(wire),
            WriteConduit::Encrypted(c) => c.flush(wire),
            WriteConduit::Upgraded(c) => c.flush(wire),
        }
    }

    pub fn kind(&self) -> ConduitKind {
        match self {
            WriteConduit::Raw(_) => ConduitKind::Raw,
            WriteConduit::FixedLength(_) => ConduitKind::FixedLength,
            WriteConduit::Chunked(_) => ConduitKind::Chunked,
            WriteConduit::Compressed(_) => ConduitKind::Compressed,
            WriteConduit::Encrypted(_) => ConduitKind::Encrypted,
            WriteConduit::Upgraded(_) => ConduitKind::Upgraded,
        }
    }

    fn inner(&self) -> Option<&WriteConduit> {
        match self {
            WriteConduit::Raw(_) => None,
            WriteConduit::FixedLength(c) => Some(c.inner()),
            WriteConduit::Chunked(c) => Some(c.inner()),
            WriteConduit::Compressed(c) => Some(c.inner()),
            WriteConduit::Encrypted(c) => Some(c.inner()),
            WriteConduit::Upgraded(c) => Some(c.inner()),
        }
    }

    /// Variant tags from outermost to innermost.
    pub fn layers(&self) -> Vec<ConduitKind> {
        let mut layers = vec![self.kind()];
        let mut cursor = self.inner();
        while let Some(conduit) = cursor {
            layers.push(conduit.kind());
            cursor = conduit.inner();
        }
        layers
    }
}

/// Read-side conduit variants.
#[derive(Debug)]
pub enum ReadConduit {
    Raw(RawSource),
    FixedLength(FixedLengthSource),
    Chunked(ChunkedSource),
    Encrypted(TlsSource),
    Upgraded(UpgradedSource),
}

impl ReadConduit {
    /// Move bytes from the wire into `dst`. Never blocks.
    pub fn transfer(&mut self, wire: &mut Wire, dst: &mut [u8]) -> Result<Read> {
        match self {
            ReadConduit::Raw(c) => c.transfer(wire, dst),
            ReadConduit::FixedLength(c) => c.transfer(wire, dst),
            ReadConduit::Chunked(c) => c.transfer(wire, dst),
            ReadConduit::Encrypted(c) => c.transfer(wire, dst),
            ReadConduit::Upgraded(c) => c.transfer(wire, dst),
        }
    }

    /// Stop reading in this direction. Unread framed bytes are left on the wire.
    pub fn terminate(&mut self, wire: &mut Wire) -> Result<bool> {
        match self {
            ReadConduit::Raw(c) => c.terminate(wire),
            ReadConduit::FixedLength(c) => c.terminate(wire),
            ReadConduit::Chunked(c) => c.terminate(wire),
            ReadConduit::Encrypted(c) => c.terminate(wire),
            ReadConduit::Upgraded(c) => c.terminate(wire),
        }
    }

    /// Read sides buffer nothing on behalf of the peer; kept for interface symmetry.
    pub fn flush(&mut self, _wire: &mut Wire) -> Result<bool> {
        Ok(true)
    }

    pub fn kind(&self) -> ConduitKind {
        match self {
            ReadConduit::Raw(_) => ConduitKind::Raw,
            ReadConduit::FixedLength(_) => ConduitKind::FixedLength,
            ReadConduit::Chunked(_) => ConduitKind::Chunked,
            ReadConduit::Encrypted(_) => ConduitKind::Encrypted,
            ReadConduit::Upgraded(_) => ConduitKind::Upgraded,
        }
    }

    fn inner(&self) -> Option<&ReadConduit> {
        match self {
            ReadConduit::Raw(_) => None,
            ReadConduit::FixedLength(c) => Some(c.inner()),
            ReadConduit::Chunked(c) => Some(c.inner()),
            ReadConduit::Encrypted(c) => Some(c.inner()),
            ReadConduit::Upgraded(c) => Some(c.inner()),
        }
    }

    /// Variant tags from outermost to innermost.
    pub fn layers(&self) -> Vec<ConduitKind> {
        let mut layers = vec![self.kind()];
        let mut cursor = self.inner();
        while let Some(conduit) = cursor {
            layers.push(conduit.kind());
            cursor = conduit.inner();
        }
        layers
    }

    /// Trailer fields collected by a chunked source, when surfaced.
    pub fn trailers(&self) -> Option<&http::HeaderMap> {
        match self {
            ReadConduit::Chunked(c) => c.trailers(),
            _ => None,
        }
    }
}

/// A read side and a write side composed together.
#[derive(Debug)]
pub struct ConduitChain {
    pub source: ReadConduit,
    pub sink: WriteConduit,
}

impl ConduitChain {
    /// Raw conduits over the wire in both directions.
    pub fn raw() -> Self {
        Self {
            source: ReadConduit::Raw(RawSource::new()),
            sink: WriteConduit::Raw(RawSink::new()),
        }
    }

    /// The chain handed to an upgraded protocol: no HTTP framing, raw bytes underneath.
    pub fn upgraded(protocol: impl Into<String>) -> Self {
        let protocol = protocol.into();
        Self {
            source: ReadConduit::Upgraded(UpgradedSource::new(
                protocol.clone(),
                ReadConduit::Raw(RawSource::new()),
            )),
            sink: WriteConduit::Upgraded(UpgradedSink::new(
                protocol,
                WriteConduit::Raw(RawSink::new()),
            )),
        }
    }
}

/// Hand as much of `pending` as the inner conduit accepts; consumed bytes are removed.
pub(crate) fn drain_into(
    pending: &mut BytesMut,
    inner: &mut WriteConduit,
    wire: &mut Wire,
) -> Result<()> {
    use bytes::Buf;

    while !pending.is_empty() {
        let n = inner.transfer(wire, pending)?;
        if n == 0 {
            break;
        }
        pending.advance(n);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn wire(buffer_size: usize) -> Wire {
        let pool = BufferPool::new(buffer_size, 8);
        Wire::new(&pool).unwrap()
    }

    pub fn pool(buffer_size: usize) -> BufferPool {
        BufferPool::new(buffer_size, 16)
    }

    /// Read until EOF, moving the wire output aside whenever the reader stalls.
    pub fn read_all(source: &mut ReadConduit, wire: &mut Wire) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match source.transfer(wire, &mut buf)? {
                Read::Data(n) => out.extend_from_slice(&buf[..n]),
                Read::Pending => return Ok(out),
                Read::Eof => return Ok(out),
            }
        }
    }
}
