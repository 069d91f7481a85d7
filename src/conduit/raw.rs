//! Innermost conduits: move bytes between callers and the wire buffers.

use bytes::Buf;

use super::{Read, Wire};
use crate::error::{Error, ErrorKind, Result};

fn write_after_terminate() -> Error {
    Error::with_source(
        ErrorKind::Io,
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "write after terminate"),
    )
}

/// Writes into `wire.outbound`, bounded by the buffer size.
#[derive(Debug, Default)]
pub struct RawSink {
    terminated: bool,
}

impl RawSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transfer(&mut self, wire: &mut Wire, src: &[u8]) -> Result<usize> {
        if self.terminated {
            return Err(write_after_terminate());
        }
        let n = src.len().min(wire.outbound_spare());
        wire.outbound_mut().extend_from_slice(&src[..n]);
        Ok(n)
    }

    pub fn terminate(&mut self, _wire: &mut Wire) -> Result<bool> {
        self.terminated = true;
        Ok(true)
    }

    /// The wire is drained by the connection driver, so there is nothing to push here.
    pub fn flush(&mut self, _wire: &mut Wire) -> Result<bool> {
        Ok(true)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// Reads from `wire.inbound`.
#[derive(Debug, Default)]
pub struct RawSource {
    terminated: bool,
}

impl RawSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transfer(&mut self, wire: &mut Wire, dst: &mut [u8]) -> Result<Read> {
        if self.terminated {
            return Ok(Read::Eof);
        }
        if dst.is_empty() {
            return Ok(Read::Data(0));
        }
        let inbound = wire.inbound_mut();
        if inbound.is_empty() {
            return Ok(if wire.is_read_closed() {
                Read::Eof
            } else {
                Read::Pending
            });
        }
        let n = dst.len().min(inbound.len());
        dst[..n].copy_from_slice(&inbound[..n]);
        inbound.advance(n);
        Ok(Read::Data(n))
    }

    pub fn terminate(&mut self, _wire: &mut Wire) -> Result<bool> {
        self.terminated = true;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit::test_support::wire;

    #[test]
    fn sink_is_bounded_by_outbound_room() {
        let mut wire = wire(8);
        let mut sink = RawSink::new();
        assert_eq!(sink.transfer(&mut wire, b"0123456789").unwrap(), 8);
        assert_eq!(sink.transfer(&mut wire, b"x").unwrap(), 0);
        assert_eq!(&wire.take_output()[..], b"01234567");
        assert_eq!(sink.transfer(&mut wire, b"89").unwrap(), 2);
    }

    #[test]
    fn sink_refuses_writes_after_terminate() {
        let mut wire = wire(8);
        let mut sink = RawSink::new();
        assert!(sink.terminate(&mut wire).unwrap());
        let err = sink.transfer(&mut wire, b"late").unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Io);
    }

    #[test]
    fn source_reports_pending_then_eof() {
        let mut wire = wire(16);
        let mut source = RawSource::new();
        let mut buf = [0u8; 4];
        assert_eq!(source.transfer(&mut wire, &mut buf).unwrap(), Read::Pending);

        wire.feed(b"abcdef");
        assert_eq!(source.transfer(&mut wire, &mut buf).unwrap(), Read::Data(4));
        assert_eq!(&buf, b"abcd");
        assert_eq!(source.transfer(&mut wire, &mut buf).unwrap(), Read::Data(2));

        wire.mark_read_closed();
        assert_eq!(source.transfer(&mut wire, &mut buf).unwrap(), Read::Eof);
    }
}
