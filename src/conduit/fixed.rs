//! Fixed-length framing: exactly N bytes in each direction.

use super::{Read, ReadConduit, Wire, WriteConduit};
use crate::error::{FramingError, Result};

/// Accepts exactly `length` bytes, then nothing more.
#[derive(Debug)]
pub struct FixedLengthSink {
    remaining: u64,
    inner: Box<WriteConduit>,
}

impl FixedLengthSink {
    pub fn new(length: u64, inner: WriteConduit) -> Self {
        Self {
            remaining: length,
            inner: Box::new(inner),
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub(crate) fn inner(&self) -> &WriteConduit {
        &self.inner
    }

    /// Writes are clamped to the remaining count; a write past the end fails.
    pub fn transfer(&mut self, wire: &mut Wire, src: &[u8]) -> Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            return Err(FramingError::LengthOverflow.into());
        }
        let allowed = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        let n = self.inner.transfer(wire, &src[..src.len().min(allowed)])?;
        self.remaining -= n as u64;
        Ok(n)
    }

    /// Fails when fewer than the declared bytes were written.
    pub fn terminate(&mut self, wire: &mut Wire) -> Result<bool> {
        if self.remaining > 0 {
            return Err(FramingError::LengthUnderflow {
                remaining: self.remaining,
            }
            .into());
        }
        self.inner.terminate(wire)
    }

    pub fn flush(&mut self, wire: &mut Wire) -> Result<bool> {
        self.inner.flush(wire)
    }
}

/// Yields exactly `length` bytes, then EOF, leaving any following bytes on the wire.
#[derive(Debug)]
pub struct FixedLengthSource {
    remaining: u64,
    inner: Box<ReadConduit>,
}

impl FixedLengthSource {
    pub fn new(length: u64, inner: ReadConduit) -> Self {
        Self {
            remaining: length,
            inner: Box::new(inner),
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub(crate) fn inner(&self) -> &ReadConduit {
        &self.inner
    }

    pub fn transfer(&mut self, wire: &mut Wire, dst: &mut [u8]) -> Result<Read> {
        if self.remaining == 0 {
            return Ok(Read::Eof);
        }
        if dst.is_empty() {
            return Ok(Read::Data(0));
        }
        let allowed = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        let len = dst.len().min(allowed);
        match self.inner.transfer(wire, &mut dst[..len])? {
            Read::Data(n) => {
                self.remaining -= n as u64;
                Ok(Read::Data(n))
            }
            Read::Pending => Ok(Read::Pending),
            Read::Eof => Err(FramingError::PrematureEof.into()),
        }
    }

    pub fn terminate(&mut self, wire: &mut Wire) -> Result<bool> {
        self.inner.terminate(wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit::test_support::{read_all, wire};
    use crate::conduit::{RawSink, RawSource};
    use crate::error::ErrorKind;

    fn sink(length: u64) -> WriteConduit {
        WriteConduit::FixedLength(FixedLengthSink::new(length, WriteConduit::Raw(RawSink::new())))
    }

    #[test]
    fn exact_length_terminates_cleanly() {
        let mut wire = wire(64);
        let mut sink = sink(5);
        assert_eq!(sink.transfer(&mut wire, b"hello").unwrap(), 5);
        assert!(sink.terminate(&mut wire).unwrap());
        assert_eq!(&wire.take_output()[..], b"hello");
    }

    #[test]
    fn extra_byte_is_an_overflow() {
        let mut wire = wire(64);
        let mut sink = sink(5);
        // The first write is clamped; the extra byte is refused on the next write.
        assert_eq!(sink.transfer(&mut wire, b"hello!").unwrap(), 5);
        let err = sink.transfer(&mut wire, b"!").unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Framing(FramingError::LengthOverflow));
    }

    #[test]
    fn short_body_is_an_underflow() {
        let mut wire = wire(64);
        let mut sink = sink(5);
        sink.transfer(&mut wire, b"hel").unwrap();
        let err = sink.terminate(&mut wire).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Framing(FramingError::LengthUnderflow { remaining: 2 })
        );
    }

    #[test]
    fn source_stops_at_length_and_leaves_the_rest() {
        let mut wire = wire(64);
        wire.feed(b"helloGET /next");
        let mut source =
            ReadConduit::FixedLength(FixedLengthSource::new(5, ReadConduit::Raw(RawSource::new())));
        assert_eq!(read_all(&mut source, &mut wire).unwrap(), b"hello");
        assert_eq!(&wire.inbound()[..], b"GET /next");
    }

    #[test]
    fn source_fails_on_early_close() {
        let mut wire = wire(64);
        wire.feed(b"hel");
        wire.mark_read_closed();
        let mut source =
            ReadConduit::FixedLength(FixedLengthSource::new(5, ReadConduit::Raw(RawSource::new())));
        let err = read_all(&mut source, &mut wire).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Framing(FramingError::PrematureEof));
    }
}
