//! Chunked transfer coding.
//!
//! Write side frames every accepted slice as one chunk
//! (`{len:x}\r\n{data}\r\n`) and terminates with the zero chunk.
//! Read side is a byte-accurate state machine: framing lines are consumed
//! one byte at a time so bytes of a pipelined request are never taken.

use std::fmt::Write as _;

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

use super::{drain_into, Read, ReadConduit, Wire, WriteConduit};
use crate::buffer::PooledBuffer;
use crate::error::{Error, ErrorKind, FramingError, Result};

/// Room reserved in the pending buffer for the size line and CRLFs.
const FRAME_OVERHEAD: usize = 20;

/// Longest accepted chunk-size line (extensions included).
pub const MAX_CHUNK_LINE: usize = 4096;

const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Frames writes as chunks.
#[derive(Debug)]
pub struct ChunkedSink {
    pending: PooledBuffer,
    terminating: bool,
    inner: Box<WriteConduit>,
}

impl ChunkedSink {
    /// `pending` holds framed bytes the inner conduit has not yet taken.
    pub fn new(pending: PooledBuffer, inner: WriteConduit) -> Self {
        Self {
            pending,
            terminating: false,
            inner: Box::new(inner),
        }
    }

    pub(crate) fn inner(&self) -> &WriteConduit {
        &self.inner
    }

    fn max_payload(&self) -> usize {
        self.pending.capacity_limit().saturating_sub(FRAME_OVERHEAD).max(1)
    }

    fn drain(&mut self, wire: &mut Wire) -> Result<()> {
        drain_into(&mut self.pending, &mut self.inner, wire)
    }

    /// Frames up to one chunk's worth of `src`. Returns 0 while an earlier chunk is still pending.
    pub fn transfer(&mut self, wire: &mut Wire, src: &[u8]) -> Result<usize> {
        if self.terminating {
            return Err(Error::with_source(
                ErrorKind::Io,
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "write after terminate"),
            ));
        }
        self.drain(wire)?;
        if !self.pending.is_empty() || src.is_empty() {
            return Ok(0);
        }

        let n = src.len().min(self.max_payload());
        let _ = write!(&mut *self.pending, "{:x}\r\n", n);
        self.pending.extend_from_slice(&src[..n]);
        self.pending.extend_from_slice(b"\r\n");
        self.drain(wire)?;
        Ok(n)
    }

    /// Appends the last chunk once, then keeps draining until the inner conduit terminates.
    pub fn terminate(&mut self, wire: &mut Wire) -> Result<bool> {
        if !self.terminating {
            self.drain(wire)?;
            if !self.pending.is_empty() {
                return Ok(false);
            }
            self.pending.extend_from_slice(LAST_CHUNK);
            self.terminating = true;
        }
        self.drain(wire)?;
        if !self.pending.is_empty() {
            return Ok(false);
        }
        self.inner.terminate(wire)
    }

    pub fn flush(&mut self, wire: &mut Wire) -> Result<bool> {
        self.drain(wire)?;
        Ok(self.pending.is_empty() && self.inner.flush(wire)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

/// Decodes a chunked body.
#[derive(Debug)]
pub struct ChunkedSource {
    state: ChunkState,
    line: Vec<u8>,
    surface_trailers: bool,
    max_trailer_bytes: usize,
    trailer_bytes: usize,
    trailers: HeaderMap,
    inner: Box<ReadConduit>,
}

impl ChunkedSource {
    /// Trailer fields are collected only when `surface_trailers` is set; otherwise they are discarded.
    pub fn new(inner: ReadConduit, surface_trailers: bool, max_trailer_bytes: usize) -> Self {
        Self {
            state: ChunkState::Size,
            line: Vec::new(),
            surface_trailers,
            max_trailer_bytes,
            trailer_bytes: 0,
            trailers: HeaderMap::new(),
            inner: Box::new(inner),
        }
    }

    pub(crate) fn inner(&self) -> &ReadConduit {
        &self.inner
    }

    /// Trailers seen after the last chunk, when surfacing is enabled and the body is complete.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        if self.surface_trailers && self.state == ChunkState::Done {
            Some(&self.trailers)
        } else {
            None
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Reads one CRLF-terminated line of at most `limit` bytes, line ending excluded.
    /// `Ok(None)` means the line is still incomplete.
    fn read_line(&mut self, wire: &mut Wire, limit: usize, overflow: FramingError) -> Result<Option<Vec<u8>>> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.transfer(wire, &mut byte)? {
                Read::Data(0) | Read::Pending => return Ok(None),
                Read::Eof => return Err(FramingError::PrematureEof.into()),
                Read::Data(_) => {
                    if byte[0] == b'\n' {
                        let mut line = std::mem::take(&mut self.line);
                        if line.last() == Some(&b'\r') {
                            line.pop();
                        }
                        return Ok(Some(line));
                    }
                    // The CR of the line ending may sit one past the limit.
                    let room = if byte[0] == b'\r' { limit.saturating_add(1) } else { limit };
                    if self.line.len() >= room {
                        return Err(overflow.into());
                    }
                    self.line.push(byte[0]);
                }
            }
        }
    }

    pub fn transfer(&mut self, wire: &mut Wire, dst: &mut [u8]) -> Result<Read> {
        loop {
            match self.state {
                ChunkState::Done => return Ok(Read::Eof),
                ChunkState::Size => {
                    let Some(line) = self.read_line(wire, MAX_CHUNK_LINE, FramingError::ChunkLineTooLong)? else {
                        return Ok(Read::Pending);
                    };
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    if dst.is_empty() {
                        return Ok(Read::Data(0));
                    }
                    let allowed = usize::try_from(remaining).unwrap_or(usize::MAX);
                    let len = dst.len().min(allowed);
                    return match self.inner.transfer(wire, &mut dst[..len])? {
                        Read::Data(n) => {
                            let left = remaining - n as u64;
                            self.state = if left == 0 {
                                ChunkState::DataEnd
                            } else {
                                ChunkState::Data(left)
                            };
                            Ok(Read::Data(n))
                        }
                        Read::Pending => Ok(Read::Pending),
                        Read::Eof => Err(FramingError::PrematureEof.into()),
                    };
                }
                ChunkState::DataEnd => {
                    let Some(line) = self.read_line(wire, 0, FramingError::MissingChunkTerminator)? else {
                        return Ok(Read::Pending);
                    };
                    if !line.is_empty() {
                        return Err(FramingError::MissingChunkTerminator.into());
                    }
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    let limit = self.max_trailer_bytes.saturating_sub(self.trailer_bytes);
                    let Some(line) = self.read_line(wire, limit, FramingError::TrailersTooLarge)? else {
                        return Ok(Read::Pending);
                    };
                    if line.is_empty() {
                        self.state = ChunkState::Done;
                        continue;
                    }
                    self.trailer_bytes += line.len() + 2;
                    if self.surface_trailers {
                        let (name, value) = parse_trailer(&line)?;
                        self.trailers.append(name, value);
                    }
                }
            }
        }
    }

    pub fn terminate(&mut self, wire: &mut Wire) -> Result<bool> {
        self.inner.terminate(wire)
    }
}

/// Parses `1*HEXDIG [ ; extensions ]`.
fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let digits = line.split(|b| *b == b';').next().unwrap_or_default();
    let digits = std::str::from_utf8(digits)
        .map_err(|_| FramingError::InvalidChunkSize)?
        .trim_matches(|c| c == ' ' || c == '\t');
    if digits.is_empty() || digits.len() > 16 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(FramingError::InvalidChunkSize.into());
    }
    u64::from_str_radix(digits, 16).map_err(|_| FramingError::InvalidChunkSize.into())
}

fn parse_trailer(line: &[u8]) -> Result<(HeaderName, HeaderValue)> {
    let colon = line
        .iter()
        .position(|b| *b == b':')
        .ok_or(FramingError::MalformedHead)?;
    let name = HeaderName::from_bytes(&line[..colon]).map_err(|_| FramingError::MalformedHead)?;
    let value = trim_ows(&line[colon + 1..]);
    let value = HeaderValue::from_bytes(value).map_err(|_| FramingError::MalformedHead)?;
    Ok((name, value))
}

fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit::test_support::{pool, read_all, wire};
    use crate::conduit::{RawSink, RawSource};

    fn sink(buffer_size: usize) -> WriteConduit {
        let pool = pool(buffer_size);
        WriteConduit::Chunked(ChunkedSink::new(
            pool.checkout().unwrap(),
            WriteConduit::Raw(RawSink::new()),
        ))
    }

    fn source(surface_trailers: bool) -> ReadConduit {
        ReadConduit::Chunked(ChunkedSource::new(
            ReadConduit::Raw(RawSource::new()),
            surface_trailers,
            1024,
        ))
    }

    #[test]
    fn frames_one_chunk_per_write() {
        let mut wire = wire(128);
        let mut sink = sink(128);
        assert_eq!(sink.transfer(&mut wire, b"hello").unwrap(), 5);
        assert!(sink.terminate(&mut wire).unwrap());
        assert_eq!(&wire.take_output()[..], b"5\r\nhello\r\n0\r\n\r\n");
    }

    #[test]
    fn partial_acceptance_preserves_order() {
        // A 16-byte wire forces the framed chunk to be pending across drains.
        let mut wire = wire(16);
        let mut sink = sink(64);
        let payload = b"abcdefghijklmnopqrstuvwxyz";
        let mut written = 0;
        let mut out = Vec::new();
        while written < payload.len() {
            let n = sink.transfer(&mut wire, &payload[written..]).unwrap();
            written += n;
            out.extend_from_slice(&wire.take_output());
        }
        while !sink.terminate(&mut wire).unwrap() {
            out.extend_from_slice(&wire.take_output());
        }
        out.extend_from_slice(&wire.take_output());

        let mut decode_wire = self::wire(256);
        decode_wire.feed(&out);
        let mut source = source(false);
        assert_eq!(read_all(&mut source, &mut decode_wire).unwrap(), payload);
    }

    #[test]
    fn decodes_chunks_and_leaves_pipelined_bytes() {
        let mut wire = wire(128);
        wire.feed(b"3;ext=1\r\nabc\r\n2\r\nde\r\n0\r\n\r\nGET / HTTP/1.1\r\n");
        let mut source = source(false);
        assert_eq!(read_all(&mut source, &mut wire).unwrap(), b"abcde");
        assert_eq!(&wire.inbound()[..], b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn resumes_across_partial_input() {
        let mut wire = wire(64);
        let mut source = source(false);
        let mut out = Vec::new();
        for piece in [&b"a"[..], b"\r", b"\n0123456789", b"\r\n", b"0\r\n", b"\r\n"] {
            wire.feed(piece);
            out.extend(read_all(&mut source, &mut wire).unwrap());
        }
        assert_eq!(out, b"0123456789");
        let mut buf = [0u8; 4];
        assert_eq!(source.transfer(&mut wire, &mut buf).unwrap(), Read::Eof);
    }

    #[test]
    fn trailers_are_surfaced_when_enabled() {
        let mut wire = wire(128);
        wire.feed(b"1\r\na\r\n0\r\nX-Checksum: abc\r\n\r\n");
        let mut source = source(true);
        assert_eq!(read_all(&mut source, &mut wire).unwrap(), b"a");
        let trailers = source.trailers().unwrap();
        assert_eq!(trailers["x-checksum"], "abc");
    }

    #[test]
    fn trailers_are_discarded_by_default() {
        let mut wire = wire(128);
        wire.feed(b"0\r\nX-Checksum: abc\r\n\r\n");
        let mut source = source(false);
        assert!(read_all(&mut source, &mut wire).unwrap().is_empty());
        assert!(source.trailers().is_none());
        assert!(wire.inbound().is_empty());
    }

    fn bounded_source(max_trailer_bytes: usize) -> ReadConduit {
        ReadConduit::Chunked(ChunkedSource::new(
            ReadConduit::Raw(RawSource::new()),
            true,
            max_trailer_bytes,
        ))
    }

    #[test]
    fn trailers_may_fill_the_budget_exactly() {
        // "X-A: 123456789" plus its CRLF is 16 bytes.
        let mut wire = wire(128);
        wire.feed(b"0\r\nX-A: 123456789\r\n\r\n");
        let mut source = bounded_source(16);
        assert!(read_all(&mut source, &mut wire).unwrap().is_empty());
        let mut buf = [0u8; 4];
        assert_eq!(source.transfer(&mut wire, &mut buf).unwrap(), Read::Eof);
        assert_eq!(source.trailers().unwrap()["x-a"], "123456789");
    }

    #[test]
    fn trailers_over_budget_are_rejected() {
        let mut wire = wire(128);
        wire.feed(b"0\r\nX-A: 1234567890123456\r\n\r\n");
        let err = read_all(&mut bounded_source(16), &mut wire).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Framing(FramingError::TrailersTooLarge));
    }

    #[test]
    fn rejects_bad_size_line() {
        let mut wire = wire(64);
        wire.feed(b"zz\r\n");
        let err = read_all(&mut source(false), &mut wire).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Framing(FramingError::InvalidChunkSize));
    }

    #[test]
    fn rejects_missing_data_terminator() {
        let mut wire = wire(64);
        wire.feed(b"2\r\nabXY");
        let err = read_all(&mut source(false), &mut wire).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Framing(FramingError::MissingChunkTerminator));
    }

    #[test]
    fn early_close_is_premature_eof() {
        let mut wire = wire(64);
        wire.feed(b"5\r\nab");
        wire.mark_read_closed();
        let err = read_all(&mut source(false), &mut wire).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Framing(FramingError::PrematureEof));
    }

    #[test]
    fn size_parsing() {
        assert_eq!(parse_chunk_size(b"ff").unwrap(), 255);
        assert_eq!(parse_chunk_size(b"A ; name=value").unwrap(), 10);
        assert!(parse_chunk_size(b"").is_err());
        assert!(parse_chunk_size(b"-1").is_err());
        assert!(parse_chunk_size(b"11111111111111111").is_err());
    }
}
