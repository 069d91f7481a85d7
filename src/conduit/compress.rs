//! Response compression (gzip / deflate) as a write-side conduit.

use flate2::{Compress, Compression, Crc, FlushCompress, Status};

use super::{drain_into, Wire, WriteConduit};
use crate::buffer::PooledBuffer;
use crate::error::{Error, ErrorKind, Result};

/// Minimal gzip member header: no name, no mtime, unknown OS.
const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0, 0, 0, 0, 0, 0, 0xff];

/// Room the deflater needs to make progress on a finish or sync flush.
const MIN_ROOM: usize = 64;

/// Supported content codings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
    Deflate,
}

impl Encoding {
    /// Token used in `Content-Encoding` / `Accept-Encoding`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
        }
    }

    /// Parse a coding token, case-insensitively.
    pub fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("gzip") || token.eq_ignore_ascii_case("x-gzip") {
            Some(Encoding::Gzip)
        } else if token.eq_ignore_ascii_case("deflate") {
            Some(Encoding::Deflate)
        } else {
            None
        }
    }
}

/// Compresses writes before handing them to the inner conduit.
pub struct CompressingSink {
    encoding: Encoding,
    compress: Compress,
    crc: Crc,
    pending: PooledBuffer,
    header_written: bool,
    finished: bool,
    inner: Box<WriteConduit>,
}

impl std::fmt::Debug for CompressingSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressingSink")
            .field("encoding", &self.encoding)
            .field("pending", &self.pending.len())
            .field("finished", &self.finished)
            .finish()
    }
}

impl CompressingSink {
    pub fn new(encoding: Encoding, level: u32, pending: PooledBuffer, inner: WriteConduit) -> Self {
        // gzip wraps raw deflate itself; "deflate" is the zlib format.
        let zlib_header = encoding == Encoding::Deflate;
        Self {
            encoding,
            compress: Compress::new(Compression::new(level.min(9)), zlib_header),
            crc: Crc::new(),
            pending,
            header_written: false,
            finished: false,
            inner: Box::new(inner),
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub(crate) fn inner(&self) -> &WriteConduit {
        &self.inner
    }

    fn drain(&mut self, wire: &mut Wire) -> Result<()> {
        drain_into(&mut self.pending, &mut self.inner, wire)
    }

    fn room(&self) -> usize {
        self.pending.capacity_limit().saturating_sub(self.pending.len())
    }

    fn write_header(&mut self) {
        if !self.header_written {
            if self.encoding == Encoding::Gzip {
                self.pending.extend_from_slice(&GZIP_HEADER);
            }
            self.header_written = true;
        }
    }

    /// Runs the deflater into the free tail of `pending`. Returns bytes of input consumed.
    fn deflate(&mut self, input: &[u8], flush: FlushCompress) -> Result<(usize, Status)> {
        let start = self.pending.len();
        let room = self.room();
        self.pending.resize(start + room, 0);
        let (in_before, out_before) = (self.compress.total_in(), self.compress.total_out());
        let status = self.compress.compress(input, &mut self.pending[start..], flush);
        let produced = (self.compress.total_out() - out_before) as usize;
        self.pending.truncate(start + produced);
        let status = status.map_err(|e| Error::with_source(ErrorKind::Io, e))?;
        Ok(((self.compress.total_in() - in_before) as usize, status))
    }

    pub fn transfer(&mut self, wire: &mut Wire, src: &[u8]) -> Result<usize> {
        if self.finished {
            return Err(Error::with_source(
                ErrorKind::Io,
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "write after terminate"),
            ));
        }
        self.drain(wire)?;
        if !self.pending.is_empty() || src.is_empty() {
            return Ok(0);
        }
        self.write_header();
        let (consumed, _) = self.deflate(src, FlushCompress::None)?;
        if self.encoding == Encoding::Gzip {
            self.crc.update(&src[..consumed]);
        }
        self.drain(wire)?;
        Ok(consumed)
    }

    /// Emits everything compressed so far with a sync flush.
    pub fn flush(&mut self, wire: &mut Wire) -> Result<bool> {
        if !self.finished && self.header_written {
            loop {
                self.drain(wire)?;
                if self.room() < MIN_ROOM {
                    return Ok(false);
                }
                let room = self.room();
                let before = self.pending.len();
                self.deflate(&[], FlushCompress::Sync)?;
                // Output that did not fill the room means the deflater has nothing left.
                if self.pending.len() - before < room {
                    break;
                }
            }
        }
        self.drain(wire)?;
        Ok(self.pending.is_empty() && self.inner.flush(wire)?)
    }

    /// Finishes the stream (plus the gzip trailer) and terminates the inner conduit.
    pub fn terminate(&mut self, wire: &mut Wire) -> Result<bool> {
        while !self.finished {
            self.drain(wire)?;
            if self.room() < MIN_ROOM {
                return Ok(false);
            }
            self.write_header();
            let (_, status) = self.deflate(&[], FlushCompress::Finish)?;
            if status == Status::StreamEnd {
                self.finished = true;
                if self.encoding == Encoding::Gzip {
                    let sum = self.crc.sum().to_le_bytes();
                    let amount = self.crc.amount().to_le_bytes();
                    self.pending.extend_from_slice(&sum);
                    self.pending.extend_from_slice(&amount);
                }
            }
        }
        self.drain(wire)?;
        if !self.pending.is_empty() {
            return Ok(false);
        }
        self.inner.terminate(wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit::test_support::{pool, wire};
    use crate::conduit::RawSink;
    use std::io::Read as _;

    fn compress_all(encoding: Encoding, payload: &[u8], wire_size: usize) -> Vec<u8> {
        let pool = pool(256);
        let mut sink = WriteConduit::Compressed(CompressingSink::new(
            encoding,
            6,
            pool.checkout().unwrap(),
            WriteConduit::Raw(RawSink::new()),
        ));
        let mut wire = wire(wire_size);
        let mut out = Vec::new();
        let mut written = 0;
        while written < payload.len() {
            written += sink.transfer(&mut wire, &payload[written..]).unwrap();
            out.extend_from_slice(&wire.take_output());
        }
        while !sink.terminate(&mut wire).unwrap() {
            out.extend_from_slice(&wire.take_output());
        }
        out.extend_from_slice(&wire.take_output());
        out
    }

    fn payload() -> Vec<u8> {
        (0..20_000u32).flat_map(|i| (i % 251).to_string().into_bytes()).collect()
    }

    #[test]
    fn gzip_output_decodes() {
        let payload = payload();
        let out = compress_all(Encoding::Gzip, &payload, 128);
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(&out[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, payload);
        assert!(out.len() < payload.len());
    }

    #[test]
    fn deflate_output_is_zlib() {
        let payload = payload();
        let out = compress_all(Encoding::Deflate, &payload, 512);
        let mut decoded = Vec::new();
        flate2::read::ZlibDecoder::new(&out[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn empty_body_is_still_a_valid_stream() {
        let out = compress_all(Encoding::Gzip, b"", 128);
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(&out[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn token_parsing() {
        assert_eq!(Encoding::from_token("GZIP"), Some(Encoding::Gzip));
        assert_eq!(Encoding::from_token("deflate"), Some(Encoding::Deflate));
        assert_eq!(Encoding::from_token("br"), None);
    }
}
