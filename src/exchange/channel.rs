//! Handler-facing views of the request and response streams.
//!
//! A channel borrows the exchange's outermost conduit and wire for as long
//! as the handler uses it. Framing or I/O failures seen through a channel
//! mark the exchange abrupt so the connection is not reused.

use bytes::{Buf, Bytes};
use http::HeaderMap;

use super::state::{Flag, Flags};
use crate::conduit::{ConduitKind, Read, ReadConduit, Wire, WriteConduit};
use crate::error::Result;

fn note_failure(flags: &mut Flags, err: &crate::Error) {
    if err.is_fatal_for_connection() {
        flags.insert(Flag::Abrupt);
        flags.remove(Flag::Persistent);
    }
}

/// The request body stream.
#[derive(Debug)]
pub struct RequestChannel<'a> {
    pub(super) source: &'a mut ReadConduit,
    pub(super) wire: &'a mut Wire,
    pub(super) flags: &'a mut Flags,
}

impl RequestChannel<'_> {
    /// Read body bytes into `dst`. Never blocks.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<Read> {
        if self.flags.contains(Flag::RequestTerminated) {
            return Ok(Read::Eof);
        }
        match self.source.transfer(self.wire, dst) {
            Ok(Read::Eof) => {
                self.flags.insert(Flag::RequestTerminated);
                Ok(Read::Eof)
            }
            Ok(r) => Ok(r),
            Err(e) => {
                note_failure(self.flags, &e);
                Err(e)
            }
        }
    }

    /// Append everything currently readable to `out`, up to `limit` bytes in total.
    ///
    /// Returns `true` once the body is complete.
    pub fn read_available(&mut self, out: &mut Vec<u8>, limit: usize) -> Result<bool> {
        let mut buf = [0u8; 4096];
        loop {
            let room = limit.saturating_sub(out.len()).min(buf.len());
            if room == 0 {
                return Ok(self.is_finished());
            }
            match self.read(&mut buf[..room])? {
                Read::Data(n) => out.extend_from_slice(&buf[..n]),
                Read::Pending => return Ok(false),
                Read::Eof => return Ok(true),
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.flags.contains(Flag::RequestTerminated)
    }

    /// Trailer fields of a chunked body, when surfacing is enabled and the body is complete.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.source.trailers()
    }

    /// Conduit variants from outermost to innermost.
    pub fn layers(&self) -> Vec<ConduitKind> {
        self.source.layers()
    }
}

/// The response body stream.
#[derive(Debug)]
pub struct ResponseChannel<'a> {
    pub(super) sink: &'a mut WriteConduit,
    pub(super) wire: &'a mut Wire,
    pub(super) flags: &'a mut Flags,
}

impl ResponseChannel<'_> {
    /// Write body bytes. Returns how many were accepted; 0 means retry once writable.
    pub fn write(&mut self, src: &[u8]) -> Result<usize> {
        self.sink.transfer(self.wire, src).inspect_err(|e| note_failure(self.flags, e))
    }

    /// Write from the front of `buf`, advancing it past what was accepted.
    pub fn write_buf(&mut self, buf: &mut Bytes) -> Result<usize> {
        let n = self.write(buf)?;
        buf.advance(n);
        Ok(n)
    }

    /// Push buffered bytes towards the wire. `true` when nothing is held back.
    pub fn flush(&mut self) -> Result<bool> {
        self.sink.flush(self.wire).inspect_err(|e| note_failure(self.flags, e))
    }

    /// End the body, emitting trailing framing. `true` once fully terminated; repeat on `false`.
    pub fn shutdown(&mut self) -> Result<bool> {
        if self.flags.contains(Flag::ResponseTerminated) {
            return Ok(true);
        }
        let done = self.sink.terminate(self.wire).inspect_err(|e| note_failure(self.flags, e))?;
        if done {
            self.flags.insert(Flag::ResponseTerminated);
        }
        Ok(done)
    }

    pub fn is_shut_down(&self) -> bool {
        self.flags.contains(Flag::ResponseTerminated)
    }

    /// Conduit variants from outermost to innermost.
    pub fn layers(&self) -> Vec<ConduitKind> {
        self.sink.layers()
    }
}
