//! Passthrough conduits for a connection that left HTTP.
//!
//! No framing is applied; the protocol name is kept for diagnostics and the
//! write side half-closes the socket on terminate.

use super::{Read, ReadConduit, Wire, WriteConduit};
use crate::error::Result;

#[derive(Debug)]
pub struct UpgradedSink {
    protocol: String,
    inner: Box<WriteConduit>,
}

impl UpgradedSink {
    pub fn new(protocol: String, inner: WriteConduit) -> Self {
        Self {
            protocol,
            inner: Box::new(inner),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub(crate) fn inner(&self) -> &WriteConduit {
        &self.inner
    }

    pub fn transfer(&mut self, wire: &mut Wire, src: &[u8]) -> Result<usize> {
        self.inner.transfer(wire, src)
    }

    pub fn terminate(&mut self, wire: &mut Wire) -> Result<bool> {
        if !self.inner.terminate(wire)? {
            return Ok(false);
        }
        wire.request_write_shutdown();
        Ok(true)
    }

    pub fn flush(&mut self, wire: &mut Wire) -> Result<bool> {
        self.inner.flush(wire)
    }
}

#[derive(Debug)]
pub struct UpgradedSource {
    protocol: String,
    inner: Box<ReadConduit>,
}

impl UpgradedSource {
    pub fn new(protocol: String, inner: ReadConduit) -> Self {
        Self {
            protocol,
            inner: Box::new(inner),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub(crate) fn inner(&self) -> &ReadConduit {
        &self.inner
    }

    pub fn transfer(&mut self, wire: &mut Wire, dst: &mut [u8]) -> Result<Read> {
        self.inner.transfer(wire, dst)
    }

    pub fn terminate(&mut self, wire: &mut Wire) -> Result<bool> {
        self.inner.terminate(wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit::test_support::wire;
    use crate::conduit::{ConduitChain, ConduitKind};

    #[test]
    fn passes_bytes_through_untouched() {
        let mut wire = wire(64);
        let mut chain = ConduitChain::upgraded("X");
        assert_eq!(chain.sink.layers(), vec![ConduitKind::Upgraded, ConduitKind::Raw]);

        wire.feed(b"\x00\x01raw");
        let mut buf = [0u8; 16];
        assert_eq!(chain.source.transfer(&mut wire, &mut buf).unwrap(), Read::Data(5));
        assert_eq!(&buf[..5], b"\x00\x01raw");

        assert_eq!(chain.sink.transfer(&mut wire, b"0\r\n").unwrap(), 3);
        assert_eq!(&wire.take_output()[..], b"0\r\n");
    }

    #[test]
    fn terminate_requests_half_close() {
        let mut wire = wire(64);
        let mut chain = ConduitChain::upgraded("X");
        assert!(!wire.write_shutdown_requested());
        assert!(chain.sink.terminate(&mut wire).unwrap());
        assert!(wire.write_shutdown_requested());
    }
}
