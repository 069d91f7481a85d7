//! Property tests: chunked framing survives any write pattern and any read split.

use proptest::prelude::*;
use sluice::conduit::{ChunkedSink, ChunkedSource, RawSink, RawSource, Read, ReadConduit, Wire, WriteConduit};
use sluice::BufferPool;

/// Frame `pieces` through a chunked sink, draining the wire whenever it fills.
fn encode(pool: &BufferPool, pieces: &[Vec<u8>]) -> Vec<u8> {
    let mut wire = Wire::new(pool).unwrap();
    let mut sink = WriteConduit::Chunked(ChunkedSink::new(pool.checkout().unwrap(), WriteConduit::Raw(RawSink::new())));
    let mut out = Vec::new();
    for piece in pieces {
        let mut rest = &piece[..];
        while !rest.is_empty() {
            let n = sink.transfer(&mut wire, rest).unwrap();
            if n == 0 {
                out.extend_from_slice(&wire.take_output());
            }
            rest = &rest[n..];
        }
    }
    while !sink.terminate(&mut wire).unwrap() {
        out.extend_from_slice(&wire.take_output());
    }
    out.extend_from_slice(&wire.take_output());
    out
}

/// Feed `encoded` in slices of at most `step` bytes and read until the body ends.
/// Returns the body and whatever followed it on the wire.
fn decode(pool: &BufferPool, encoded: &[u8], step: usize) -> (Vec<u8>, Vec<u8>) {
    let mut wire = Wire::new(pool).unwrap();
    let mut source = ReadConduit::Chunked(ChunkedSource::new(ReadConduit::Raw(RawSource::new()), false, 1024));
    let mut body = Vec::new();
    let mut offset = 0;
    let mut buf = [0u8; 97];
    loop {
        match source.transfer(&mut wire, &mut buf).unwrap() {
            Read::Data(n) => body.extend_from_slice(&buf[..n]),
            Read::Eof => break,
            Read::Pending => {
                assert!(offset < encoded.len(), "decoder stalled with all input fed");
                let end = (offset + step).min(encoded.len());
                offset += wire.feed(&encoded[offset..end]);
            }
        }
    }
    let mut rest = wire.inbound().to_vec();
    rest.extend_from_slice(&encoded[offset..]);
    (body, rest)
}

proptest! {
    #[test]
    fn chunked_framing_preserves_bytes(
        pieces in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..600), 0..12),
        buffer_size in 32usize..300,
        step in 1usize..64,
    ) {
        let pool = BufferPool::new(buffer_size, 16);
        let mut encoded = encode(&pool, &pieces);
        encoded.extend_from_slice(b"NEXT");

        let (body, rest) = decode(&pool, &encoded, step);
        prop_assert_eq!(body, pieces.concat());
        prop_assert_eq!(rest, b"NEXT".to_vec());
        prop_assert_eq!(pool.live(), 0);
    }
}
