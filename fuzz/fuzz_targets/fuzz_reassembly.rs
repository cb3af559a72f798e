//! Fuzz target for one TCP stream direction.
//!
//! Input is a sequence of `(offset: u16, len: u8)` records, each followed by
//! `len` payload bytes. Segments are fed at arbitrary offsets, with reads
//! interleaved, to exercise overlap trimming and out-of-order limits.

#![no_main]

use bytes::Bytes;
use flowsleuth_core::TcpStream;
use libfuzzer_sys::fuzz_target;

const ISN: u32 = 0xFFFF_FFF0;

fuzz_target!(|data: &[u8]| {
    let mut stream = TcpStream::new(8);
    stream.anchor(ISN);
    let mut rest = data;
    while rest.len() >= 3 {
        let offset = u16::from_be_bytes([rest[0], rest[1]]);
        let len = usize::from(rest[2]).min(rest.len() - 3);
        let payload = Bytes::copy_from_slice(&rest[3..3 + len]);
        rest = &rest[3 + len..];

        let seq = ISN.wrapping_add(1).wrapping_add(u32::from(offset));
        stream.add_segment(seq, payload);

        if offset % 3 == 0 {
            let window = stream.take_contiguous_window(4);
            if !window.is_empty() {
                let half = (window.len() / 2).max(1);
                assert!(stream.consume(window.first_seq(), half) <= window.len());
            }
        }
    }
});
