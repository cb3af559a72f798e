//! Fuzz target for capture file parsing.
//!
//! Malformed PCAP/PCAPNG input must end in `Ok(None)` or an error, never a
//! panic or a hang.

#![no_main]

use std::io::Cursor;

use flowsleuth::capture::CaptureReader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(mut reader) = CaptureReader::new(Cursor::new(data)) {
        while let Ok(Some(_unit)) = reader.next_unit() {}
    }
});
