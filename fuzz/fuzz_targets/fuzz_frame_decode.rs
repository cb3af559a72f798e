//! Fuzz target for the layer decoder.
//!
//! Decodes the input under every supported link type, walks the lazy layer
//! chain to the end and touches the typed accessors the dispatcher uses.

#![no_main]

use bytes::Bytes;
use flowsleuth_core::{Decoder, LinkType};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let data = Bytes::copy_from_slice(data);
    for decoder in [Decoder::default(), Decoder::default().quick_parse(true)] {
        for link_type in [LinkType::Ethernet, LinkType::RawIp, LinkType::Ipv4, LinkType::Ipv6] {
            if let Ok(frame) = decoder.decode(1, 0, link_type, data.clone()) {
                for packet in frame.layers() {
                    let _ = packet.payload();
                }
                let _ = frame.ip_endpoints();
                let _ = frame.tcp();
                let _ = frame.udp();
                let _ = frame.payload().map(|p| p.payload_bytes());
            }
        }
    }
});
