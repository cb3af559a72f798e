//! IPv6 decoder. Extension headers are skipped, not decoded.

use std::net::Ipv6Addr;

use etherparse::Ipv6HeaderSlice;
use smallvec::SmallVec;

use super::ethernet::ethertype;
use super::{FieldValue, Ipv6Layer, Layer, ParseContext, ParseResult, Protocol};

/// Next Header values for extension headers.
pub mod next_header {
    pub const HOP_BY_HOP: u8 = 0;
    pub const ROUTING: u8 = 43;
    pub const FRAGMENT: u8 = 44;
    pub const AH: u8 = 51;
    pub const DESTINATION: u8 = 60;
    pub const MOBILITY: u8 = 135;
}

/// IPv6 decoder.
#[derive(Debug, Clone, Copy)]
pub struct Ipv6Protocol;

/// Walk the extension header chain.
///
/// Returns (upper-layer protocol, bytes consumed, saw fragment header), or
/// `None` when a header runs past the buffer.
fn skip_extension_headers(first: u8, data: &[u8]) -> Option<(u8, usize, bool)> {
    let mut offset = 0;
    let mut current = first;
    let mut fragmented = false;

    loop {
        let rest = &data[offset..];
        let len = match current {
            next_header::HOP_BY_HOP
            | next_header::ROUTING
            | next_header::DESTINATION
            | next_header::MOBILITY => (usize::from(*rest.get(1)?) + 1) * 8,
            // Fixed 8 bytes
            next_header::FRAGMENT => {
                fragmented = true;
                8
            }
            // AH length is in 4-octet units, minus 2
            next_header::AH => (usize::from(*rest.get(1)?) + 2) * 4,
            _ => return Some((current, offset, fragmented)),
        };
        if rest.len() < len {
            return None;
        }
        current = rest[0];
        offset += len;
    }
}

impl Protocol for Ipv6Protocol {
    fn name(&self) -> &'static str {
        "ipv6"
    }

    fn display_name(&self) -> &'static str {
        "IPv6"
    }

    fn can_parse(&self, context: &ParseContext) -> Option<u32> {
        match context.hint("ethertype") {
            Some(et) if et == u64::from(ethertype::IPV6) => Some(100),
            _ => None,
        }
    }

    fn parse<'a>(&self, data: &'a [u8], _context: &ParseContext) -> ParseResult<'a> {
        let ipv6 = match Ipv6HeaderSlice::from_slice(data) {
            Ok(ipv6) => ipv6,
            Err(e) => return ParseResult::error(format!("IPv6 parse error: {e}"), data),
        };

        let base_len = ipv6.slice().len();
        let end = (base_len + usize::from(ipv6.payload_length())).min(data.len());
        let payload = &data[base_len..end];

        let mut layer = Ipv6Layer {
            source: Ipv6Addr::from(ipv6.source()),
            destination: Ipv6Addr::from(ipv6.destination()),
            next_header: ipv6.next_header().0,
            hop_limit: ipv6.hop_limit(),
            payload_length: ipv6.payload_length(),
        };

        let mut fields = SmallVec::new();
        fields.push(("hop_limit", FieldValue::UInt8(layer.hop_limit)));
        fields.push(("payload_length", FieldValue::UInt16(layer.payload_length)));
        fields.push(("src_ip", FieldValue::ipv6(&ipv6.source())));
        fields.push(("dst_ip", FieldValue::ipv6(&ipv6.destination())));

        let Some((upper, consumed, fragmented)) = skip_extension_headers(layer.next_header, payload)
        else {
            return ParseResult::partial(
                Layer::Ipv6(layer),
                fields,
                payload,
                "IPv6 extension header exceeds packet".to_string(),
            );
        };
        layer.next_header = upper;
        fields.push(("next_header", FieldValue::UInt8(upper)));

        let mut child_hints = SmallVec::new();
        child_hints.push(("ip_version", 6));
        if fragmented {
            child_hints.push(("fragment", 1));
        } else {
            child_hints.push(("ip_protocol", u64::from(upper)));
        }

        ParseResult::success(Layer::Ipv6(layer), fields, &payload[consumed..], child_hints)
    }

    fn child_protocols(&self) -> &[&'static str] {
        &["tcp", "udp"]
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["ethernet", "vlan"]
    }
}
