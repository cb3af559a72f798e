//! IPv4 decoder.

use std::net::Ipv4Addr;

use etherparse::Ipv4HeaderSlice;
use smallvec::SmallVec;

use super::ethernet::ethertype;
use super::{FieldValue, Ipv4Layer, Layer, ParseContext, ParseResult, Protocol};

/// IPv4 decoder.
///
/// The payload handed to the next layer is trimmed to the header's total
/// length so link-layer padding never reaches transport decoders. Pieces of
/// a fragmented datagram carry a `fragment` hint instead of `ip_protocol`;
/// the dispatcher reassembles them before transport decoding.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Protocol;

impl Protocol for Ipv4Protocol {
    fn name(&self) -> &'static str {
        "ipv4"
    }

    fn display_name(&self) -> &'static str {
        "IPv4"
    }

    fn can_parse(&self, context: &ParseContext) -> Option<u32> {
        match context.hint("ethertype") {
            Some(et) if et == u64::from(ethertype::IPV4) => Some(100),
            _ => None,
        }
    }

    fn parse<'a>(&self, data: &'a [u8], _context: &ParseContext) -> ParseResult<'a> {
        let ipv4 = match Ipv4HeaderSlice::from_slice(data) {
            Ok(ipv4) => ipv4,
            Err(e) => return ParseResult::error(format!("IPv4 parse error: {e}"), data),
        };

        let header_len = ipv4.slice().len();
        let total_len = usize::from(ipv4.total_len());
        let fragment_offset = ipv4.fragments_offset().value() * 8;

        let layer = Ipv4Layer {
            source: Ipv4Addr::from(ipv4.source()),
            destination: Ipv4Addr::from(ipv4.destination()),
            protocol: ipv4.protocol().0,
            ttl: ipv4.ttl(),
            identification: ipv4.identification(),
            dont_fragment: ipv4.dont_fragment(),
            more_fragments: ipv4.more_fragments(),
            fragment_offset,
            total_length: ipv4.total_len(),
            header_length: header_len as u16,
        };

        let mut fields = SmallVec::new();
        fields.push(("ttl", FieldValue::UInt8(layer.ttl)));
        fields.push(("protocol", FieldValue::UInt8(layer.protocol)));
        fields.push(("identification", FieldValue::UInt16(layer.identification)));
        fields.push(("total_length", FieldValue::UInt16(layer.total_length)));
        if layer.is_fragment() {
            fields.push(("fragment_offset", FieldValue::UInt16(fragment_offset)));
            fields.push(("more_fragments", FieldValue::Bool(layer.more_fragments)));
        }
        fields.push(("src_ip", FieldValue::ipv4(&ipv4.source())));
        fields.push(("dst_ip", FieldValue::ipv4(&ipv4.destination())));

        let mut child_hints = SmallVec::new();
        child_hints.push(("ip_version", 4));
        if layer.is_fragment() {
            child_hints.push(("fragment", 1));
        } else {
            child_hints.push(("ip_protocol", u64::from(layer.protocol)));
        }

        if total_len < header_len {
            return ParseResult::partial(
                Layer::Ipv4(layer),
                fields,
                &data[header_len..],
                format!("IPv4 total length {total_len} shorter than header {header_len}"),
            );
        }

        // A capture snap length may cut the datagram short; keep what we have.
        let end = total_len.min(data.len());
        let mut result = ParseResult::success(
            Layer::Ipv4(layer),
            fields,
            &data[header_len..end],
            child_hints,
        );
        if total_len > data.len() {
            result
                .fields
                .push(("truncated", FieldValue::UInt16((total_len - data.len()) as u16)));
        }
        result
    }

    fn child_protocols(&self) -> &[&'static str] {
        &["tcp", "udp"]
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["ethernet", "vlan"]
    }
}
