//! UDP decoder.

use etherparse::UdpHeaderSlice;
use smallvec::SmallVec;

use super::{FieldValue, Layer, ParseContext, ParseResult, PayloadMode, Protocol, UdpLayer};

/// IP protocol number for UDP.
pub const IP_PROTO_UDP: u8 = 17;

const UDP_HEADER_LEN: usize = 8;

/// UDP decoder.
#[derive(Debug, Clone, Copy)]
pub struct UdpProtocol;

impl Protocol for UdpProtocol {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn display_name(&self) -> &'static str {
        "UDP"
    }

    fn can_parse(&self, context: &ParseContext) -> Option<u32> {
        match context.hint("ip_protocol") {
            Some(proto) if proto == u64::from(IP_PROTO_UDP) => Some(100),
            _ => None,
        }
    }

    fn parse<'a>(&self, data: &'a [u8], _context: &ParseContext) -> ParseResult<'a> {
        let udp = match UdpHeaderSlice::from_slice(data) {
            Ok(udp) => udp,
            Err(e) => return ParseResult::error(format!("UDP parse error: {e}"), data),
        };

        let layer = UdpLayer {
            source_port: udp.source_port(),
            destination_port: udp.destination_port(),
            length: udp.length(),
        };

        let mut fields = SmallVec::new();
        fields.push(("src_port", FieldValue::UInt16(layer.source_port)));
        fields.push(("dst_port", FieldValue::UInt16(layer.destination_port)));
        fields.push(("length", FieldValue::UInt16(layer.length)));

        let mut child_hints = SmallVec::new();
        child_hints.push(("src_port", u64::from(layer.source_port)));
        child_hints.push(("dst_port", u64::from(layer.destination_port)));

        // Length 0 is legal for jumbograms; otherwise trim to the datagram.
        let declared = usize::from(layer.length);
        let end = if declared >= UDP_HEADER_LEN {
            declared.min(data.len())
        } else {
            data.len()
        };

        ParseResult::success(
            Layer::Udp(layer),
            fields,
            &data[UDP_HEADER_LEN..end],
            child_hints,
        )
    }

    fn payload_mode(&self) -> PayloadMode {
        PayloadMode::Stream
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["ipv4", "ipv6"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_udp_trims_to_length() {
        let datagram = [
            0x14, 0xe9, // Src port: 5353
            0x00, 0x35, // Dst port: 53
            0x00, 0x0b, // Length: 11
            0x00, 0x00, // Checksum
            b'a', b'b', b'c', 0x00, 0x00,
        ];

        let mut context = ParseContext::new(1);
        context.set_hint("ip_protocol", 17);
        assert!(UdpProtocol.can_parse(&context).is_some());

        let result = UdpProtocol.parse(&datagram, &context);
        assert!(result.is_ok());
        assert_eq!(result.remaining, b"abc");
        assert_eq!(result.layer.ports(), Some((5353, 53)));
    }

    #[test]
    fn test_parse_udp_too_short() {
        let result = UdpProtocol.parse(&[0x00, 0x35, 0x00], &ParseContext::new(1));
        assert!(!result.is_ok());
    }
}
