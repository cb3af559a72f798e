//! TCP decoder.

use etherparse::TcpHeaderSlice;
use smallvec::SmallVec;

use super::{FieldValue, Layer, ParseContext, ParseResult, PayloadMode, Protocol, TcpFlags, TcpLayer};

/// IP protocol number for TCP.
pub const IP_PROTO_TCP: u8 = 6;

/// TCP decoder. Segment payload is left for the reassembler.
#[derive(Debug, Clone, Copy)]
pub struct TcpProtocol;

impl Protocol for TcpProtocol {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn display_name(&self) -> &'static str {
        "TCP"
    }

    fn can_parse(&self, context: &ParseContext) -> Option<u32> {
        match context.hint("ip_protocol") {
            Some(proto) if proto == u64::from(IP_PROTO_TCP) => Some(100),
            _ => None,
        }
    }

    fn parse<'a>(&self, data: &'a [u8], _context: &ParseContext) -> ParseResult<'a> {
        let tcp = match TcpHeaderSlice::from_slice(data) {
            Ok(tcp) => tcp,
            Err(e) => return ParseResult::error(format!("TCP parse error: {e}"), data),
        };

        let header_len = tcp.slice().len();
        let layer = TcpLayer {
            source_port: tcp.source_port(),
            destination_port: tcp.destination_port(),
            sequence: tcp.sequence_number(),
            acknowledgment: tcp.acknowledgment_number(),
            flags: TcpFlags {
                syn: tcp.syn(),
                ack: tcp.ack(),
                fin: tcp.fin(),
                rst: tcp.rst(),
                psh: tcp.psh(),
            },
            window: tcp.window_size(),
            header_length: header_len as u16,
        };

        let mut fields = SmallVec::new();
        fields.push(("src_port", FieldValue::UInt16(layer.source_port)));
        fields.push(("dst_port", FieldValue::UInt16(layer.destination_port)));
        fields.push(("seq", FieldValue::UInt32(layer.sequence)));
        fields.push(("ack", FieldValue::UInt32(layer.acknowledgment)));
        fields.push(("flags", FieldValue::OwnedString(layer.flags.label().into())));
        fields.push(("window", FieldValue::UInt16(layer.window)));

        let mut child_hints = SmallVec::new();
        child_hints.push(("src_port", u64::from(layer.source_port)));
        child_hints.push(("dst_port", u64::from(layer.destination_port)));

        ParseResult::success(Layer::Tcp(layer), fields, &data[header_len..], child_hints)
    }

    fn payload_mode(&self) -> PayloadMode {
        PayloadMode::Stream
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["ipv4", "ipv6"]
    }
}
