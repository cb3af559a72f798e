//! ARP decoder (Ethernet/IPv4 only).

use std::net::Ipv4Addr;

use smallvec::SmallVec;

use super::ethernet::ethertype;
use super::{ArpLayer, FieldValue, Layer, ParseContext, ParseResult, PayloadMode, Protocol};

/// ARP operation codes.
pub mod operation {
    pub const REQUEST: u16 = 1;
    pub const REPLY: u16 = 2;
}

const ARP_ETHERNET_IPV4_LEN: usize = 28;

/// ARP decoder.
#[derive(Debug, Clone, Copy)]
pub struct ArpProtocol;

fn mac_at(data: &[u8], at: usize) -> [u8; 6] {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&data[at..at + 6]);
    mac
}

fn ipv4_at(data: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[at], data[at + 1], data[at + 2], data[at + 3])
}

impl Protocol for ArpProtocol {
    fn name(&self) -> &'static str {
        "arp"
    }

    fn display_name(&self) -> &'static str {
        "ARP"
    }

    fn can_parse(&self, context: &ParseContext) -> Option<u32> {
        match context.hint("ethertype") {
            Some(et) if et == u64::from(ethertype::ARP) => Some(100),
            _ => None,
        }
    }

    fn parse<'a>(&self, data: &'a [u8], _context: &ParseContext) -> ParseResult<'a> {
        if data.len() < ARP_ETHERNET_IPV4_LEN {
            return ParseResult::error(format!("ARP packet too short: {} bytes", data.len()), data);
        }

        let hardware_type = u16::from_be_bytes([data[0], data[1]]);
        let protocol_type = u16::from_be_bytes([data[2], data[3]]);
        if hardware_type != 1 || protocol_type != ethertype::IPV4 || data[4] != 6 || data[5] != 4 {
            return ParseResult::error(
                format!("unsupported ARP hardware/protocol pair {hardware_type}/{protocol_type:#06x}"),
                data,
            );
        }

        let arp = ArpLayer {
            operation: u16::from_be_bytes([data[6], data[7]]),
            sender_mac: mac_at(data, 8),
            sender_ip: ipv4_at(data, 14),
            target_mac: mac_at(data, 18),
            target_ip: ipv4_at(data, 24),
        };

        let operation_name = match arp.operation {
            operation::REQUEST => "Request",
            operation::REPLY => "Reply",
            _ => "Unknown",
        };

        let mut fields = SmallVec::new();
        fields.push(("operation", FieldValue::UInt16(arp.operation)));
        fields.push(("operation_name", FieldValue::Str(operation_name)));
        fields.push(("sender_mac", FieldValue::MacAddr(arp.sender_mac)));
        fields.push(("sender_ip", FieldValue::ipv4(&data[14..18])));
        fields.push(("target_mac", FieldValue::MacAddr(arp.target_mac)));
        fields.push(("target_ip", FieldValue::ipv4(&data[24..28])));

        // Anything past 28 bytes is link padding.
        ParseResult::success(
            Layer::Arp(arp),
            fields,
            &data[ARP_ETHERNET_IPV4_LEN..],
            SmallVec::new(),
        )
    }

    fn payload_mode(&self) -> PayloadMode {
        PayloadMode::None
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["ethernet", "vlan"]
    }
}
