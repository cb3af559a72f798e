//! Ethernet II decoder.

use etherparse::Ethernet2HeaderSlice;
use smallvec::SmallVec;

use super::{EthernetLayer, FieldValue, Layer, ParseContext, ParseResult, Protocol};

/// Link type constant for Ethernet.
pub const LINKTYPE_ETHERNET: u16 = 1;

/// EtherType values the decoder chain understands.
pub mod ethertype {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
    pub const VLAN: u16 = 0x8100;
    pub const IPV6: u16 = 0x86DD;
    pub const QINQ: u16 = 0x88A8;
}

/// Ethernet II decoder.
#[derive(Debug, Clone, Copy)]
pub struct EthernetProtocol;

impl Protocol for EthernetProtocol {
    fn name(&self) -> &'static str {
        "ethernet"
    }

    fn display_name(&self) -> &'static str {
        "Ethernet II"
    }

    fn can_parse(&self, context: &ParseContext) -> Option<u32> {
        if context.is_root() && context.link_type == LINKTYPE_ETHERNET {
            return Some(100);
        }
        None
    }

    fn parse<'a>(&self, data: &'a [u8], _context: &ParseContext) -> ParseResult<'a> {
        match Ethernet2HeaderSlice::from_slice(data) {
            Ok(eth) => {
                let ether_type = eth.ether_type().0;
                let layer = Layer::Ethernet(EthernetLayer {
                    source: eth.source(),
                    destination: eth.destination(),
                    ethertype: ether_type,
                });

                let mut fields = SmallVec::new();
                fields.push(("src_mac", FieldValue::MacAddr(eth.source())));
                fields.push(("dst_mac", FieldValue::MacAddr(eth.destination())));
                fields.push(("ethertype", FieldValue::UInt16(ether_type)));

                let mut child_hints = SmallVec::new();
                child_hints.push(("ethertype", u64::from(ether_type)));

                let header_len = eth.slice().len();
                ParseResult::success(layer, fields, &data[header_len..], child_hints)
            }
            Err(e) => ParseResult::error(format!("Ethernet parse error: {e}"), data),
        }
    }

    fn child_protocols(&self) -> &[&'static str] {
        &["ipv4", "ipv6", "arp", "vlan"]
    }
}
