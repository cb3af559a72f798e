//! IEEE 802.1Q VLAN tag decoder.

use smallvec::SmallVec;

use super::ethernet::ethertype;
use super::{FieldValue, Layer, ParseContext, ParseResult, Protocol, VlanLayer};

/// 802.1Q VLAN tag decoder.
#[derive(Debug, Clone, Copy)]
pub struct VlanProtocol;

impl Protocol for VlanProtocol {
    fn name(&self) -> &'static str {
        "vlan"
    }

    fn display_name(&self) -> &'static str {
        "802.1Q VLAN"
    }

    fn can_parse(&self, context: &ParseContext) -> Option<u32> {
        match context.hint("ethertype") {
            Some(etype) if etype == u64::from(ethertype::VLAN) => Some(100),
            Some(etype) if etype == u64::from(ethertype::QINQ) => Some(100),
            _ => None,
        }
    }

    fn parse<'a>(&self, data: &'a [u8], _context: &ParseContext) -> ParseResult<'a> {
        // The TPID was consumed as the outer ethertype; TCI and the inner
        // ethertype remain.
        if data.len() < 4 {
            return ParseResult::error("VLAN tag too short".to_string(), data);
        }

        let tci = u16::from_be_bytes([data[0], data[1]]);
        let priority = ((tci >> 13) & 0x07) as u8;
        let vlan_id = tci & 0x0FFF;
        let inner_ethertype = u16::from_be_bytes([data[2], data[3]]);

        let layer = Layer::Vlan(VlanLayer {
            vlan_id,
            priority,
            ethertype: inner_ethertype,
        });

        let mut fields = SmallVec::new();
        fields.push(("vlan_id", FieldValue::UInt16(vlan_id)));
        fields.push(("priority", FieldValue::UInt8(priority)));
        fields.push(("inner_ethertype", FieldValue::UInt16(inner_ethertype)));

        let mut child_hints = SmallVec::new();
        child_hints.push(("ethertype", u64::from(inner_ethertype)));
        child_hints.push(("vlan_id", u64::from(vlan_id)));

        ParseResult::success(layer, fields, &data[4..], child_hints)
    }

    fn child_protocols(&self) -> &[&'static str] {
        &["ipv4", "ipv6", "arp", "vlan"]
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["ethernet", "vlan"]
    }
}
