//! Layer decoding framework.
//!
//! This module provides:
//! - [`Protocol`] trait implemented by every layer decoder
//! - [`ProtocolRegistry`] for priority-based decoder selection
//! - [`Layer`], the closed set of typed headers a frame can contain
//!
//! ## Supported Layers
//!
//! | Layer | Decoders |
//! |-------|-----------|
//! | Link | Ethernet II, 802.1Q VLAN |
//! | Network | IPv4, IPv6, ARP |
//! | Transport | TCP, UDP |
//!
//! Application protocols are not decoded here. Their bytes become a
//! `Payload` leaf and are interpreted by handlers, over the reassembled
//! stream for TCP.

mod application;
mod context;
mod field;
mod layer;
mod registry;

pub(crate) mod arp;
pub(crate) mod ethernet;
pub(crate) mod ipv4;
pub(crate) mod ipv6;
pub(crate) mod tcp;
pub(crate) mod udp;
pub(crate) mod vlan;

#[cfg(test)]
pub mod test_utils;

pub use application::ApplicationProtocol;
pub use context::{FieldEntry, HintEntry, ParseContext, ParseResult};
pub use field::{FieldValue, OwnedFieldValue};
pub use layer::{
    ArpLayer, EthernetLayer, Ipv4Layer, Ipv6Layer, Layer, LayerKind, TcpFlags, TcpLayer, UdpLayer,
    VlanLayer,
};
pub use registry::{BuiltinProtocol, PayloadMode, Protocol, ProtocolRegistry};

pub use arp::{operation as arp_operation, ArpProtocol};
pub use ethernet::{ethertype, EthernetProtocol, LINKTYPE_ETHERNET};
pub use ipv4::Ipv4Protocol;
pub use ipv6::Ipv6Protocol;
pub use tcp::{TcpProtocol, IP_PROTO_TCP};
pub use udp::{UdpProtocol, IP_PROTO_UDP};
pub use vlan::VlanProtocol;

/// Create a registry with all built-in decoders.
pub fn default_registry() -> ProtocolRegistry {
    let mut registry = ProtocolRegistry::new();

    // Layer 2
    registry.register(EthernetProtocol);
    registry.register(VlanProtocol);
    registry.register(ArpProtocol);

    // Layer 3
    registry.register(Ipv4Protocol);
    registry.register(Ipv6Protocol);

    // Layer 4
    registry.register(TcpProtocol);
    registry.register(UdpProtocol);

    registry
}
