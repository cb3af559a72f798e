//! Typed, closed set of decoded protocol layers.
//!
//! Consumers scan a frame's layers and pattern-match on [`Layer`] instead of
//! probing types at runtime. [`LayerKind`] is the fieldless tag used for
//! quick filtering.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Fieldless tag for a [`Layer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Ethernet,
    Vlan,
    Arp,
    Ipv4,
    Ipv6,
    Tcp,
    Udp,
    /// Application bytes above a transport header.
    Payload,
    /// Bytes that could not be decoded.
    Unknown,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::Ethernet => "ethernet",
            LayerKind::Vlan => "vlan",
            LayerKind::Arp => "arp",
            LayerKind::Ipv4 => "ipv4",
            LayerKind::Ipv6 => "ipv6",
            LayerKind::Tcp => "tcp",
            LayerKind::Udp => "udp",
            LayerKind::Payload => "payload",
            LayerKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetLayer {
    pub source: [u8; 6],
    pub destination: [u8; 6],
    pub ethertype: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlanLayer {
    pub vlan_id: u16,
    pub priority: u8,
    pub ethertype: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpLayer {
    pub operation: u16,
    pub sender_mac: [u8; 6],
    pub sender_ip: Ipv4Addr,
    pub target_mac: [u8; 6],
    pub target_ip: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Layer {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub identification: u16,
    pub dont_fragment: bool,
    pub more_fragments: bool,
    /// Fragment offset in bytes (already multiplied by 8).
    pub fragment_offset: u16,
    pub total_length: u16,
    pub header_length: u16,
}

impl Ipv4Layer {
    /// Whether this datagram is one piece of a fragmented datagram.
    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.fragment_offset != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Layer {
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
    /// Upper-layer protocol after extension headers.
    pub next_header: u8,
    pub hop_limit: u8,
    pub payload_length: u16,
}

/// TCP control bits relevant to session tracking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

impl TcpFlags {
    /// Compact flag string in the conventional `SAFRP` style.
    pub fn label(&self) -> String {
        let mut out = String::with_capacity(5);
        for (set, c) in [
            (self.syn, 'S'),
            (self.ack, 'A'),
            (self.fin, 'F'),
            (self.rst, 'R'),
            (self.psh, 'P'),
        ] {
            if set {
                out.push(c);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpLayer {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: u32,
    pub acknowledgment: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub header_length: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpLayer {
    pub source_port: u16,
    pub destination_port: u16,
    pub length: u16,
}

/// One decoded protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Ethernet(EthernetLayer),
    Vlan(VlanLayer),
    Arp(ArpLayer),
    Ipv4(Ipv4Layer),
    Ipv6(Ipv6Layer),
    Tcp(TcpLayer),
    Udp(UdpLayer),
    Payload,
    Unknown,
}

impl Layer {
    pub fn kind(&self) -> LayerKind {
        match self {
            Layer::Ethernet(_) => LayerKind::Ethernet,
            Layer::Vlan(_) => LayerKind::Vlan,
            Layer::Arp(_) => LayerKind::Arp,
            Layer::Ipv4(_) => LayerKind::Ipv4,
            Layer::Ipv6(_) => LayerKind::Ipv6,
            Layer::Tcp(_) => LayerKind::Tcp,
            Layer::Udp(_) => LayerKind::Udp,
            Layer::Payload => LayerKind::Payload,
            Layer::Unknown => LayerKind::Unknown,
        }
    }

    /// Source and destination address of a network layer.
    pub fn ip_endpoints(&self) -> Option<(IpAddr, IpAddr)> {
        match self {
            Layer::Ipv4(ip) => Some((IpAddr::V4(ip.source), IpAddr::V4(ip.destination))),
            Layer::Ipv6(ip) => Some((IpAddr::V6(ip.source), IpAddr::V6(ip.destination))),
            _ => None,
        }
    }

    /// Source and destination port of a transport layer.
    pub fn ports(&self) -> Option<(u16, u16)> {
        match self {
            Layer::Tcp(tcp) => Some((tcp.source_port, tcp.destination_port)),
            Layer::Udp(udp) => Some((udp.source_port, udp.destination_port)),
            _ => None,
        }
    }
}
