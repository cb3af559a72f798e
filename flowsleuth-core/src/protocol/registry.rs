//! Layer decoder registry.

use super::{
    ArpProtocol, EthernetProtocol, Ipv4Protocol, Ipv6Protocol, ParseContext, ParseResult,
    TcpProtocol, UdpProtocol, VlanProtocol,
};

/// What the decode loop does with the bytes left after a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    /// Hand the remaining bytes to the best matching child decoder.
    Chain,

    /// Remaining bytes are application data for handlers and the
    /// reassembler; they become a `Payload` leaf.
    Stream,

    /// Terminal layer; nothing follows.
    None,
}

/// Core trait every layer decoder implements.
pub trait Protocol: Send + Sync {
    /// Unique identifier (e.g., "tcp").
    fn name(&self) -> &'static str;

    /// Human-readable display name.
    fn display_name(&self) -> &'static str {
        self.name()
    }

    /// Priority score if this decoder applies to `context`, higher wins.
    fn can_parse(&self, context: &ParseContext) -> Option<u32>;

    /// Decode one header from the front of `data`.
    fn parse<'a>(&self, data: &'a [u8], context: &ParseContext) -> ParseResult<'a>;

    /// Decoders that might follow this one.
    fn child_protocols(&self) -> &[&'static str] {
        &[]
    }

    fn payload_mode(&self) -> PayloadMode {
        PayloadMode::Chain
    }

    /// Decoders that can appear before this one in a chain.
    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Closed set of built-in decoders, statically dispatched.
#[derive(Debug, Clone, Copy)]
pub enum BuiltinProtocol {
    Ethernet(EthernetProtocol),
    Vlan(VlanProtocol),
    Arp(ArpProtocol),
    Ipv4(Ipv4Protocol),
    Ipv6(Ipv6Protocol),
    Tcp(TcpProtocol),
    Udp(UdpProtocol),
}

macro_rules! delegate_protocol {
    ($self:expr, $method:ident $(, $arg:expr)*) => {
        match $self {
            BuiltinProtocol::Ethernet(p) => p.$method($($arg),*),
            BuiltinProtocol::Vlan(p) => p.$method($($arg),*),
            BuiltinProtocol::Arp(p) => p.$method($($arg),*),
            BuiltinProtocol::Ipv4(p) => p.$method($($arg),*),
            BuiltinProtocol::Ipv6(p) => p.$method($($arg),*),
            BuiltinProtocol::Tcp(p) => p.$method($($arg),*),
            BuiltinProtocol::Udp(p) => p.$method($($arg),*),
        }
    };
}

impl Protocol for BuiltinProtocol {
    #[inline]
    fn name(&self) -> &'static str {
        delegate_protocol!(self, name)
    }

    #[inline]
    fn display_name(&self) -> &'static str {
        delegate_protocol!(self, display_name)
    }

    #[inline]
    fn can_parse(&self, context: &ParseContext) -> Option<u32> {
        delegate_protocol!(self, can_parse, context)
    }

    #[inline]
    fn parse<'a>(&self, data: &'a [u8], context: &ParseContext) -> ParseResult<'a> {
        delegate_protocol!(self, parse, data, context)
    }

    #[inline]
    fn child_protocols(&self) -> &[&'static str] {
        delegate_protocol!(self, child_protocols)
    }

    #[inline]
    fn payload_mode(&self) -> PayloadMode {
        delegate_protocol!(self, payload_mode)
    }

    #[inline]
    fn dependencies(&self) -> &'static [&'static str] {
        delegate_protocol!(self, dependencies)
    }
}

macro_rules! builtin_from {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for BuiltinProtocol {
                fn from(p: $ty) -> Self {
                    BuiltinProtocol::$variant(p)
                }
            }
        )*
    };
}

builtin_from! {
    Ethernet => EthernetProtocol,
    Vlan => VlanProtocol,
    Arp => ArpProtocol,
    Ipv4 => Ipv4Protocol,
    Ipv6 => Ipv6Protocol,
    Tcp => TcpProtocol,
    Udp => UdpProtocol,
}

/// Registry of decoders with priority-based selection.
#[derive(Debug, Clone, Default)]
pub struct ProtocolRegistry {
    parsers: Vec<BuiltinProtocol>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: Into<BuiltinProtocol>>(&mut self, parser: P) {
        self.parsers.push(parser.into());
    }

    /// Find the best decoder for the given context.
    #[inline]
    pub fn find_parser(&self, context: &ParseContext) -> Option<&BuiltinProtocol> {
        self.parsers
            .iter()
            .filter_map(|p| p.can_parse(context).map(|priority| (p, priority)))
            .max_by_key(|(_, priority)| *priority)
            .map(|(parser, _)| parser)
    }

    pub fn all_parsers(&self) -> impl Iterator<Item = &BuiltinProtocol> {
        self.parsers.iter()
    }

    pub fn get_parser(&self, name: &str) -> Option<&BuiltinProtocol> {
        self.parsers.iter().find(|p| p.name() == name)
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }
}
