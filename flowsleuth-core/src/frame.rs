//! Frames and the layer decoder.
//!
//! A [`Frame`] owns one captured buffer and a view of its protocol layers.
//! Layers form a chain (each layer's payload yields the next), and each
//! [`Packet`] records the byte range it covers inside the frame buffer, so
//! a failed decode still leaves usable offsets behind.
//!
//! Two modes are supported:
//!
//! - [`DecodeMode::Eager`] decodes the whole chain when the frame is built.
//! - [`DecodeMode::Lazy`] decodes only the root. [`Frame::layers`] walks the
//!   rest on demand and can be restarted; [`Frame::packets`] decodes the
//!   chain once and caches it.

use std::ops::Range;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use smallvec::SmallVec;

use crate::error::DecodeError;
use crate::protocol::{
    default_registry, ethertype, Ipv4Layer, Ipv6Layer, Layer, LayerKind, OwnedFieldValue,
    ParseContext, PayloadMode, Protocol, ProtocolRegistry, TcpLayer, UdpLayer,
};

/// Hard cap on the size of a single captured unit.
pub const MAX_FRAME_SIZE: usize = 262_144;

/// Upper bound on chain depth; stacked VLAN tags are the only repeat.
const MAX_LAYERS: usize = 16;

/// Link layer the frame starts with, using pcap link type numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    Ethernet,
    /// Raw IP, version taken from the first nibble.
    RawIp,
    Ipv4,
    Ipv6,
    Other(u16),
}

impl LinkType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => LinkType::Ethernet,
            101 => LinkType::RawIp,
            228 => LinkType::Ipv4,
            229 => LinkType::Ipv6,
            other => LinkType::Other(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            LinkType::Ethernet => 1,
            LinkType::RawIp => 101,
            LinkType::Ipv4 => 228,
            LinkType::Ipv6 => 229,
            LinkType::Other(value) => *value,
        }
    }
}

impl From<u16> for LinkType {
    fn from(value: u16) -> Self {
        LinkType::from_u16(value)
    }
}

/// Whether descendants are decoded at construction or on demand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeMode {
    Eager,
    #[default]
    Lazy,
}

/// A decode failure located inside a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError {
    /// Byte offset of the layer that failed.
    pub offset: usize,
    /// Decoder that reported the failure.
    pub protocol: &'static str,
    pub message: String,
}

/// One decoded layer: a typed header plus its byte range in the frame.
#[derive(Debug, Clone)]
pub struct Packet {
    /// First byte of the layer (header included).
    pub start: usize,
    /// One past the last byte covered by the layer and its payload.
    pub end: usize,
    /// Bytes taken by this layer's own header.
    pub header_len: usize,
    /// Name of the decoder that produced this layer.
    pub protocol: &'static str,
    pub layer: Layer,
    /// Display attributes.
    pub attributes: SmallVec<[(&'static str, OwnedFieldValue); 8]>,
    pub error: Option<String>,
    data: Bytes,
}

impl Packet {
    pub fn kind(&self) -> LayerKind {
        self.layer.kind()
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Header and payload bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Bytes after this layer's header.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.start + self.header_len..self.end]
    }

    /// Payload as a shared handle into the frame buffer, without copying.
    pub fn payload_bytes(&self) -> Bytes {
        self.data.slice(self.start + self.header_len..self.end)
    }

    pub fn attribute(&self, name: &str) -> Option<&OwnedFieldValue> {
        self.attributes
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }
}

/// How the next layer's bytes are to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Decode,
    Payload,
    Opaque,
}

/// Resume point for the layer walk.
#[derive(Debug, Clone)]
struct Cursor {
    ctx: ParseContext,
    start: usize,
    end: usize,
    step: Step,
    depth: usize,
}

#[derive(Debug, Default)]
struct Materialized {
    packets: Vec<Packet>,
    errors: Vec<FrameError>,
}

/// One captured unit and its decoded layers. Immutable once built.
#[derive(Debug)]
pub struct Frame {
    number: u64,
    timestamp_us: i64,
    link_type: LinkType,
    data: Bytes,
    range: Range<usize>,
    root: Packet,
    next: Option<Cursor>,
    quick_parse: bool,
    registry: Arc<ProtocolRegistry>,
    materialized: OnceLock<Materialized>,
}

impl Frame {
    /// Sequence number, 1-based and monotonic per capture.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Capture timestamp in microseconds since the Unix epoch.
    pub fn timestamp_us(&self) -> i64 {
        self.timestamp_us
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    /// Full captured buffer, including bytes outside the decoded range.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn is_quick_parse(&self) -> bool {
        self.quick_parse
    }

    /// Outermost layer, decoded at construction.
    pub fn root(&self) -> &Packet {
        &self.root
    }

    /// Walk the layer chain, root first.
    ///
    /// Each call starts a fresh walk; nothing is cached, so a consumer that
    /// stops early never pays for the layers it skipped.
    pub fn layers(&self) -> Layers<'_> {
        Layers {
            frame: self,
            pending_root: true,
            cursor: self.next.clone(),
        }
    }

    /// All layers, decoded once and cached.
    pub fn packets(&self) -> &[Packet] {
        &self.materialize().packets
    }

    /// Decode failures recorded while walking the chain. Always empty in
    /// quick-parse mode.
    pub fn errors(&self) -> &[FrameError] {
        &self.materialize().errors
    }

    /// First layer of the given kind.
    pub fn find(&self, kind: LayerKind) -> Option<&Packet> {
        self.packets().iter().find(|p| p.kind() == kind)
    }

    pub fn ipv4(&self) -> Option<Ipv4Layer> {
        self.packets().iter().find_map(|p| match p.layer {
            Layer::Ipv4(ip) => Some(ip),
            _ => None,
        })
    }

    pub fn ipv6(&self) -> Option<Ipv6Layer> {
        self.packets().iter().find_map(|p| match p.layer {
            Layer::Ipv6(ip) => Some(ip),
            _ => None,
        })
    }

    /// Network-layer source and destination.
    pub fn ip_endpoints(&self) -> Option<(std::net::IpAddr, std::net::IpAddr)> {
        self.packets().iter().find_map(|p| p.layer.ip_endpoints())
    }

    pub fn tcp(&self) -> Option<TcpLayer> {
        self.packets().iter().find_map(|p| match p.layer {
            Layer::Tcp(tcp) => Some(tcp),
            _ => None,
        })
    }

    pub fn udp(&self) -> Option<UdpLayer> {
        self.packets().iter().find_map(|p| match p.layer {
            Layer::Udp(udp) => Some(udp),
            _ => None,
        })
    }

    /// Application payload leaf, if any.
    pub fn payload(&self) -> Option<&Packet> {
        self.find(LayerKind::Payload)
    }

    fn materialize(&self) -> &Materialized {
        self.materialized.get_or_init(|| {
            let packets: Vec<Packet> = self.layers().collect();
            let errors = if self.quick_parse {
                Vec::new()
            } else {
                packets
                    .iter()
                    .filter_map(|p| {
                        p.error.as_ref().map(|message| FrameError {
                            offset: p.start,
                            protocol: p.protocol,
                            message: message.clone(),
                        })
                    })
                    .collect()
            };
            Materialized { packets, errors }
        })
    }

    /// Decode the layer at `cursor`, returning it and the resume point.
    fn step(&self, cursor: &Cursor) -> Option<(Packet, Option<Cursor>)> {
        decode_step(&self.registry, &self.data, cursor, self.quick_parse)
    }
}

/// Restartable, finite walk over a frame's layers.
pub struct Layers<'f> {
    frame: &'f Frame,
    pending_root: bool,
    cursor: Option<Cursor>,
}

impl Iterator for Layers<'_> {
    type Item = Packet;

    fn next(&mut self) -> Option<Packet> {
        if self.pending_root {
            self.pending_root = false;
            return Some(self.frame.root.clone());
        }
        let cursor = self.cursor.take()?;
        let (packet, next) = self.frame.step(&cursor)?;
        self.cursor = next;
        Some(packet)
    }
}

fn leaf(
    data: &Bytes,
    start: usize,
    end: usize,
    protocol: &'static str,
    layer: Layer,
    error: Option<String>,
) -> Packet {
    Packet {
        start,
        end,
        header_len: 0,
        protocol,
        layer,
        attributes: SmallVec::new(),
        error,
        data: data.clone(),
    }
}

fn decode_step(
    registry: &ProtocolRegistry,
    data: &Bytes,
    cursor: &Cursor,
    quick_parse: bool,
) -> Option<(Packet, Option<Cursor>)> {
    let Cursor {
        ctx,
        start,
        end,
        step,
        depth,
    } = cursor;
    let (start, end) = (*start, *end);
    if start >= end {
        return None;
    }

    match step {
        Step::Payload => {
            return Some((leaf(data, start, end, "payload", Layer::Payload, None), None))
        }
        Step::Opaque => {
            return Some((leaf(data, start, end, "unknown", Layer::Unknown, None), None))
        }
        Step::Decode => {}
    }

    // Fragments are reassembled before transport decoding.
    if ctx.hint("fragment").is_some() {
        return Some((leaf(data, start, end, "payload", Layer::Payload, None), None));
    }

    let Some(parser) = registry.find_parser(ctx) else {
        let error = (ctx.is_root() && !quick_parse)
            .then(|| format!("unsupported link type {}", ctx.link_type));
        return Some((leaf(data, start, end, "unknown", Layer::Unknown, error), None));
    };

    let input = &data[start..end];
    let result = parser.parse(input, ctx);

    // `remaining` is a sub-slice of `input`; recover its offset.
    let rem_offset = (result.remaining.as_ptr() as usize)
        .checked_sub(input.as_ptr() as usize)
        .filter(|off| off + result.remaining.len() <= input.len())
        .unwrap_or(input.len().saturating_sub(result.remaining.len()));
    let rem_start = start + rem_offset;
    let rem_end = rem_start + result.remaining.len();

    let error = if quick_parse { None } else { result.error.clone() };

    if result.layer == Layer::Unknown {
        // Nothing understood; the whole range is opaque.
        return Some((
            leaf(data, start, end, parser.name(), Layer::Unknown, error),
            None,
        ));
    }

    let packet = Packet {
        start,
        end: if parser.payload_mode() == PayloadMode::None {
            rem_start
        } else {
            rem_end
        },
        header_len: rem_offset,
        protocol: parser.name(),
        layer: result.layer,
        attributes: result
            .fields
            .iter()
            .map(|(name, value)| (*name, value.to_owned()))
            .collect(),
        error,
        data: data.clone(),
    };

    if depth + 1 >= MAX_LAYERS {
        return Some((packet, None));
    }

    let next_step = if result.error.is_some() {
        Step::Opaque
    } else {
        match parser.payload_mode() {
            PayloadMode::Chain => Step::Decode,
            PayloadMode::Stream => Step::Payload,
            PayloadMode::None => return Some((packet, None)),
        }
    };

    let mut next_ctx = ctx.clone();
    next_ctx.parent_protocol = Some(parser.name());
    next_ctx.hints = result.child_hints.clone();
    next_ctx.offset = rem_start;

    let next = Cursor {
        ctx: next_ctx,
        start: rem_start,
        end: rem_end,
        step: next_step,
        depth: depth + 1,
    };
    Some((packet, Some(next)))
}

/// Builds [`Frame`]s from captured buffers.
#[derive(Debug, Clone)]
pub struct Decoder {
    registry: Arc<ProtocolRegistry>,
    mode: DecodeMode,
    quick_parse: bool,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DecodeMode::Lazy)
    }
}

impl Decoder {
    pub fn new(mode: DecodeMode) -> Self {
        Self {
            registry: Arc::new(default_registry()),
            mode,
            quick_parse: false,
        }
    }

    pub fn with_registry(registry: Arc<ProtocolRegistry>, mode: DecodeMode) -> Self {
        Self {
            registry,
            mode,
            quick_parse: false,
        }
    }

    /// Suppress structured error collection.
    pub fn quick_parse(mut self, enabled: bool) -> Self {
        self.quick_parse = enabled;
        self
    }

    pub fn mode(&self) -> DecodeMode {
        self.mode
    }

    /// Decode a whole captured buffer.
    pub fn decode(
        &self,
        number: u64,
        timestamp_us: i64,
        link_type: LinkType,
        data: Bytes,
    ) -> Result<Frame, DecodeError> {
        let len = data.len();
        self.decode_range(number, timestamp_us, link_type, data, 0..len)
    }

    /// Decode the layers found in `range` of a captured buffer.
    pub fn decode_range(
        &self,
        number: u64,
        timestamp_us: i64,
        link_type: LinkType,
        data: Bytes,
        range: Range<usize>,
    ) -> Result<Frame, DecodeError> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(DecodeError::FrameTooLarge {
                size: data.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        if range.start > range.end || range.end > data.len() {
            return Err(DecodeError::RangeOutOfBounds {
                start: range.start,
                end: range.end,
                len: data.len(),
            });
        }

        let mut ctx = ParseContext::new(link_type.as_u16());
        ctx.offset = range.start;
        let root_ethertype = match link_type {
            LinkType::Ipv4 => Some(ethertype::IPV4),
            LinkType::Ipv6 => Some(ethertype::IPV6),
            LinkType::RawIp => match data.get(range.start).map(|b| b >> 4) {
                Some(4) => Some(ethertype::IPV4),
                Some(6) => Some(ethertype::IPV6),
                _ => None,
            },
            LinkType::Ethernet | LinkType::Other(_) => None,
        };
        if let Some(et) = root_ethertype {
            ctx.set_hint("ethertype", u64::from(et));
        }

        let cursor = Cursor {
            ctx,
            start: range.start,
            end: range.end,
            step: Step::Decode,
            depth: 0,
        };
        let (root, next) = decode_step(&self.registry, &data, &cursor, self.quick_parse)
            .unwrap_or_else(|| {
                let empty = leaf(&data, range.start, range.end, "unknown", Layer::Unknown, None);
                (empty, None)
            });

        let frame = Frame {
            number,
            timestamp_us,
            link_type,
            data,
            range,
            root,
            next,
            quick_parse: self.quick_parse,
            registry: Arc::clone(&self.registry),
            materialized: OnceLock::new(),
        };

        if self.mode == DecodeMode::Eager {
            frame.materialize();
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_utils::{tcp_frame, udp_frame, Flags};

    fn decode(data: Vec<u8>) -> Frame {
        Decoder::default()
            .decode(1, 0, LinkType::Ethernet, Bytes::from(data))
            .unwrap()
    }

    #[test]
    fn test_tcp_chain() {
        let frame = decode(tcp_frame(
            [10, 0, 0, 1],
            [10, 0, 0, 2],
            40000,
            80,
            1,
            0,
            Flags::ACK,
            b"GET /",
        ));

        let kinds: Vec<_> = frame.layers().map(|p| p.kind()).collect();
        assert_eq!(
            kinds,
            vec![LayerKind::Ethernet, LayerKind::Ipv4, LayerKind::Tcp, LayerKind::Payload]
        );
        assert_eq!(frame.payload().map(|p| p.bytes()), Some(&b"GET /"[..]));
        assert_eq!(frame.tcp().map(|t| t.destination_port), Some(80));
        assert!(frame.errors().is_empty());
    }

    #[test]
    fn test_child_ranges_nested() {
        let frame = decode(udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 5353, 53, b"query"));
        let packets = frame.packets();
        for pair in packets.windows(2) {
            let (parent, child) = (&pair[0], &pair[1]);
            assert!(child.start >= parent.start + parent.header_len);
            assert!(child.end <= parent.end);
        }
    }

    #[test]
    fn test_layers_restartable() {
        let frame = decode(udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, b"x"));
        let first: Vec<_> = frame.layers().map(|p| p.range()).collect();
        let second: Vec<_> = frame.layers().map(|p| p.range()).collect();
        assert_eq!(first, second);
        assert_eq!(frame.layers().take(1).count(), 1);
    }

    #[test]
    fn test_eager_materializes() {
        let data = udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, b"x");
        let frame = Decoder::new(DecodeMode::Eager)
            .decode(7, 0, LinkType::Ethernet, Bytes::from(data))
            .unwrap();
        assert!(frame.materialized.get().is_some());
        assert_eq!(frame.number(), 7);
    }

    #[test]
    fn test_lazy_defers_descendants() {
        let data = udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, b"x");
        let frame = Decoder::default()
            .decode(1, 0, LinkType::Ethernet, Bytes::from(data))
            .unwrap();
        assert!(frame.materialized.get().is_none());
        assert_eq!(frame.root().kind(), LayerKind::Ethernet);
    }

    #[test]
    fn test_malformed_layer_becomes_unknown_leaf() {
        let mut data = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, 0, 0, Flags::ACK, b"");
        // Corrupt the TCP data offset
        data[14 + 20 + 12] = 0x10;
        let frame = decode(data);

        let last = frame.packets().last().unwrap();
        assert_eq!(last.kind(), LayerKind::Unknown);
        assert_eq!(last.range(), 34..54);
        assert_eq!(frame.errors().len(), 1);
        assert_eq!(frame.errors()[0].offset, 34);
        assert_eq!(frame.errors()[0].protocol, "tcp");
    }

    #[test]
    fn test_quick_parse_suppresses_errors() {
        let mut data = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, 0, 0, Flags::ACK, b"");
        data[14 + 20 + 12] = 0x10;
        let frame = Decoder::default()
            .quick_parse(true)
            .decode(1, 0, LinkType::Ethernet, Bytes::from(data))
            .unwrap();
        assert!(frame.errors().is_empty());
        assert_eq!(frame.packets().last().map(|p| p.kind()), Some(LayerKind::Unknown));
    }

    #[test]
    fn test_frame_too_large() {
        let err = Decoder::default()
            .decode(1, 0, LinkType::Ethernet, Bytes::from(vec![0u8; MAX_FRAME_SIZE + 1]))
            .unwrap_err();
        assert!(matches!(err, DecodeError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_range_out_of_bounds() {
        let err = Decoder::default()
            .decode_range(1, 0, LinkType::Ethernet, Bytes::from_static(&[0; 10]), 4..12)
            .unwrap_err();
        assert_eq!(
            err,
            DecodeError::RangeOutOfBounds {
                start: 4,
                end: 12,
                len: 10
            }
        );
    }

    #[test]
    fn test_raw_ip_link_type() {
        let data = udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, b"raw");
        let frame = Decoder::default()
            .decode_range(1, 0, LinkType::RawIp, Bytes::from(data.clone()), 14..data.len())
            .unwrap();
        assert_eq!(frame.root().kind(), LayerKind::Ipv4);
        assert_eq!(frame.payload().map(|p| p.payload()), Some(&b"raw"[..]));
    }

    #[test]
    fn test_unsupported_link_type_is_opaque() {
        let frame = Decoder::default()
            .decode(1, 0, LinkType::Other(147), Bytes::from_static(b"opaque"))
            .unwrap();
        assert_eq!(frame.root().kind(), LayerKind::Unknown);
        assert_eq!(frame.root().bytes(), b"opaque");
        assert_eq!(frame.errors().len(), 1);
    }
}
