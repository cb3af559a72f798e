//! Shared helpers for integration tests: synthetic TCP conversations and a
//! recording session handler.

#![allow(dead_code)]

use std::sync::Arc;

use etherparse::PacketBuilder;
use flowsleuth_core::error::HandlerError;
use flowsleuth_core::handler::{SessionContext, SessionHandler};
use flowsleuth_core::stream::{Direction, StreamWindow};
use flowsleuth_core::{ApplicationProtocol, Event, LinkType, RawUnit};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;

pub const CLIENT_IP: [u8; 4] = [192, 168, 1, 20];
pub const SERVER_IP: [u8; 4] = [192, 168, 1, 1];
pub const CLIENT_PORT: u16 = 49152;

const CLIENT_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x20];
const SERVER_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];

const CLIENT_ISN: u32 = 1_000;
const SERVER_ISN: u32 = 5_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct Flags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

impl Flags {
    pub const SYN: Flags = Flags { syn: true, ack: false, fin: false, rst: false, psh: false };
    pub const SYN_ACK: Flags = Flags { syn: true, ack: true, fin: false, rst: false, psh: false };
    pub const ACK: Flags = Flags { syn: false, ack: true, fin: false, rst: false, psh: false };
    pub const PSH_ACK: Flags = Flags { syn: false, ack: true, fin: false, rst: false, psh: true };
    pub const FIN_ACK: Flags = Flags { syn: false, ack: true, fin: true, rst: false, psh: false };
    pub const RST: Flags = Flags { syn: false, ack: false, fin: false, rst: true, psh: false };
}

/// Ethernet/IPv4/TCP frame.
#[allow(clippy::too_many_arguments)]
pub fn tcp_frame(
    src: [u8; 4],
    dst: [u8; 4],
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: Flags,
    payload: &[u8],
) -> Vec<u8> {
    let (src_mac, dst_mac) = if src == CLIENT_IP {
        (CLIENT_MAC, SERVER_MAC)
    } else {
        (SERVER_MAC, CLIENT_MAC)
    };
    let mut builder = PacketBuilder::ethernet2(src_mac, dst_mac)
        .ipv4(src, dst, 64)
        .tcp(src_port, dst_port, seq, 64240);
    if flags.syn {
        builder = builder.syn();
    }
    if flags.ack {
        builder = builder.ack(ack);
    }
    if flags.fin {
        builder = builder.fin();
    }
    if flags.rst {
        builder = builder.rst();
    }
    if flags.psh {
        builder = builder.psh();
    }
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, payload).unwrap();
    out
}

/// Ethernet/IPv4/UDP frame.
pub fn udp_frame(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    udp_frame_from(SERVER_MAC, src, dst, src_port, dst_port, payload)
}

/// Ethernet/IPv4/UDP frame with an explicit source MAC.
pub fn udp_frame_from(
    src_mac: [u8; 6],
    src: [u8; 4],
    dst: [u8; 4],
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(src_mac, CLIENT_MAC)
        .ipv4(src, dst, 64)
        .udp(src_port, dst_port);
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, payload).unwrap();
    out
}

/// One client/server TCP conversation with sequence numbers tracked on
/// both sides. Every unit it produces is 1 ms after the previous one.
pub struct Conversation {
    pub server_port: u16,
    pub client_port: u16,
    client_seq: u32,
    server_seq: u32,
    timestamp_us: i64,
}

impl Conversation {
    pub fn new(server_port: u16) -> Self {
        Self {
            server_port,
            client_port: CLIENT_PORT,
            client_seq: CLIENT_ISN,
            server_seq: SERVER_ISN,
            timestamp_us: 1_700_000_000_000_000,
        }
    }

    pub fn with_client_port(mut self, client_port: u16) -> Self {
        self.client_port = client_port;
        self
    }

    fn unit(&mut self, data: Vec<u8>) -> RawUnit {
        self.timestamp_us += 1_000;
        RawUnit::new(self.timestamp_us, LinkType::Ethernet, data)
    }

    fn from_client(&mut self, seq: u32, flags: Flags, payload: &[u8]) -> RawUnit {
        let frame = tcp_frame(
            CLIENT_IP,
            SERVER_IP,
            self.client_port,
            self.server_port,
            seq,
            self.server_seq,
            flags,
            payload,
        );
        self.unit(frame)
    }

    fn from_server(&mut self, seq: u32, flags: Flags, payload: &[u8]) -> RawUnit {
        let frame = tcp_frame(
            SERVER_IP,
            CLIENT_IP,
            self.server_port,
            self.client_port,
            seq,
            self.client_seq,
            flags,
            payload,
        );
        self.unit(frame)
    }

    /// SYN, SYN-ACK, ACK.
    pub fn handshake(&mut self) -> Vec<RawUnit> {
        let syn = self.from_client(CLIENT_ISN, Flags::SYN, b"");
        self.client_seq = CLIENT_ISN + 1;
        let syn_ack = self.from_server(SERVER_ISN, Flags::SYN_ACK, b"");
        self.server_seq = SERVER_ISN + 1;
        let ack = self.from_client(self.client_seq, Flags::ACK, b"");
        vec![syn, syn_ack, ack]
    }

    pub fn client_sends(&mut self, payload: &[u8]) -> RawUnit {
        let unit = self.from_client(self.client_seq, Flags::PSH_ACK, payload);
        self.client_seq = self.client_seq.wrapping_add(payload.len() as u32);
        unit
    }

    pub fn server_sends(&mut self, payload: &[u8]) -> RawUnit {
        let unit = self.from_server(self.server_seq, Flags::PSH_ACK, payload);
        self.server_seq = self.server_seq.wrapping_add(payload.len() as u32);
        unit
    }

    /// Client segment placed `offset` bytes into the client's data stream,
    /// without advancing the tracked sequence number.
    pub fn client_segment(&mut self, offset: usize, payload: &[u8]) -> RawUnit {
        let seq = (CLIENT_ISN + 1).wrapping_add(offset as u32);
        self.from_client(seq, Flags::PSH_ACK, payload)
    }

    /// Orderly close: client FIN, server FIN, client ACK.
    pub fn close(&mut self) -> Vec<RawUnit> {
        let client_fin = self.from_client(self.client_seq, Flags::FIN_ACK, b"");
        self.client_seq += 1;
        let server_fin = self.from_server(self.server_seq, Flags::FIN_ACK, b"");
        self.server_seq += 1;
        let last_ack = self.from_client(self.client_seq, Flags::ACK, b"");
        vec![client_fin, server_fin, last_ack]
    }

    /// Server data with no handshake seen, as if capture started mid-flow.
    pub fn server_segment(&mut self, offset: usize, payload: &[u8]) -> RawUnit {
        let seq = (SERVER_ISN + 1).wrapping_add(offset as u32);
        self.from_server(seq, Flags::PSH_ACK, payload)
    }

    pub fn server_reset(&mut self) -> RawUnit {
        self.from_server(self.server_seq, Flags::RST, b"")
    }
}

/// Session handler that keeps every byte it is offered.
#[derive(Clone)]
pub struct Recorder {
    protocol: ApplicationProtocol,
    received: Arc<Mutex<Vec<(Direction, Vec<u8>)>>>,
}

impl Recorder {
    pub fn new(protocol: ApplicationProtocol) -> Self {
        Self {
            protocol,
            received: Arc::default(),
        }
    }

    /// All bytes received in one direction, concatenated.
    pub fn stream(&self, direction: Direction) -> Vec<u8> {
        self.received
            .lock()
            .iter()
            .filter(|(d, _)| *d == direction)
            .flat_map(|(_, data)| data.iter().copied())
            .collect()
    }
}

impl SessionHandler for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn protocol(&self) -> ApplicationProtocol {
        self.protocol
    }

    fn extract(&mut self, ctx: &mut SessionContext<'_>, window: &StreamWindow) -> Result<usize, HandlerError> {
        self.received
            .lock()
            .push((ctx.direction, window.materialize().to_vec()));
        Ok(window.len())
    }

    fn reset(&mut self) {
        self.received.lock().clear();
    }
}

pub fn collect(receiver: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    std::iter::from_fn(|| receiver.try_recv().ok()).collect()
}

pub fn anomalies(events: &[Event]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::AnomalyRaised { message, .. } => Some(message.as_str()),
            _ => None,
        })
        .collect()
}
