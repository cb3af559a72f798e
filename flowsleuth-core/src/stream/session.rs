//! TCP session state machine.

use std::net::SocketAddr;

use bytes::Bytes;
use smallvec::SmallVec;
use tracing::debug;

use super::{seq_add, Direction, Endpoints, TcpStream};
use crate::error::SessionError;
use crate::protocol::{ApplicationProtocol, TcpLayer};

/// Lifecycle of a [`TcpSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingSyn,
    AwaitingSynAck,
    AwaitingAck,
    Established,
    /// At least one FIN seen.
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::AwaitingSyn => "awaiting_syn",
            SessionState::AwaitingSynAck => "awaiting_syn_ack",
            SessionState::AwaitingAck => "awaiting_ack",
            SessionState::Established => "established",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

/// Port-based protocol candidates plus the protocol a handler confirmed.
#[derive(Debug, Clone, Default)]
pub struct ProtocolGuesser {
    candidates: SmallVec<[ApplicationProtocol; 2]>,
    confirmed: Option<ApplicationProtocol>,
}

impl ProtocolGuesser {
    /// Candidates for a server port: registered handler protocols first,
    /// then the well-known default list.
    pub fn from_port(server_port: u16, registered: &[ApplicationProtocol]) -> Self {
        let mut candidates: SmallVec<[ApplicationProtocol; 2]> = registered
            .iter()
            .copied()
            .filter(|p| p.default_ports().contains(&server_port))
            .collect();
        if let Some(well_known) = ApplicationProtocol::from_port(server_port) {
            if !candidates.contains(&well_known) {
                candidates.push(well_known);
            }
        }
        Self {
            candidates,
            confirmed: None,
        }
    }

    pub fn candidates(&self) -> &[ApplicationProtocol] {
        &self.candidates
    }

    pub fn confirm(&mut self, protocol: ApplicationProtocol) {
        self.confirmed = Some(protocol);
    }

    pub fn confirmed(&self) -> Option<ApplicationProtocol> {
        self.confirmed
    }

    /// Confirmed protocol, else the first port-based candidate.
    pub fn best(&self) -> ApplicationProtocol {
        self.confirmed
            .or_else(|| self.candidates.first().copied())
            .unwrap_or(ApplicationProtocol::Unknown)
    }
}

/// Assign client and server roles to a flow whose handshake was missed.
///
/// Order: a registered handler's port (destination first), then the
/// well-known port list (destination first), then the lower port is the
/// server. Equal ports make the destination the server. The guess is never
/// revisited.
pub fn guess_roles(
    src: SocketAddr,
    dst: SocketAddr,
    registered: &[ApplicationProtocol],
) -> Endpoints {
    let as_server = |server: SocketAddr, client: SocketAddr| Endpoints { client, server };
    let handler_port = |port: u16| registered.iter().any(|p| p.default_ports().contains(&port));
    let well_known = |port: u16| ApplicationProtocol::from_port(port).is_some();

    if handler_port(dst.port()) {
        as_server(dst, src)
    } else if handler_port(src.port()) {
        as_server(src, dst)
    } else if well_known(dst.port()) {
        as_server(dst, src)
    } else if well_known(src.port()) {
        as_server(src, dst)
    } else if src.port() < dst.port() {
        as_server(src, dst)
    } else {
        as_server(dst, src)
    }
}

/// What applying a packet did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketOutcome {
    pub direction: Direction,
    /// Novel payload bytes accepted by the reassembler.
    pub novel_bytes: usize,
    /// The session reached `Closed` on this packet.
    pub closed: bool,
    /// The close was caused by RST.
    pub reset: bool,
}

/// Snapshot of session identity for handlers and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub client: SocketAddr,
    pub server: SocketAddr,
    pub protocol: ApplicationProtocol,
    pub truncated: bool,
    pub start_frame: u64,
    pub start_time_us: i64,
}

/// Per-direction FIN bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
struct FinState {
    /// Sequence number the FIN occupies.
    seq: Option<u32>,
    acked: bool,
}

/// One bidirectional TCP flow.
#[derive(Debug)]
pub struct TcpSession {
    endpoints: Endpoints,
    state: SessionState,
    truncated: bool,
    syn_seen: bool,
    syn_ack_seen: bool,
    client_fin: FinState,
    server_fin: FinState,
    /// Client to server bytes.
    to_server: TcpStream,
    /// Server to client bytes.
    to_client: TcpStream,
    guesser: ProtocolGuesser,
    start_frame: u64,
    start_time_us: i64,
    packets: u64,
}

impl TcpSession {
    /// Session for a flow whose SYN is about to be applied.
    pub fn new(
        client: SocketAddr,
        server: SocketAddr,
        registered: &[ApplicationProtocol],
        max_out_of_order: usize,
        start_frame: u64,
        start_time_us: i64,
    ) -> Self {
        Self {
            endpoints: Endpoints { client, server },
            state: SessionState::AwaitingSyn,
            truncated: false,
            syn_seen: false,
            syn_ack_seen: false,
            client_fin: FinState::default(),
            server_fin: FinState::default(),
            to_server: TcpStream::new(max_out_of_order),
            to_client: TcpStream::new(max_out_of_order),
            guesser: ProtocolGuesser::from_port(server.port(), registered),
            start_frame,
            start_time_us,
            packets: 0,
        }
    }

    /// Session inferred from a mid-stream packet from `src` to `dst`.
    /// Roles come from [`guess_roles`]; the session starts established.
    pub fn truncated(
        src: SocketAddr,
        dst: SocketAddr,
        registered: &[ApplicationProtocol],
        max_out_of_order: usize,
        start_frame: u64,
        start_time_us: i64,
    ) -> Self {
        let roles = guess_roles(src, dst, registered);
        Self::resumed(
            roles.client,
            roles.server,
            registered,
            max_out_of_order,
            start_frame,
            start_time_us,
        )
    }

    /// Session joined mid-flow whose roles are already known, e.g. from a
    /// SYN-ACK whose SYN was not captured.
    pub fn resumed(
        client: SocketAddr,
        server: SocketAddr,
        registered: &[ApplicationProtocol],
        max_out_of_order: usize,
        start_frame: u64,
        start_time_us: i64,
    ) -> Self {
        let mut session = Self::new(client, server, registered, max_out_of_order, start_frame, start_time_us);
        session.state = SessionState::Established;
        session.truncated = true;
        session
    }

    pub fn client(&self) -> SocketAddr {
        self.endpoints.client
    }

    pub fn server(&self) -> SocketAddr {
        self.endpoints.server
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, SessionState::Established | SessionState::Closing)
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn syn_seen(&self) -> bool {
        self.syn_seen
    }

    pub fn syn_ack_seen(&self) -> bool {
        self.syn_ack_seen
    }

    /// Sequence number of the FIN sent in `direction`, if any.
    pub fn fin_seq(&self, direction: Direction) -> Option<u32> {
        self.fin(direction).seq
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn start_frame(&self) -> u64 {
        self.start_frame
    }

    pub fn start_time_us(&self) -> i64 {
        self.start_time_us
    }

    pub fn guesser(&self) -> &ProtocolGuesser {
        &self.guesser
    }

    /// Record the protocol a handler recognized on this flow.
    pub fn confirm_protocol(&mut self, protocol: ApplicationProtocol) {
        self.guesser.confirm(protocol);
    }

    pub fn protocol(&self) -> ApplicationProtocol {
        self.guesser.best()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            client: self.endpoints.client,
            server: self.endpoints.server,
            protocol: self.protocol(),
            truncated: self.truncated,
            start_frame: self.start_frame,
            start_time_us: self.start_time_us,
        }
    }

    pub fn stream(&self, direction: Direction) -> &TcpStream {
        match direction {
            Direction::ToServer => &self.to_server,
            Direction::ToClient => &self.to_client,
        }
    }

    pub fn stream_mut(&mut self, direction: Direction) -> &mut TcpStream {
        match direction {
            Direction::ToServer => &mut self.to_server,
            Direction::ToClient => &mut self.to_client,
        }
    }

    fn fin(&self, direction: Direction) -> &FinState {
        match direction {
            Direction::ToServer => &self.client_fin,
            Direction::ToClient => &self.server_fin,
        }
    }

    fn fin_mut(&mut self, direction: Direction) -> &mut FinState {
        match direction {
            Direction::ToServer => &mut self.client_fin,
            Direction::ToClient => &mut self.server_fin,
        }
    }

    fn check_endpoints(
        &self,
        src: SocketAddr,
        dst: SocketAddr,
        expected: Direction,
        step: &'static str,
    ) -> Result<(), SessionError> {
        match self.endpoints.direction(src, dst) {
            None => Err(SessionError::WrongSession),
            Some(d) if d != expected => Err(SessionError::WrongSender {
                step,
                expected: match expected {
                    Direction::ToServer => "client",
                    Direction::ToClient => "server",
                },
            }),
            Some(_) => Ok(()),
        }
    }

    fn expect_state(&self, state: SessionState, step: &'static str) -> Result<(), SessionError> {
        if self.state == state {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                step,
                state: self.state.as_str(),
            })
        }
    }

    /// Client SYN. Anchors the client stream at the ISN.
    pub fn register_syn(
        &mut self,
        src: SocketAddr,
        dst: SocketAddr,
        tcp: &TcpLayer,
    ) -> Result<(), SessionError> {
        self.check_endpoints(src, dst, Direction::ToServer, "SYN")?;
        if !tcp.flags.syn || tcp.flags.ack {
            return Err(SessionError::InvalidState {
                step: "SYN",
                state: self.state.as_str(),
            });
        }
        self.expect_state(SessionState::AwaitingSyn, "SYN")?;
        self.to_server.anchor(tcp.sequence);
        self.syn_seen = true;
        self.state = SessionState::AwaitingSynAck;
        Ok(())
    }

    /// Server SYN+ACK. Anchors the server stream at its ISN.
    pub fn register_syn_ack(
        &mut self,
        src: SocketAddr,
        dst: SocketAddr,
        tcp: &TcpLayer,
    ) -> Result<(), SessionError> {
        self.check_endpoints(src, dst, Direction::ToClient, "SYN+ACK")?;
        if !tcp.flags.syn || !tcp.flags.ack {
            return Err(SessionError::InvalidState {
                step: "SYN+ACK",
                state: self.state.as_str(),
            });
        }
        self.expect_state(SessionState::AwaitingSynAck, "SYN+ACK")?;
        self.to_client.anchor(tcp.sequence);
        self.syn_ack_seen = true;
        self.state = SessionState::AwaitingAck;
        Ok(())
    }

    /// Client ACK completing the handshake.
    pub fn register_ack(
        &mut self,
        src: SocketAddr,
        dst: SocketAddr,
        tcp: &TcpLayer,
    ) -> Result<(), SessionError> {
        self.check_endpoints(src, dst, Direction::ToServer, "ACK")?;
        if !tcp.flags.ack || tcp.flags.syn {
            return Err(SessionError::InvalidState {
                step: "ACK",
                state: self.state.as_str(),
            });
        }
        self.expect_state(SessionState::AwaitingAck, "ACK")?;
        self.state = SessionState::Established;
        Ok(())
    }

    /// Apply one TCP packet.
    ///
    /// Errors leave the session untouched.
    pub fn add_packet(
        &mut self,
        src: SocketAddr,
        dst: SocketAddr,
        tcp: &TcpLayer,
        payload: Bytes,
    ) -> Result<PacketOutcome, SessionError> {
        let direction = self
            .endpoints
            .direction(src, dst)
            .ok_or(SessionError::WrongSession)?;
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }

        let mut outcome = PacketOutcome {
            direction,
            novel_bytes: 0,
            closed: false,
            reset: false,
        };

        if tcp.flags.rst {
            self.packets += 1;
            self.close();
            outcome.closed = true;
            outcome.reset = true;
            return Ok(outcome);
        }

        if tcp.flags.syn {
            match self.state {
                SessionState::Established | SessionState::Closing => {
                    return Err(SessionError::SynAfterEstablished)
                }
                _ if tcp.flags.ack => self.register_syn_ack(src, dst, tcp)?,
                _ => self.register_syn(src, dst, tcp)?,
            }
            self.packets += 1;
            return Ok(outcome);
        }

        match self.state {
            SessionState::AwaitingAck if direction == Direction::ToClient && tcp.flags.ack => {
                // server data overtook the client's final ACK
                self.state = SessionState::Established;
            }
            SessionState::AwaitingAck => self.register_ack(src, dst, tcp)?,
            SessionState::AwaitingSynAck if tcp.flags.ack => self.resume_without_syn_ack(direction, tcp),
            SessionState::AwaitingSyn | SessionState::AwaitingSynAck => {
                return Err(SessionError::InvalidState {
                    step: "data",
                    state: self.state.as_str(),
                })
            }
            _ => {}
        }
        self.packets += 1;

        let payload_len = payload.len();
        if payload_len > 0 {
            outcome.novel_bytes = self.stream_mut(direction).add_segment(tcp.sequence, payload);
        }

        if tcp.flags.fin {
            self.fin_mut(direction).seq = Some(seq_add(tcp.sequence, payload_len));
            if self.state == SessionState::Established {
                self.state = SessionState::Closing;
            }
        }

        if tcp.flags.ack {
            let reverse = self.fin_mut(direction.reverse());
            if let Some(fin_seq) = reverse.seq {
                if tcp.acknowledgment == fin_seq.wrapping_add(1) {
                    reverse.acked = true;
                }
            }
        }

        if self.should_close() {
            self.close();
            outcome.closed = true;
        }
        Ok(outcome)
    }

    /// Join a flow whose SYN-ACK was not captured. A client packet's ACK
    /// number still anchors the server stream; otherwise the server stream
    /// anchors on its first data.
    fn resume_without_syn_ack(&mut self, direction: Direction, tcp: &TcpLayer) {
        if direction == Direction::ToServer {
            self.to_client.anchor(tcp.acknowledgment.wrapping_sub(1));
        }
        self.truncated = true;
        self.state = SessionState::Established;
        debug!(
            client = %self.endpoints.client,
            server = %self.endpoints.server,
            "SYN+ACK not captured, session resumed"
        );
    }

    /// True once every direction that sent a FIN has been reassembled up
    /// to the FIN's sequence number.
    pub fn fin_received(&self) -> bool {
        let mut any = false;
        for direction in [Direction::ToServer, Direction::ToClient] {
            if let Some(seq) = self.fin(direction).seq {
                any = true;
                if !self.stream(direction).is_caught_up_to(seq) {
                    return false;
                }
            }
        }
        any
    }

    /// Close once a FIN is acknowledged, or both sides sent one, and
    /// reassembly has caught up. Called after every packet, so a close
    /// deferred by a gap happens when the gap fills.
    fn should_close(&self) -> bool {
        if self.state != SessionState::Closing || !self.fin_received() {
            return false;
        }
        let both = self.client_fin.seq.is_some() && self.server_fin.seq.is_some();
        both || self.client_fin.acked || self.server_fin.acked
    }

    fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        if self.guesser.confirmed().is_none() {
            self.guesser.confirm(ApplicationProtocol::Unknown);
        }
        debug!(
            client = %self.endpoints.client,
            server = %self.endpoints.server,
            protocol = %self.protocol(),
            "session closed"
        );
    }

    /// Close regardless of handshake state (eviction, end of capture).
    pub fn force_close(&mut self) {
        self.close();
    }
}
