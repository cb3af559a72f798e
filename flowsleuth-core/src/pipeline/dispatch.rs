//! Frame consumer: everything that happens to a decoded frame.

use std::any::Any;
use std::net::{IpAddr, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, trace};

use super::PipelineConfig;
use crate::error::SessionError;
use crate::event::{Event, EventSink};
use crate::file::{AssemblerOutcome, CloseReason, FileAssemblerList, FileSink, ReconstructedFile};
use crate::fragment::FragmentCache;
use crate::frame::{Decoder, Frame, LinkType};
use crate::handler::{FrameContext, HandlerRegistry, SessionContext};
use crate::host::{HostHandle, HostRegistry, MacAddr, MacChange};
use crate::protocol::{ApplicationProtocol, Ipv4Layer, Layer, TcpLayer};
use crate::stream::{ConnectionKey, Direction, SessionHandle, SessionTable, TcpSession};

/// State owned by the frame consumer.
pub(crate) struct Dispatcher {
    config: PipelineConfig,
    hosts: Arc<HostRegistry>,
    sessions: Arc<SessionTable>,
    assemblers: Arc<FileAssemblerList>,
    fragments: Arc<FragmentCache>,
    handlers: HandlerRegistry,
    /// Protocols of the session handlers, for role and protocol guessing.
    registered: Vec<ApplicationProtocol>,
    sink: Box<dyn FileSink>,
    /// Decoder for reassembled IPv4 datagrams.
    decoder: Decoder,
    events: EventSink,
}

impl Dispatcher {
    pub(crate) fn new(
        config: PipelineConfig,
        hosts: Arc<HostRegistry>,
        sessions: Arc<SessionTable>,
        assemblers: Arc<FileAssemblerList>,
        fragments: Arc<FragmentCache>,
        handlers: HandlerRegistry,
        sink: Box<dyn FileSink>,
        events: EventSink,
    ) -> Self {
        let registered = handlers.session_protocols();
        Self {
            fragments,
            decoder: Decoder::default().quick_parse(config.quick_parse),
            config,
            hosts,
            sessions,
            assemblers,
            handlers,
            registered,
            sink,
            events,
        }
    }

    /// Process one frame end to end.
    pub(crate) fn process(&mut self, frame: Arc<Frame>) {
        if self.config.emit_frames {
            self.events.emit(Event::FrameObserved(Arc::clone(&frame)));
        }

        let (source, destination) = self.update_hosts(&frame);

        match frame.ipv4().filter(Ipv4Layer::is_fragment) {
            Some(ip) => {
                if let Some(datagram) = self.reassemble(&frame, &ip) {
                    self.dispatch_transport(&datagram, source.as_ref(), destination.as_ref());
                }
            }
            None => self.dispatch_transport(&frame, source.as_ref(), destination.as_ref()),
        }

        self.collect_evicted(frame.timestamp_us());
    }

    /// Full reset: registries, caches and handler state.
    pub(crate) fn reset(&mut self) {
        for (_, handle) in self.sessions.drain() {
            handle.lock().force_close();
        }
        self.sessions.take_evicted();
        self.assemblers.clear();
        self.assemblers.take_evicted();
        self.fragments.clear();
        self.hosts.clear();
        self.handlers.reset_all();
        debug!("pipeline reset");
    }

    /// End of capture: close every session and settle every transfer.
    pub(crate) fn flush(&mut self, timestamp_us: i64) {
        let sessions = self.sessions.drain();
        debug!(sessions = sessions.len(), "flushing sessions");
        for (_, handle) in sessions {
            self.finish_session(&handle, CloseReason::Fin, timestamp_us, false);
        }
        let outcomes = self.assemblers.drain_all();
        self.settle(outcomes, timestamp_us, false);
        self.collect_evicted(timestamp_us);
    }

    fn observe_host(&self, address: IpAddr, frame: &Frame) -> HostHandle {
        let (host, created) = self
            .hosts
            .get_or_insert(address, frame.number(), frame.timestamp_us());
        if created {
            let snapshot = host.lock().clone();
            self.events.emit(Event::HostObserved(snapshot));
        }
        host
    }

    fn note_mac(&self, host: &HostHandle, mac: MacAddr, timestamp_us: i64) {
        let (address, change) = {
            let mut guard = host.lock();
            (guard.address(), guard.set_mac(mac))
        };
        if let MacChange::New { previous } = change {
            self.events.anomaly(
                format!("MAC address of {address} changed from {previous} to {mac}"),
                timestamp_us,
            );
        }
    }

    fn update_hosts(&self, frame: &Frame) -> (Option<HostHandle>, Option<HostHandle>) {
        let timestamp_us = frame.timestamp_us();
        let mut ethernet = None;
        let mut ttl = None;
        for packet in frame.packets() {
            match packet.layer {
                Layer::Ethernet(eth) => ethernet = Some(eth),
                // outer header only; tunnelled packets carry their own TTL
                Layer::Ipv4(ip) if ttl.is_none() => ttl = Some(ip.ttl),
                Layer::Ipv6(ip) if ttl.is_none() => ttl = Some(ip.hop_limit),
                Layer::Arp(arp) if !arp.sender_ip.is_unspecified() => {
                    let host = self.observe_host(IpAddr::V4(arp.sender_ip), frame);
                    self.note_mac(&host, MacAddr(arp.sender_mac), timestamp_us);
                }
                _ => {}
            }
        }

        let Some((src, dst)) = frame.ip_endpoints() else {
            return (None, None);
        };
        let source = self.observe_host(src, frame);
        let destination = self.observe_host(dst, frame);
        {
            let mut sender = source.lock();
            sender.record_sent(frame.len(), timestamp_us);
            if let Some(ttl) = ttl {
                sender.vote_os_from_ttl(ttl);
            }
        }
        destination.lock().record_received(frame.len(), timestamp_us);
        if let Some(eth) = ethernet {
            self.note_mac(&source, MacAddr(eth.source), timestamp_us);
        }
        (Some(source), Some(destination))
    }

    fn reassemble(&self, frame: &Frame, ip: &Ipv4Layer) -> Option<Frame> {
        let payload = frame.payload()?.payload_bytes();
        let datagram = self.fragments.add_fragment(ip, payload)?;
        match self
            .decoder
            .decode(frame.number(), frame.timestamp_us(), LinkType::Ipv4, datagram)
        {
            Ok(reassembled) => {
                trace!(frame = frame.number(), id = ip.identification, "datagram reassembled");
                Some(reassembled)
            }
            Err(err) => {
                self.events.anomaly(
                    format!("reassembled datagram in frame {} not decodable: {err}", frame.number()),
                    frame.timestamp_us(),
                );
                None
            }
        }
    }

    fn dispatch_transport(
        &mut self,
        frame: &Frame,
        source: Option<&HostHandle>,
        destination: Option<&HostHandle>,
    ) {
        if let Some(tcp) = frame.tcp() {
            self.handle_tcp(frame, &tcp);
        }
        self.run_frame_handlers(frame, source, destination);
    }

    fn handle_tcp(&mut self, frame: &Frame, tcp: &TcpLayer) {
        let Some((src_ip, dst_ip)) = frame.ip_endpoints() else {
            return;
        };
        let src = SocketAddr::new(src_ip, tcp.source_port);
        let dst = SocketAddr::new(dst_ip, tcp.destination_port);
        let key = ConnectionKey::new(src, dst);

        if tcp.flags.syn && tcp.flags.ack {
            if let Some(server) = self.hosts.get(&src_ip) {
                server.lock().add_open_tcp_port(tcp.source_port);
            }
        }

        let payload = frame.payload().map(|p| p.payload_bytes()).unwrap_or_default();
        let handle = match self.sessions.get(&key) {
            Some(handle) => handle,
            None => {
                let Some(session) = self.open_session(frame, tcp, src, dst, payload.is_empty()) else {
                    return;
                };
                let resumed = tcp.flags.syn && tcp.flags.ack;
                let handle = self.sessions.insert(key, session);
                if resumed {
                    // the SYN-ACK already anchored both directions
                    return;
                }
                handle
            }
        };

        let result = handle.lock().add_packet(src, dst, tcp, payload);
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(SessionError::SynAfterEstablished) => {
                debug!(frame = frame.number(), %src, %dst, "SYN on established session ignored");
                return;
            }
            Err(err) => {
                debug!(frame = frame.number(), %src, %dst, %err, "packet not applied to session");
                return;
            }
        };

        if outcome.novel_bytes > 0 {
            self.run_session_handlers(frame, &handle, outcome.direction);
        }
        if outcome.closed {
            self.run_session_handlers(frame, &handle, outcome.direction.reverse());
            self.sessions.remove(&key);
            let reason = if outcome.reset {
                CloseReason::Reset
            } else {
                CloseReason::Fin
            };
            self.finish_session(&handle, reason, frame.timestamp_us(), false);
        }
    }

    /// New session for a packet of an unknown flow. A RST, or a bare
    /// ACK or FIN without data, opens nothing.
    fn open_session(
        &self,
        frame: &Frame,
        tcp: &TcpLayer,
        src: SocketAddr,
        dst: SocketAddr,
        empty: bool,
    ) -> Option<TcpSession> {
        if tcp.flags.rst || (empty && !tcp.flags.syn) {
            return None;
        }
        let (number, ts) = (frame.number(), frame.timestamp_us());
        let max = self.config.max_out_of_order;
        let session = match (tcp.flags.syn, tcp.flags.ack) {
            (true, false) => TcpSession::new(src, dst, &self.registered, max, number, ts),
            (true, true) => {
                let mut session = TcpSession::resumed(dst, src, &self.registered, max, number, ts);
                session.stream_mut(Direction::ToClient).anchor(tcp.sequence);
                session
                    .stream_mut(Direction::ToServer)
                    .anchor(tcp.acknowledgment.wrapping_sub(1));
                session
            }
            _ => TcpSession::truncated(src, dst, &self.registered, max, number, ts),
        };

        let info = session.info();
        debug!(
            client = %info.client,
            server = %info.server,
            truncated = info.truncated,
            protocol = %info.protocol,
            "session opened"
        );
        self.events.emit(Event::SessionObserved {
            protocol: info.protocol,
            client: info.client.ip(),
            server: info.server.ip(),
            client_port: info.client.port(),
            server_port: info.server.port(),
            is_tcp: true,
            start_frame: number,
            start_time_us: ts,
        });
        Some(session)
    }

    /// Offer the ready bytes of one direction to the first accepting
    /// session handler until it stops making progress.
    fn run_session_handlers(&mut self, frame: &Frame, handle: &SessionHandle, direction: Direction) {
        let mut info = handle.lock().info();
        let Some(index) = self
            .handlers
            .session_handlers_mut()
            .iter()
            .position(|h| h.accepts(&info))
        else {
            let dropped = handle.lock().stream_mut(direction).discard_ready();
            if dropped > 0 {
                trace!(server = %info.server, bytes = dropped, "no handler for session data");
            }
            return;
        };

        let (number, ts) = (frame.number(), frame.timestamp_us());
        let (client, _) = self.hosts.get_or_insert(info.client.ip(), number, ts);
        let (server, _) = self.hosts.get_or_insert(info.server.ip(), number, ts);
        let max = self.handlers.session_handlers_mut()[index]
            .max_window_segments()
            .max(self.config.window_segments);

        loop {
            let window = handle.lock().stream(direction).take_contiguous_window(max);
            if window.is_empty() {
                break;
            }

            let handler = &mut self.handlers.session_handlers_mut()[index];
            let name = handler.name();
            let (result, confirmed, events, files) = {
                let mut ctx = SessionContext::new(info, direction, frame, &client, &server, &self.assemblers);
                ctx.max_file_size = self.config.max_file_size;
                let result = panic::catch_unwind(AssertUnwindSafe(|| handler.extract(&mut ctx, &window)));
                (result, ctx.confirmed(), ctx.take_events(), ctx.take_files())
            };

            if let Some(protocol) = confirmed {
                info.protocol = protocol;
                handle.lock().confirm_protocol(protocol);
            }
            for event in events {
                self.events.emit(event);
            }
            for file in files {
                self.store(file);
            }

            let consumed = match result {
                Ok(Ok(consumed)) => consumed.min(window.len()),
                Ok(Err(err)) => {
                    self.events.anomaly(
                        format!("{name} handler failed on frame {number}: {err}"),
                        ts,
                    );
                    window.len()
                }
                Err(payload) => {
                    self.events.anomaly(
                        format!("{name} handler panicked on frame {number}: {}", panic_message(&payload)),
                        ts,
                    );
                    window.len()
                }
            };

            let mut session = handle.lock();
            let stream = session.stream_mut(direction);
            let progressed = if consumed > 0 {
                stream.consume(window.first_seq(), consumed)
            } else if window.segment_count() >= max {
                debug!(handler = name, frame = number, "handler stalled on a full window, dropping a segment");
                stream.remove(window.first_seq(), 1)
            } else {
                0
            };
            if progressed == 0 {
                break;
            }
        }
    }

    fn run_frame_handlers(
        &mut self,
        frame: &Frame,
        source: Option<&HostHandle>,
        destination: Option<&HostHandle>,
    ) {
        let mut events = Vec::new();
        for handler in self.handlers.frame_handlers_mut() {
            if !handler.accepts(frame) {
                continue;
            }
            let name = handler.name();
            let mut ctx = FrameContext::new(frame, source, destination, &self.hosts);
            let result = panic::catch_unwind(AssertUnwindSafe(|| handler.extract(&mut ctx)));
            events.extend(ctx.take_events());
            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("{name} handler failed on frame {}: {err}", frame.number())),
                Err(payload) => Some(format!(
                    "{name} handler panicked on frame {}: {}",
                    frame.number(),
                    panic_message(&payload)
                )),
            };
            if let Some(message) = failure {
                events.push(Event::anomaly(message, frame.timestamp_us()));
            }
        }
        for event in events {
            self.events.emit(event);
        }
    }

    /// Tell handlers the session is gone and settle its transfers.
    fn finish_session(&mut self, handle: &SessionHandle, reason: CloseReason, timestamp_us: i64, evicted: bool) {
        let info = {
            let mut session = handle.lock();
            session.force_close();
            session.info()
        };
        for handler in self.handlers.session_handlers_mut() {
            handler.session_closed(&info);
        }
        let outcomes = self.assemblers.drain_connection(info.client, info.server, reason);
        self.settle(outcomes, timestamp_us, evicted);
    }

    fn collect_evicted(&mut self, timestamp_us: i64) {
        for (_, handle) in self.sessions.take_evicted() {
            self.finish_session(&handle, CloseReason::Fin, timestamp_us, true);
        }
        let outcomes = self.assemblers.take_evicted();
        self.settle(outcomes, timestamp_us, true);
    }

    fn settle(&mut self, outcomes: Vec<AssemblerOutcome>, timestamp_us: i64, evicted: bool) {
        for outcome in outcomes {
            match outcome {
                AssemblerOutcome::Finished(file) => self.store(file),
                AssemblerOutcome::Aborted { key, assembler } => {
                    let filename = &assembler.metadata().filename;
                    if evicted {
                        self.events.anomaly(
                            format!(
                                "transfer of {filename} from {} evicted incomplete after {} bytes",
                                key.server,
                                assembler.received()
                            ),
                            timestamp_us,
                        );
                    } else {
                        debug!(%filename, server = %key.server, received = assembler.received(), "transfer aborted");
                    }
                }
                AssemblerOutcome::Discarded { key } => {
                    if evicted {
                        self.events.anomaly(
                            format!("pending transfer from {} evicted before it started", key.server),
                            timestamp_us,
                        );
                    } else {
                        trace!(server = %key.server, "pending transfer discarded");
                    }
                }
            }
        }
    }

    /// Hand a finished file to the sink and report where it went.
    fn store(&mut self, file: ReconstructedFile) {
        let meta = &file.metadata;
        match self.sink.store(&meta.path_hint, &file.data) {
            Ok(path) => {
                debug!(%path, size = file.data.len(), "file reconstructed");
                self.events.emit(Event::FileReconstructed {
                    source: meta.source,
                    destination: meta.destination,
                    path,
                    protocol: meta.protocol,
                    filename: meta.filename.clone(),
                    size: file.size() as u64,
                    timestamp_us: meta.timestamp_us,
                    details: meta.details.clone(),
                });
            }
            Err(err) => self.events.anomaly(
                format!("could not store {}: {err}", meta.path_hint),
                meta.timestamp_us,
            ),
        }
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}
