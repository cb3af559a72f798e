//! Pipeline behaviour: intake pressure, session bookkeeping, eviction,
//! fragments and the threaded workers.

mod common;

use common::{anomalies, collect, udp_frame_from, Conversation, Recorder, CLIENT_IP, CLIENT_PORT, SERVER_IP};
use etherparse::{EtherType, Ethernet2Header, IpFragOffset, IpNumber, Ipv4Header, PacketBuilder};
use flowsleuth_core::stream::Direction;
use flowsleuth_core::{
    ApplicationProtocol, Event, HandlerRegistry, LinkType, MemorySink, Pipeline, PipelineConfig, RawUnit,
};

fn quiet() -> PipelineConfig {
    PipelineConfig {
        emit_frames: false,
        ..Default::default()
    }
}

// ============================================================================
// Intake pressure
// ============================================================================

#[test]
fn test_full_intake_drops_with_one_anomaly_each() {
    let config = PipelineConfig {
        intake_capacity: 2,
        ..quiet()
    };
    let (pipeline, mut rx) = Pipeline::new(config, HandlerRegistry::new(), MemorySink::new());
    let mut conversation = Conversation::new(80);
    let units = conversation.handshake();

    assert!(pipeline.try_enqueue(units[0].clone()));
    assert!(pipeline.try_enqueue(units[1].clone()));
    assert_eq!(pipeline.buffer_usage(), 100);
    assert!(!pipeline.try_enqueue(units[2].clone()));

    let events = collect(&mut rx);
    let dropped = anomalies(&events);
    assert_eq!(dropped.len(), 1);
    assert!(dropped[0].starts_with("packet dropped"));

    // room again once the intake stage has run
    assert_eq!(pipeline.drain(), 2);
    assert!(pipeline.try_enqueue(units[2].clone()));
    assert_eq!(pipeline.drain(), 1);
    assert_eq!(pipeline.frames_decoded(), 3);
    assert_eq!(pipeline.anomalies().len(), 1);
}

#[test]
fn test_every_rejected_unit_is_reported() {
    let config = PipelineConfig {
        intake_capacity: 3,
        ..quiet()
    };
    let (pipeline, mut rx) = Pipeline::new(config, HandlerRegistry::new(), MemorySink::new());
    let mut conversation = Conversation::new(80);

    let mut rejected = 0;
    for _ in 0..10 {
        if !pipeline.try_enqueue(conversation.client_sends(b"x")) {
            rejected += 1;
        }
    }
    assert_eq!(rejected, 7);
    assert_eq!(pipeline.drain(), 3);
    assert_eq!(pipeline.frames_decoded(), 3);

    let events = collect(&mut rx);
    assert_eq!(anomalies(&events).len(), 7);
    assert_eq!(pipeline.anomalies().len(), 7);
    pipeline.anomalies().clear();
    assert!(pipeline.anomalies().is_empty());
}

// ============================================================================
// Sessions
// ============================================================================

#[test]
fn test_mid_stream_flow_becomes_truncated_session() {
    let recorder = Recorder::new(ApplicationProtocol::Http);
    let mut handlers = HandlerRegistry::new();
    handlers.register_session(recorder.clone());
    let (pipeline, mut rx) = Pipeline::new(quiet(), handlers, MemorySink::new());

    let mut conversation = Conversation::new(80);
    pipeline.try_enqueue(conversation.server_segment(0, b"HTTP/1.1 200 OK\r\n"));
    pipeline.try_enqueue(conversation.server_segment(17, b"\r\n"));
    pipeline.drain();

    assert_eq!(recorder.stream(Direction::ToClient), b"HTTP/1.1 200 OK\r\n\r\n");
    let observed: Vec<_> = collect(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            Event::SessionObserved {
                client_port,
                server_port,
                ..
            } => Some((client_port, server_port)),
            _ => None,
        })
        .collect();
    assert_eq!(observed, vec![(CLIENT_PORT, 80)]);

    let sessions = pipeline.sessions().drain();
    assert!(sessions[0].1.lock().is_truncated());
}

#[test]
fn test_flow_without_syn_ack_is_still_reassembled() {
    let recorder = Recorder::new(ApplicationProtocol::Http);
    let mut handlers = HandlerRegistry::new();
    handlers.register_session(recorder.clone());
    let (pipeline, _rx) = Pipeline::new(quiet(), handlers, MemorySink::new());

    let mut conversation = Conversation::new(80);
    let syn = conversation.handshake().remove(0);
    // only the SYN of the handshake was captured
    pipeline.try_enqueue(syn);
    pipeline.try_enqueue(conversation.client_sends(b"GET / HTTP/1.1\r\n\r\n"));
    pipeline.try_enqueue(conversation.server_sends(b"HTTP/1.1 200 OK\r\n\r\n"));
    pipeline.drain();

    assert_eq!(recorder.stream(Direction::ToServer), b"GET / HTTP/1.1\r\n\r\n");
    assert_eq!(recorder.stream(Direction::ToClient), b"HTTP/1.1 200 OK\r\n\r\n");
    let sessions = pipeline.sessions().drain();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].1.lock().is_truncated());
}

#[test]
fn test_sender_ttl_votes_for_os() {
    let (pipeline, _rx) = Pipeline::new(quiet(), HandlerRegistry::new(), MemorySink::new());
    let mut conversation = Conversation::new(80);
    for unit in conversation.handshake() {
        pipeline.try_enqueue(unit);
    }
    pipeline.drain();

    // every builder frame carries TTL 64; the server sent one of three
    let server = pipeline.hosts().get(&SERVER_IP.into()).unwrap();
    assert_eq!(server.lock().best_os_guess(), Some(("Linux/Unix", 1.0)));
    let client = pipeline.hosts().get(&CLIENT_IP.into()).unwrap();
    assert_eq!(client.lock().best_os_guess(), Some(("Linux/Unix", 2.0)));
}

#[test]
fn test_orderly_close_removes_session() {
    let (pipeline, _rx) = Pipeline::new(quiet(), HandlerRegistry::with_defaults(), MemorySink::new());
    let mut conversation = Conversation::new(8080);
    for unit in conversation.handshake() {
        pipeline.try_enqueue(unit);
    }
    pipeline.drain();
    assert_eq!(pipeline.sessions().len(), 1);

    for unit in conversation.close() {
        pipeline.try_enqueue(unit);
    }
    pipeline.drain();
    // the trailing ACK opens nothing
    assert!(pipeline.sessions().is_empty());
}

#[test]
fn test_evicted_session_settles_open_transfer() {
    let config = PipelineConfig {
        session_capacity: 1,
        ..quiet()
    };
    let sink = MemorySink::new();
    let (pipeline, mut rx) = Pipeline::new(config, HandlerRegistry::with_defaults(), sink.clone());

    let mut first = Conversation::new(80);
    for unit in first.handshake() {
        pipeline.try_enqueue(unit);
    }
    pipeline.try_enqueue(first.client_sends(b"GET /stream.log HTTP/1.0\r\n\r\n"));
    pipeline.try_enqueue(first.server_sends(b"HTTP/1.0 200 OK\r\n\r\nline one\n"));
    pipeline.drain();
    assert!(sink.is_empty());

    let mut second = Conversation::new(80).with_client_port(CLIENT_PORT + 1);
    for unit in second.handshake() {
        pipeline.try_enqueue(unit);
    }
    pipeline.drain();

    assert_eq!(pipeline.sessions().len(), 1);
    assert_eq!(pipeline.sessions().stats().evictions, 1);
    let files = sink.files();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].0, "192.168.1.1/TCP-80/stream.log");
    assert_eq!(&files[0].1[..], b"line one\n");
    assert!(collect(&mut rx).iter().any(|e| e.kind() == "file"));
}

#[test]
fn test_flush_finishes_until_close_transfer() {
    let sink = MemorySink::new();
    let (pipeline, _rx) = Pipeline::new(quiet(), HandlerRegistry::with_defaults(), sink.clone());
    let mut conversation = Conversation::new(80);
    for unit in conversation.handshake() {
        pipeline.try_enqueue(unit);
    }
    pipeline.try_enqueue(conversation.client_sends(b"GET /feed HTTP/1.0\r\n\r\n"));
    pipeline.try_enqueue(conversation.server_sends(b"HTTP/1.0 200 OK\r\n\r\n<rss/>"));
    pipeline.flush();

    assert!(pipeline.sessions().is_empty());
    assert_eq!(sink.files()[0].1.as_ref(), b"<rss/>");
}

// ============================================================================
// Hosts
// ============================================================================

#[test]
fn test_mac_change_raises_anomaly() {
    let (pipeline, mut rx) = Pipeline::new(quiet(), HandlerRegistry::new(), MemorySink::new());
    let host = [10, 9, 9, 9];
    let payload = b"ping";
    for mac in [[2, 0, 0, 0, 0, 9], [2, 0, 0, 0, 0, 9], [2, 0, 0, 0, 0, 10]] {
        let frame = udp_frame_from(mac, host, CLIENT_IP, 9999, 9999, payload);
        pipeline.try_enqueue(RawUnit::new(1, LinkType::Ethernet, frame));
    }
    pipeline.drain();

    let events = collect(&mut rx);
    assert_eq!(
        anomalies(&events),
        vec!["MAC address of 10.9.9.9 changed from 02:00:00:00:00:09 to 02:00:00:00:00:0a"]
    );
    let record = pipeline.hosts().get(&host.into()).unwrap();
    assert_eq!(record.lock().packets_sent, 3);
}

// ============================================================================
// IPv4 fragments
// ============================================================================

fn dns_response() -> Vec<u8> {
    let mut m = vec![0xBE, 0xEF, 0x81, 0x80, 0, 1, 0, 1, 0, 0, 0, 0];
    m.extend_from_slice(b"\x05files\x04corp\x00");
    m.extend_from_slice(&[0, 1, 0, 1]);
    m.extend_from_slice(&[0xC0, 12, 0, 1, 0, 1, 0, 0, 1, 0, 0, 4]);
    m.extend_from_slice(&SERVER_IP);
    m
}

/// Ethernet frame carrying one IPv4 fragment of a UDP datagram.
fn fragment(transport: &[u8], offset_units: u16, more: bool) -> Vec<u8> {
    let resolver = [192, 168, 1, 53];
    let mut ip = Ipv4Header::new(transport.len() as u16, 64, IpNumber::UDP, resolver, CLIENT_IP).unwrap();
    ip.identification = 0x4242;
    ip.more_fragments = more;
    ip.fragment_offset = IpFragOffset::try_new(offset_units).unwrap();
    ip.header_checksum = ip.calc_header_checksum();

    let eth = Ethernet2Header {
        source: [2, 0, 0, 0, 0, 0x53],
        destination: [2, 0, 0, 0, 0, 0x20],
        ether_type: EtherType::IPV4,
    };
    let mut out = eth.to_bytes().to_vec();
    out.extend_from_slice(&ip.to_bytes());
    out.extend_from_slice(transport);
    out
}

#[test]
fn test_fragmented_dns_response_is_reassembled() {
    let (pipeline, mut rx) = Pipeline::new(quiet(), HandlerRegistry::with_defaults(), MemorySink::new());

    // UDP header and payload, cut on an 8-byte boundary
    let builder = PacketBuilder::ipv4([192, 168, 1, 53], CLIENT_IP, 64).udp(53, 33333);
    let response = dns_response();
    let mut datagram = Vec::new();
    builder.write(&mut datagram, &response).unwrap();
    let transport = &datagram[20..];

    pipeline.try_enqueue(RawUnit::new(1, LinkType::Ethernet, fragment(&transport[16..], 2, false)));
    pipeline.try_enqueue(RawUnit::new(2, LinkType::Ethernet, fragment(&transport[..16], 0, true)));
    pipeline.drain();

    let records: Vec<_> = collect(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            Event::DnsRecordObserved(record) => Some(record),
            _ => None,
        })
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].query, "files.corp");
    assert_eq!(records[0].answer, "192.168.1.1");
    assert_eq!(records[0].transaction_id, 0xBEEF);
    assert_eq!(pipeline.pending_fragments(), 0);

    let server = pipeline.hosts().get(&SERVER_IP.into());
    assert!(server.is_none(), "DNS answers only name hosts already seen");
}

// ============================================================================
// Threaded workers
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spawned_workers_process_everything() {
    let sink = MemorySink::new();
    let (pipeline, mut rx) = Pipeline::new(PipelineConfig::default(), HandlerRegistry::with_defaults(), sink.clone());
    let workers = pipeline.spawn();

    let mut conversation = Conversation::new(80);
    let mut units = conversation.handshake();
    units.push(conversation.client_sends(b"GET /x.txt HTTP/1.1\r\nHost: files\r\n\r\n"));
    units.push(conversation.server_sends(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc"));
    units.extend(conversation.close());
    let total = units.len();
    for unit in units {
        assert!(pipeline.try_enqueue(unit));
    }

    workers.finish().await;
    assert!(pipeline.is_idle());
    assert_eq!(pipeline.frames_decoded(), total as u64);

    let events = collect(&mut rx);
    let frames: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            Event::FrameObserved(frame) => Some(frame.number()),
            _ => None,
        })
        .collect();
    assert_eq!(frames, (1..=total as u64).collect::<Vec<_>>());
    assert_eq!(sink.files().len(), 1);
    assert_eq!(&sink.files()[0].1[..], b"abc");
}

#[tokio::test]
async fn test_stop_cancels_idle_workers() {
    let (pipeline, _rx) = Pipeline::with_defaults();
    let workers = pipeline.spawn();
    let token = workers.cancel_token();
    workers.stop().await;
    assert!(token.is_cancelled());
    assert!(pipeline.is_idle());
}
