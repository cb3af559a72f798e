//! End-to-end scenarios through the inline pipeline.

mod common;

use common::{anomalies, collect, Conversation, Recorder, CLIENT_PORT, SERVER_IP};
use flowsleuth_core::error::HandlerError;
use flowsleuth_core::file::{AssemblerKey, AssemblerOutcome, CloseReason, FileAssembler, FileMetadata, Framing};
use flowsleuth_core::handler::{SessionContext, SessionHandler};
use flowsleuth_core::stream::{Direction, StreamWindow};
use flowsleuth_core::{
    ApplicationProtocol, Event, FileAssemblerList, HandlerRegistry, MemorySink, Pipeline, PipelineConfig,
};
use rstest::rstest;

const REQUEST: &[u8] = b"GET /a HTTP/1.1\r\nHost: intranet.example\r\nUser-Agent: probe/1.0\r\n\r\n";

fn quiet() -> PipelineConfig {
    PipelineConfig {
        emit_frames: false,
        ..Default::default()
    }
}

// ============================================================================
// Scenario A: a request split across three segments
// ============================================================================

#[rstest]
#[case(1, 2)]
#[case(4, 17)]
#[case(16, 40)]
#[case(30, 31)]
#[case(REQUEST.len() - 2, REQUEST.len() - 1)]
fn test_split_request_reassembles_exactly(#[case] first: usize, #[case] second: usize) {
    let recorder = Recorder::new(ApplicationProtocol::Http);
    let mut handlers = HandlerRegistry::new();
    handlers.register_session(recorder.clone());
    let (pipeline, _rx) = Pipeline::new(quiet(), handlers, MemorySink::new());

    let mut conversation = Conversation::new(80);
    for unit in conversation.handshake() {
        assert!(pipeline.try_enqueue(unit));
    }
    for part in [&REQUEST[..first], &REQUEST[first..second], &REQUEST[second..]] {
        assert!(pipeline.try_enqueue(conversation.client_sends(part)));
    }
    pipeline.drain();

    assert_eq!(recorder.stream(Direction::ToServer), REQUEST);
    assert!(recorder.stream(Direction::ToClient).is_empty());
}

#[test]
fn test_out_of_order_segments_reassemble() {
    let recorder = Recorder::new(ApplicationProtocol::Http);
    let mut handlers = HandlerRegistry::new();
    handlers.register_session(recorder.clone());
    let (pipeline, _rx) = Pipeline::new(quiet(), handlers, MemorySink::new());

    let mut conversation = Conversation::new(80);
    for unit in conversation.handshake() {
        pipeline.try_enqueue(unit);
    }
    // third, first, retransmitted first, second
    pipeline.try_enqueue(conversation.client_segment(40, &REQUEST[40..]));
    pipeline.try_enqueue(conversation.client_segment(0, &REQUEST[..20]));
    pipeline.try_enqueue(conversation.client_segment(0, &REQUEST[..20]));
    pipeline.try_enqueue(conversation.client_segment(20, &REQUEST[20..40]));
    pipeline.drain();

    assert_eq!(recorder.stream(Direction::ToServer), REQUEST);
}

#[test]
fn test_http_request_names_server_host() {
    let (pipeline, mut rx) = Pipeline::new(quiet(), HandlerRegistry::with_defaults(), MemorySink::new());
    let mut conversation = Conversation::new(80);
    for unit in conversation.handshake() {
        pipeline.try_enqueue(unit);
    }
    pipeline.try_enqueue(conversation.client_sends(&REQUEST[..10]));
    pipeline.try_enqueue(conversation.client_sends(&REQUEST[10..]));
    pipeline.drain();

    let server = pipeline.hosts().get(&SERVER_IP.into()).unwrap();
    assert_eq!(server.lock().hostnames().collect::<Vec<_>>(), vec!["intranet.example"]);
    assert!(server.lock().open_tcp_ports().any(|p| p == 80));

    let events = collect(&mut rx);
    let sessions: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::SessionObserved {
                protocol,
                client_port,
                server_port,
                start_frame,
                ..
            } => Some((*protocol, *client_port, *server_port, *start_frame)),
            _ => None,
        })
        .collect();
    assert_eq!(sessions, vec![(ApplicationProtocol::Http, CLIENT_PORT, 80, 1)]);
    assert_eq!(events.iter().filter(|e| e.kind() == "host").count(), 2);
}

#[test]
fn test_http_response_reconstructs_file() {
    let sink = MemorySink::new();
    let (pipeline, mut rx) = Pipeline::new(quiet(), HandlerRegistry::with_defaults(), sink.clone());
    let mut conversation = Conversation::new(80);
    for unit in conversation.handshake() {
        pipeline.try_enqueue(unit);
    }
    pipeline.try_enqueue(conversation.client_sends(REQUEST));
    pipeline.try_enqueue(conversation.server_sends(b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nhello"));
    pipeline.try_enqueue(conversation.server_sends(b" world"));
    for unit in conversation.close() {
        pipeline.try_enqueue(unit);
    }
    pipeline.drain();

    let files = sink.files();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].0, "192.168.1.1/TCP-80/a");
    assert_eq!(&files[0].1[..], b"hello world");

    let events = collect(&mut rx);
    let reconstructed = events.iter().find_map(|e| match e {
        Event::FileReconstructed { path, size, filename, .. } => Some((path.clone(), *size, filename.clone())),
        _ => None,
    });
    assert_eq!(
        reconstructed,
        Some(("memory:192.168.1.1/TCP-80/a".to_string(), 11, "a".to_string()))
    );
    assert!(pipeline.sessions().is_empty());
    assert!(anomalies(&events).is_empty());
}

// ============================================================================
// Scenario B: declared length 1000, RST after 400 bytes
// ============================================================================

#[test]
fn test_reset_transfer_is_aborted() {
    let sink = MemorySink::new();
    let (pipeline, mut rx) = Pipeline::new(quiet(), HandlerRegistry::with_defaults(), sink.clone());
    let mut conversation = Conversation::new(80);
    for unit in conversation.handshake() {
        pipeline.try_enqueue(unit);
    }
    pipeline.try_enqueue(conversation.client_sends(REQUEST));
    pipeline.try_enqueue(conversation.server_sends(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n"));
    pipeline.try_enqueue(conversation.server_sends(&[b'x'; 400]));
    pipeline.drain();
    assert_eq!(pipeline.assemblers().len(), 1);

    pipeline.try_enqueue(conversation.server_reset());
    pipeline.flush();

    assert!(sink.is_empty());
    assert!(pipeline.assemblers().is_empty());
    assert!(pipeline.sessions().is_empty());
    let events = collect(&mut rx);
    assert!(!events.iter().any(|e| e.kind() == "file"));
}

#[test]
fn test_reset_leaves_aborted_assembler() {
    let client = "10.1.1.2:50000".parse().unwrap();
    let server = "10.1.1.1:80".parse().unwrap();
    let list = FileAssemblerList::new(4);
    let key = AssemblerKey::new(client, server, ApplicationProtocol::Http);
    let mut assembler = FileAssembler::new(
        FileMetadata {
            source: server,
            destination: client,
            protocol: ApplicationProtocol::Http,
            filename: "report.pdf".into(),
            path_hint: "10.1.1.1/TCP-80/report.pdf".into(),
            details: String::new(),
            frame: 1,
            timestamp_us: 0,
        },
        Framing::Known(1000),
    );
    assembler.activate().unwrap();
    list.insert(key.clone(), assembler);
    list.with_mut(&key, |a| a.add_data(&[0u8; 400])).unwrap().unwrap();

    let outcomes = list.drain_connection(client, server, CloseReason::Reset);
    match &outcomes[..] {
        [AssemblerOutcome::Aborted { assembler, .. }] => assert_eq!(assembler.received(), 400),
        other => panic!("expected one aborted assembler, got {other:?}"),
    }
}

// ============================================================================
// Scenario C: two transfers multiplexed over one connection
// ============================================================================

/// Toy multiplexed protocol. Records are `[handle, kind, len_hi, len_lo]`
/// followed by `len` bytes. Kind 0 opens a transfer whose total size is the
/// record body (u32), kind 1 carries data.
struct Multiplexed;

impl SessionHandler for Multiplexed {
    fn name(&self) -> &'static str {
        "multiplexed"
    }

    fn protocol(&self) -> ApplicationProtocol {
        ApplicationProtocol::Smb
    }

    fn extract(&mut self, ctx: &mut SessionContext<'_>, window: &StreamWindow) -> Result<usize, HandlerError> {
        let data = window.materialize();
        let mut pos = 0;
        while data.len() - pos >= 4 {
            let (handle, kind) = (data[pos], data[pos + 1]);
            let len = usize::from(u16::from_be_bytes([data[pos + 2], data[pos + 3]]));
            let Some(body) = data.get(pos + 4..pos + 4 + len) else {
                break;
            };
            let key = AssemblerKey::new(ctx.session.client, ctx.session.server, ApplicationProtocol::Smb)
                .with_extended_id(format!("handle-{handle}"));
            match kind {
                0 => {
                    let total = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                    let filename = format!("file-{handle}.bin");
                    let mut assembler = FileAssembler::new(
                        FileMetadata {
                            source: ctx.session.client,
                            destination: ctx.session.server,
                            protocol: ApplicationProtocol::Smb,
                            path_hint: format!("smb/{filename}"),
                            filename,
                            details: format!("handle {handle}"),
                            frame: ctx.frame.number(),
                            timestamp_us: ctx.timestamp_us(),
                        },
                        Framing::Known(u64::from(total)),
                    );
                    assembler.activate()?;
                    ctx.assemblers.insert(key, assembler);
                }
                _ => {
                    ctx.assemblers
                        .with_mut(&key, |a| a.add_data(body))
                        .ok_or_else(|| HandlerError::malformed("multiplexed", "data for unknown handle"))??;
                    if let Some(file) = ctx.assemblers.take_finished(&key) {
                        ctx.file_finished(file);
                    }
                }
            }
            pos += 4 + len;
        }
        Ok(pos)
    }

    fn reset(&mut self) {}
}

fn record(handle: u8, kind: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![handle, kind];
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

#[test]
fn test_multiplexed_transfers_do_not_interleave() {
    let sink = MemorySink::new();
    let mut handlers = HandlerRegistry::new();
    handlers.register_session(Multiplexed);
    let (pipeline, mut rx) = Pipeline::new(quiet(), handlers, sink.clone());

    let mut conversation = Conversation::new(445);
    for unit in conversation.handshake() {
        pipeline.try_enqueue(unit);
    }
    pipeline.try_enqueue(conversation.client_sends(&record(1, 0, &12u32.to_be_bytes())));
    pipeline.try_enqueue(conversation.client_sends(&record(2, 0, &8u32.to_be_bytes())));

    // alternate records, one split across two segments
    let mut stream = Vec::new();
    for _ in 0..2 {
        stream.extend(record(1, 1, b"AAAAAA"));
        stream.extend(record(2, 1, b"BBBB"));
    }
    let (head, tail) = stream.split_at(7);
    pipeline.try_enqueue(conversation.client_sends(head));
    pipeline.try_enqueue(conversation.client_sends(tail));
    pipeline.drain();

    let mut files = sink.files();
    files.sort();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].0, "smb/file-1.bin");
    assert_eq!(&files[0].1[..], b"AAAAAAAAAAAA");
    assert_eq!(files[1].0, "smb/file-2.bin");
    assert_eq!(&files[1].1[..], b"BBBBBBBB");
    assert!(anomalies(&collect(&mut rx)).is_empty());
}

// ============================================================================
// Handler failures
// ============================================================================

struct Panicking;

impl SessionHandler for Panicking {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn protocol(&self) -> ApplicationProtocol {
        ApplicationProtocol::Telnet
    }

    fn extract(&mut self, _ctx: &mut SessionContext<'_>, _window: &StreamWindow) -> Result<usize, HandlerError> {
        panic!("boom");
    }

    fn reset(&mut self) {}
}

#[test]
fn test_handler_panic_becomes_anomaly() {
    let mut handlers = HandlerRegistry::new();
    handlers.register_session(Panicking);
    let (pipeline, mut rx) = Pipeline::new(quiet(), handlers, MemorySink::new());

    let mut conversation = Conversation::new(23);
    for unit in conversation.handshake() {
        pipeline.try_enqueue(unit);
    }
    pipeline.try_enqueue(conversation.client_sends(b"login: root\r\n"));
    pipeline.try_enqueue(conversation.client_sends(b"password\r\n"));
    assert_eq!(pipeline.drain(), 5);

    let events = collect(&mut rx);
    assert_eq!(
        anomalies(&events),
        vec![
            "panicking handler panicked on frame 4: boom",
            "panicking handler panicked on frame 5: boom"
        ]
    );
    let session = pipeline.sessions().drain();
    assert_eq!(session.len(), 1);
    assert_eq!(session[0].1.lock().stream(Direction::ToServer).bytes_ready(), 0);
}
