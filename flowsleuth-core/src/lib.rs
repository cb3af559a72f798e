//! # flowsleuth-core
//!
//! Passive stream reconstruction engine.
//!
//! Raw captured units go in; observation events come out: hosts, TCP
//! sessions, reconstructed files, credentials, DNS records, messages and
//! anomalies. The engine never transmits anything and keeps no state on
//! disk; reconstructed files are handed to a [`FileSink`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowsleuth_core::prelude::*;
//!
//! let (pipeline, mut events) = Pipeline::new(
//!     PipelineConfig::default(),
//!     HandlerRegistry::with_defaults(),
//!     MemorySink::new(),
//! );
//!
//! let frame: Vec<u8> = std::fs::read("frame.bin").unwrap();
//! pipeline.try_enqueue(RawUnit::new(0, LinkType::Ethernet, frame));
//! pipeline.flush();
//!
//! while let Ok(event) = events.try_recv() {
//!     println!("{}", event.kind());
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                        flowsleuth-core                              |
//! +---------------------------------------------------------------------+
//! |  protocol/   - Protocol trait, layer decoders, ApplicationProtocol  |
//! |  frame       - Frame / Packet tree, lazy and eager decoding         |
//! |  cache/      - Bounded popularity cache with eviction hook          |
//! |  host/       - Host records and the host registry                   |
//! |  stream/     - TCP reassembly, session state machine, session table |
//! |  fragment    - IPv4 fragment reassembly                             |
//! |  file/       - File assemblers, chunked/gzip decoding, sinks        |
//! |  handler/    - Session and frame handler plug-ins (HTTP, DNS, ...)  |
//! |  pipeline/   - Intake and dispatch stages, queues, configuration    |
//! |  event       - Events and the anomaly log                           |
//! |  error       - Error types                                          |
//! +---------------------------------------------------------------------+
//! ```

pub mod cache;
pub mod error;
pub mod event;
pub mod file;
pub mod fragment;
pub mod frame;
pub mod handler;
pub mod host;
pub mod pipeline;
pub mod prelude;
pub mod protocol;
pub mod stream;

pub use cache::{CacheStats, PopularityCache};
pub use error::{AssemblerError, DecodeError, Error, HandlerError, Result, SessionError};
pub use event::{Anomaly, AnomalyLog, Credential, DnsRecord, Event, EventSink, Message};
pub use file::{
    AssemblerKey, AssemblerState, FileAssembler, FileAssemblerList, FileMetadata, FileSink,
    Framing, MemorySink, NullSink, ReconstructedFile,
};
pub use fragment::FragmentCache;
pub use frame::{DecodeMode, Decoder, Frame, FrameError, LinkType, Packet, MAX_FRAME_SIZE};
pub use handler::{
    FrameContext, FrameHandler, HandlerRegistry, SessionContext, SessionHandler,
};
pub use host::{Host, HostHandle, HostRegistry, MacAddr, MacChange};
pub use pipeline::{Pipeline, PipelineConfig, PipelineWorkers, RawUnit};
pub use protocol::{ApplicationProtocol, Layer, LayerKind};
pub use stream::{ConnectionKey, Direction, SessionState, SessionTable, TcpSession, TcpStream};
