//! Observation events emitted by the pipeline.
//!
//! Events go out over an unbounded `tokio::sync::mpsc` channel in the order
//! the frame consumer produces them. Each carries enough context to render
//! a row without going back to the registries.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::frame::Frame;
use crate::host::Host;
use crate::protocol::ApplicationProtocol;

/// A username (and possibly password) seen in cleartext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub client: IpAddr,
    pub server: IpAddr,
    pub protocol: ApplicationProtocol,
    pub username: String,
    pub password: Option<String>,
    /// The server accepted the credential.
    pub proven_valid: bool,
    pub timestamp_us: i64,
}

/// One answer from a DNS response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub query: String,
    /// Rendered answer data (address, target name, text).
    pub answer: String,
    pub record_type: u16,
    /// Host that asked.
    pub client: IpAddr,
    /// Host that answered.
    pub server: IpAddr,
    pub transaction_id: u16,
    pub ttl: u32,
    pub frame: u64,
}

/// A message (mail, chat, form post) reconstructed from a session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub protocol: Option<ApplicationProtocol>,
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attributes: Vec<(String, String)>,
}

/// Everything the engine reports to its consumers.
#[derive(Debug, Clone)]
pub enum Event {
    FrameObserved(Arc<Frame>),
    /// New host, as first seen.
    HostObserved(Host),
    SessionObserved {
        protocol: ApplicationProtocol,
        client: IpAddr,
        server: IpAddr,
        client_port: u16,
        server_port: u16,
        is_tcp: bool,
        start_frame: u64,
        start_time_us: i64,
    },
    FileReconstructed {
        source: SocketAddr,
        destination: SocketAddr,
        /// Location reported by the sink.
        path: String,
        protocol: ApplicationProtocol,
        filename: String,
        size: u64,
        timestamp_us: i64,
        details: String,
    },
    CredentialObserved(Credential),
    DnsRecordObserved(DnsRecord),
    MessageObserved(Message),
    AnomalyRaised {
        message: String,
        timestamp_us: i64,
    },
    /// Intake queue fill level, 0-100.
    BufferUsageChanged {
        percent: u8,
    },
    CleartextWordsFound {
        words: Vec<String>,
        frame: u64,
        timestamp_us: i64,
    },
}

impl Event {
    pub fn anomaly(message: impl Into<String>, timestamp_us: i64) -> Self {
        Event::AnomalyRaised {
            message: message.into(),
            timestamp_us,
        }
    }

    /// Short name for logs and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::FrameObserved(_) => "frame",
            Event::HostObserved(_) => "host",
            Event::SessionObserved { .. } => "session",
            Event::FileReconstructed { .. } => "file",
            Event::CredentialObserved(_) => "credential",
            Event::DnsRecordObserved(_) => "dns",
            Event::MessageObserved(_) => "message",
            Event::AnomalyRaised { .. } => "anomaly",
            Event::BufferUsageChanged { .. } => "buffer",
            Event::CleartextWordsFound { .. } => "cleartext",
        }
    }
}

/// An anomaly kept for the user to review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anomaly {
    pub message: String,
    pub timestamp_us: i64,
}

/// Readable, clearable record of every anomaly raised.
#[derive(Debug, Clone, Default)]
pub struct AnomalyLog {
    entries: Arc<Mutex<Vec<Anomaly>>>,
}

impl AnomalyLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: String, timestamp_us: i64) {
        self.entries.lock().push(Anomaly {
            message,
            timestamp_us,
        });
    }

    pub fn entries(&self) -> Vec<Anomaly> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Sending half of the event channel, plus the anomaly log every
/// `AnomalyRaised` is recorded in.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<Event>,
    anomalies: AnomalyLog,
}

impl EventSink {
    /// A sink and the receiver consumers read events from.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                anomalies: AnomalyLog::new(),
            },
            receiver,
        )
    }

    pub fn emit(&self, event: Event) {
        if let Event::AnomalyRaised {
            message,
            timestamp_us,
        } = &event
        {
            warn!(%message, "anomaly");
            self.anomalies.push(message.clone(), *timestamp_us);
        }
        if self.sender.send(event).is_err() {
            trace!("event receiver dropped");
        }
    }

    pub fn anomaly(&self, message: impl Into<String>, timestamp_us: i64) {
        self.emit(Event::anomaly(message, timestamp_us));
    }

    pub fn anomalies(&self) -> &AnomalyLog {
        &self.anomalies
    }
}
