//! Protocol handler plug-ins.
//!
//! Two kinds of handler are registered at startup, in an order that
//! matters:
//!
//! - [`SessionHandler`]s see reassembled TCP data as a [`StreamWindow`] and
//!   report how many bytes they consumed. Returning 0 means "call me again
//!   when more data is ready".
//! - [`FrameHandler`]s see one frame at a time, for protocols that fit in a
//!   single datagram.
//!
//! Handlers never touch the event channel or the file sink directly. They
//! push events and finished files into their context and the dispatcher
//! forwards them after the call returns.

mod cleartext;
mod dns;
mod http;

pub use cleartext::{CleartextHandler, DEFAULT_DICTIONARY};
pub use dns::DnsHandler;
pub use http::HttpHandler;

use crate::error::HandlerError;
use crate::event::{Credential, Event};
use crate::file::{FileAssemblerList, ReconstructedFile, DEFAULT_MAX_FILE_SIZE};
use crate::frame::Frame;
use crate::host::{HostHandle, HostRegistry};
use crate::protocol::ApplicationProtocol;
use crate::stream::{Direction, SessionInfo, StreamWindow};

/// Segments exposed per window unless a handler asks for more.
pub const DEFAULT_WINDOW_SEGMENTS: usize = 16;

/// What a session handler sees on each call.
pub struct SessionContext<'a> {
    pub session: SessionInfo,
    /// Direction of the data in the window.
    pub direction: Direction,
    /// Frame whose arrival made the window ready.
    pub frame: &'a Frame,
    pub client: &'a HostHandle,
    pub server: &'a HostHandle,
    pub assemblers: &'a FileAssemblerList,
    pub max_file_size: u64,
    events: Vec<Event>,
    files: Vec<ReconstructedFile>,
    confirmed: Option<ApplicationProtocol>,
}

impl<'a> SessionContext<'a> {
    pub fn new(
        session: SessionInfo,
        direction: Direction,
        frame: &'a Frame,
        client: &'a HostHandle,
        server: &'a HostHandle,
        assemblers: &'a FileAssemblerList,
    ) -> Self {
        Self {
            session,
            direction,
            frame,
            client,
            server,
            assemblers,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            events: Vec::new(),
            files: Vec::new(),
            confirmed: None,
        }
    }

    /// Sender of the window's bytes.
    pub fn source(&self) -> &'a HostHandle {
        match self.direction {
            Direction::ToServer => self.client,
            Direction::ToClient => self.server,
        }
    }

    pub fn destination(&self) -> &'a HostHandle {
        match self.direction {
            Direction::ToServer => self.server,
            Direction::ToClient => self.client,
        }
    }

    pub fn timestamp_us(&self) -> i64 {
        self.frame.timestamp_us()
    }

    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn credential(&mut self, username: String, password: Option<String>, proven_valid: bool) {
        let credential = Credential {
            client: self.session.client.ip(),
            server: self.session.server.ip(),
            protocol: self.session.protocol,
            username,
            password,
            proven_valid,
            timestamp_us: self.timestamp_us(),
        };
        self.events.push(Event::CredentialObserved(credential));
    }

    /// Hand a finished file to the dispatcher for the sink.
    pub fn file_finished(&mut self, file: ReconstructedFile) {
        self.files.push(file);
    }

    /// The handler recognized its protocol on this session.
    pub fn confirm(&mut self, protocol: ApplicationProtocol) {
        self.session.protocol = protocol;
        self.confirmed = Some(protocol);
    }

    pub fn confirmed(&self) -> Option<ApplicationProtocol> {
        self.confirmed
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn take_files(&mut self) -> Vec<ReconstructedFile> {
        std::mem::take(&mut self.files)
    }
}

/// Plug-in fed with reassembled TCP data.
pub trait SessionHandler: Send {
    fn name(&self) -> &'static str;

    /// Protocol this handler recognizes.
    fn protocol(&self) -> ApplicationProtocol;

    /// Ports used for role guessing on truncated sessions.
    fn default_ports(&self) -> &'static [u16] {
        self.protocol().default_ports()
    }

    /// Largest window, in segments, this handler wants to see.
    fn max_window_segments(&self) -> usize {
        DEFAULT_WINDOW_SEGMENTS
    }

    /// Whether this handler should be offered data from `session`.
    fn accepts(&self, session: &SessionInfo) -> bool {
        session.protocol == self.protocol() || self.default_ports().contains(&session.server.port())
    }

    /// Parse what it can from `window`. Returns the number of bytes, from
    /// the start of the window, that may be discarded.
    fn extract(&mut self, ctx: &mut SessionContext<'_>, window: &StreamWindow) -> Result<usize, HandlerError>;

    /// The session is gone (closed, reset or evicted).
    fn session_closed(&mut self, _session: &SessionInfo) {}

    /// Drop all state; called on a full reset.
    fn reset(&mut self);
}

/// What a frame handler sees on each call.
pub struct FrameContext<'a> {
    pub frame: &'a Frame,
    pub source: Option<&'a HostHandle>,
    pub destination: Option<&'a HostHandle>,
    pub hosts: &'a HostRegistry,
    events: Vec<Event>,
}

impl<'a> FrameContext<'a> {
    pub fn new(
        frame: &'a Frame,
        source: Option<&'a HostHandle>,
        destination: Option<&'a HostHandle>,
        hosts: &'a HostRegistry,
    ) -> Self {
        Self {
            frame,
            source,
            destination,
            hosts,
            events: Vec::new(),
        }
    }

    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}

/// Plug-in invoked once per eligible frame.
pub trait FrameHandler: Send {
    fn name(&self) -> &'static str;

    fn protocol(&self) -> ApplicationProtocol;

    fn default_ports(&self) -> &'static [u16] {
        self.protocol().default_ports()
    }

    /// Whether `frame` is of interest. Called before `extract`.
    fn accepts(&self, frame: &Frame) -> bool;

    fn extract(&mut self, ctx: &mut FrameContext<'_>) -> Result<(), HandlerError>;

    fn reset(&mut self) {}
}

/// Handlers in dispatch order.
#[derive(Default)]
pub struct HandlerRegistry {
    session: Vec<Box<dyn SessionHandler>>,
    frame: Vec<Box<dyn FrameHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP on sessions; DNS and the cleartext scanner on frames.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_session(HttpHandler::new());
        registry.register_frame(DnsHandler::new());
        registry.register_frame(CleartextHandler::default());
        registry
    }

    pub fn register_session<H: SessionHandler + 'static>(&mut self, handler: H) {
        self.session.push(Box::new(handler));
    }

    pub fn register_frame<H: FrameHandler + 'static>(&mut self, handler: H) {
        self.frame.push(Box::new(handler));
    }

    pub fn session_handlers_mut(&mut self) -> &mut [Box<dyn SessionHandler>] {
        &mut self.session
    }

    pub fn frame_handlers_mut(&mut self) -> &mut [Box<dyn FrameHandler>] {
        &mut self.frame
    }

    /// Protocols claimed by session handlers, in registration order.
    pub fn session_protocols(&self) -> Vec<ApplicationProtocol> {
        self.session.iter().map(|h| h.protocol()).collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.session
            .iter()
            .map(|h| h.name())
            .chain(self.frame.iter().map(|h| h.name()))
            .collect()
    }

    pub fn reset_all(&mut self) {
        for handler in &mut self.session {
            handler.reset();
        }
        for handler in &mut self.frame {
            handler.reset();
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_order() {
        let registry = HandlerRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["http", "dns", "cleartext"]);
        assert_eq!(registry.session_protocols(), vec![ApplicationProtocol::Http]);
    }
}
