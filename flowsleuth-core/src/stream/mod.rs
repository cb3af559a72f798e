//! TCP session tracking and stream reassembly.
//!
//! Each [`TcpSession`] owns one [`TcpStream`] per direction. Sessions live
//! in a [`SessionTable`], a popularity cache that force-closes whatever it
//! evicts so no flow disappears without passing through `Closed`.

mod connection;
mod reassembly;
mod session;
mod table;

pub use connection::{ConnectionKey, Endpoints};
pub use reassembly::{StreamStats, StreamWindow, TcpStream, DEFAULT_MAX_OUT_OF_ORDER};
pub use session::{
    guess_roles, PacketOutcome, ProtocolGuesser, SessionInfo, SessionState, TcpSession,
};
pub use table::{SessionHandle, SessionTable};

/// Direction of data flow in a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to server.
    ToServer,
    /// Server to client.
    ToClient,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::ToServer => Direction::ToClient,
            Direction::ToClient => Direction::ToServer,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToServer => "to_server",
            Direction::ToClient => "to_client",
        }
    }
}

// Sequence number comparison helpers (RFC 1982 serial arithmetic)
pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

pub(crate) fn seq_add(a: u32, n: usize) -> u32 {
    a.wrapping_add(n as u32)
}
