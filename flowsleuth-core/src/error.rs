//! Error types for flowsleuth-core.
//!
//! - [`enum@Error`] - Main error enum that wraps all error types
//! - [`DecodeError`] - Frame construction failures (size cap, bad range)
//! - [`SessionError`] - TCP packets that cannot be applied to a session
//! - [`AssemblerError`] - File reconstruction failures
//! - [`HandlerError`] - Failures raised by protocol handler plug-ins
//!
//! Malformed bytes inside a frame are never an `Err`: they are recorded on
//! the frame as a [`FrameError`](crate::frame::FrameError) and decoding
//! continues with an opaque leaf.

use thiserror::Error;

/// Main error type for flowsleuth-core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Frame could not be constructed
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// TCP packet rejected by the session state machine
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// File reconstruction failed
    #[error("Assembler error: {0}")]
    Assembler(#[from] AssemblerError),

    /// A protocol handler failed
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while constructing a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Captured unit exceeds the hard frame size cap
    #[error("frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Requested byte range does not fit the captured buffer
    #[error("byte range {start}..{end} outside buffer of {len} bytes")]
    RangeOutOfBounds {
        start: usize,
        end: usize,
        len: usize,
    },
}

/// Protocol-logic violations reported by [`TcpSession`](crate::stream::TcpSession).
///
/// The offending packet is not applied when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Packet endpoints do not belong to this session
    #[error("packet does not belong to this session")]
    WrongSession,

    /// Handshake step sent by the wrong endpoint
    #[error("{step} must be sent by the {expected}")]
    WrongSender {
        step: &'static str,
        expected: &'static str,
    },

    /// Handshake step observed in a state that does not accept it
    #[error("{step} not valid in state {state}")]
    InvalidState {
        step: &'static str,
        state: &'static str,
    },

    /// SYN received after the session was established
    #[error("SYN received on an established session")]
    SynAfterEstablished,

    /// Session already closed
    #[error("session is closed")]
    Closed,
}

/// Errors raised by [`FileAssembler`](crate::file::FileAssembler).
#[derive(Error, Debug)]
pub enum AssemblerError {
    /// Operation not permitted in the assembler's current state
    #[error("assembler is {state}, cannot {operation}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },

    /// Declared length not reached when finishing
    #[error("transfer incomplete: {missing} of {expected} bytes missing")]
    Incomplete { expected: u64, missing: u64 },

    /// File grew past the configured ceiling
    #[error("file exceeds size limit of {limit} bytes")]
    SizeLimit { limit: u64 },

    /// Transfer framing could not be decoded
    #[error("invalid framing: {0}")]
    Framing(String),

    /// No assembler registered under the requested key
    #[error("no assembler for key")]
    NotFound,
}

/// Errors raised by protocol handler plug-ins.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Application data did not match the protocol
    #[error("{protocol}: malformed data: {reason}")]
    Malformed {
        protocol: &'static str,
        reason: String,
    },

    /// File reconstruction failed inside the handler
    #[error(transparent)]
    Assembler(#[from] AssemblerError),

    /// File sink rejected a reconstructed artifact
    #[error("sink error: {0}")]
    Sink(#[from] std::io::Error),
}

impl HandlerError {
    /// Shorthand for a [`HandlerError::Malformed`].
    pub fn malformed(protocol: &'static str, reason: impl Into<String>) -> Self {
        HandlerError::Malformed {
            protocol,
            reason: reason.into(),
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
