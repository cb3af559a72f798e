//! Error types for the flowsleuth front end.

use thiserror::Error;

/// Errors raised while reading a capture file.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// I/O error opening or reading the source
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unrecognized or unreadable container
    #[error("Invalid capture format: {reason}")]
    InvalidFormat { reason: String },

    /// A record could not be parsed; everything before it was delivered
    #[error("Capture read error after record {record}: {reason}")]
    Read { record: u64, reason: String },
}

/// Errors raised by the directory sink.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Output root exists but is not a directory
    #[error("Not a directory: {path}")]
    NotADirectory { path: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
