//! Single file transfer reconstruction.

use std::io::Read;
use std::net::SocketAddr;

use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use tracing::warn;

use super::ChunkDecoder;
use crate::error::AssemblerError;
use crate::protocol::ApplicationProtocol;

/// Default per-file ceiling (64 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// Assembler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    /// Created but not yet confirmed by the handler.
    Pending,
    Active,
    Finished,
    Aborted,
}

impl AssemblerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssemblerState::Pending => "pending",
            AssemblerState::Active => "active",
            AssemblerState::Finished => "finished",
            AssemblerState::Aborted => "aborted",
        }
    }
}

/// How the end of the transfer is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Declared byte count.
    Known(u64),
    /// HTTP chunked transfer coding.
    Chunked,
    /// Ends when the stream closes or the length becomes known later.
    UntilClose,
}

/// Content coding removed when the file is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    #[default]
    Identity,
    Gzip,
    Deflate,
}

impl ContentEncoding {
    /// Parse a `Content-Encoding` header value.
    pub fn from_header(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => ContentEncoding::Gzip,
            "deflate" => ContentEncoding::Deflate,
            _ => ContentEncoding::Identity,
        }
    }
}

/// Where a transfer came from and what to call it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Sender of the file bytes.
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub protocol: ApplicationProtocol,
    pub filename: String,
    /// Relative location suggested to the sink.
    pub path_hint: String,
    /// Free-form description (request line, handle, ...).
    pub details: String,
    pub frame: u64,
    pub timestamp_us: i64,
}

/// A completed, decoded file.
#[derive(Debug, Clone)]
pub struct ReconstructedFile {
    pub metadata: FileMetadata,
    pub data: Bytes,
}

impl ReconstructedFile {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Stateful reconstructor for one transfer.
#[derive(Debug)]
pub struct FileAssembler {
    metadata: FileMetadata,
    framing: Framing,
    encoding: ContentEncoding,
    state: AssemblerState,
    /// Bytes still expected under `Framing::Known`.
    remaining: u64,
    /// Raw bytes accepted, framing included.
    received: u64,
    buffer: Vec<u8>,
    chunks: Option<ChunkDecoder>,
    max_size: u64,
}

impl FileAssembler {
    pub fn new(metadata: FileMetadata, framing: Framing) -> Self {
        Self {
            metadata,
            framing,
            encoding: ContentEncoding::Identity,
            state: AssemblerState::Pending,
            remaining: match framing {
                Framing::Known(n) => n,
                _ => 0,
            },
            received: 0,
            buffer: Vec::new(),
            chunks: matches!(framing, Framing::Chunked).then(ChunkDecoder::new),
            max_size: DEFAULT_MAX_FILE_SIZE,
        }
    }

    pub fn with_encoding(mut self, encoding: ContentEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == AssemblerState::Finished
    }

    pub fn is_active(&self) -> bool {
        self.state == AssemblerState::Active
    }

    /// Raw bytes accepted so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Decoded bytes buffered so far.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes still expected, if the length is known.
    pub fn remaining(&self) -> Option<u64> {
        match self.framing {
            Framing::Known(_) => Some(self.remaining),
            _ => None,
        }
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    fn invalid(&self, operation: &'static str) -> AssemblerError {
        AssemblerError::InvalidState {
            state: self.state.as_str(),
            operation,
        }
    }

    /// Confirm the transfer. An empty declared length finishes at once.
    pub fn activate(&mut self) -> Result<(), AssemblerError> {
        if self.state != AssemblerState::Pending {
            return Err(self.invalid("activate"));
        }
        self.state = AssemblerState::Active;
        if self.framing == Framing::Known(0) {
            self.state = AssemblerState::Finished;
        }
        Ok(())
    }

    /// Accept transfer bytes and return how many belong to this file.
    ///
    /// Bytes past the declared end (or past the last chunk) are not
    /// consumed; they belong to whatever follows on the stream.
    pub fn add_data(&mut self, data: &[u8]) -> Result<usize, AssemblerError> {
        if self.state != AssemblerState::Active {
            return Err(self.invalid("add data"));
        }

        let consumed = match self.framing {
            Framing::Known(_) => {
                let take = self.remaining.min(data.len() as u64) as usize;
                self.buffer.extend_from_slice(&data[..take]);
                self.remaining -= take as u64;
                take
            }
            Framing::UntilClose => {
                self.buffer.extend_from_slice(data);
                data.len()
            }
            Framing::Chunked => {
                let decoder = self.chunks.get_or_insert_with(ChunkDecoder::new);
                match decoder.push(data, &mut self.buffer) {
                    Ok(n) => n,
                    Err(e) => {
                        self.abort();
                        return Err(e);
                    }
                }
            }
        };
        self.received += consumed as u64;

        if self.buffer.len() as u64 > self.max_size {
            let limit = self.max_size;
            self.abort();
            return Err(AssemblerError::SizeLimit { limit });
        }

        let complete = match self.framing {
            Framing::Known(_) => self.remaining == 0,
            Framing::Chunked => self.chunks.as_ref().is_some_and(ChunkDecoder::is_done),
            Framing::UntilClose => false,
        };
        if complete {
            self.state = AssemblerState::Finished;
        }
        Ok(consumed)
    }

    /// Fix the number of bytes still to come on an unknown-length or
    /// declared-length transfer. Zero finishes the file.
    pub fn set_remaining(&mut self, remaining: u64) -> Result<(), AssemblerError> {
        match self.state {
            AssemblerState::Pending | AssemblerState::Active => {}
            _ => return Err(self.invalid("set remaining")),
        }
        if self.framing == Framing::Chunked {
            return Err(AssemblerError::Framing(
                "chunked transfer length is self-delimited".to_string(),
            ));
        }
        self.framing = Framing::Known(self.buffer.len() as u64 + remaining);
        self.remaining = remaining;
        if remaining == 0 && self.state == AssemblerState::Active {
            self.state = AssemblerState::Finished;
        }
        Ok(())
    }

    /// Finish explicitly, typically on a closing FIN.
    ///
    /// A declared length that was not reached aborts the transfer instead.
    pub fn finish(&mut self) -> Result<(), AssemblerError> {
        match self.state {
            AssemblerState::Finished => return Ok(()),
            AssemblerState::Active => {}
            _ => return Err(self.invalid("finish")),
        }
        match self.framing {
            Framing::Known(expected) if self.remaining > 0 => {
                let missing = self.remaining;
                self.abort();
                Err(AssemblerError::Incomplete { expected, missing })
            }
            Framing::Chunked if !self.chunks.as_ref().is_some_and(ChunkDecoder::is_done) => {
                let expected = self.buffer.len() as u64;
                self.abort();
                Err(AssemblerError::Incomplete {
                    expected,
                    missing: 0,
                })
            }
            _ => {
                self.state = AssemblerState::Finished;
                Ok(())
            }
        }
    }

    /// Drop the transfer. Nothing is emitted and buffered bytes are freed.
    pub fn abort(&mut self) {
        self.state = AssemblerState::Aborted;
        self.buffer = Vec::new();
        self.chunks = None;
    }

    /// Take the decoded file out of a finished assembler.
    pub fn take_file(&mut self) -> Result<ReconstructedFile, AssemblerError> {
        if self.state != AssemblerState::Finished {
            return Err(self.invalid("take file"));
        }
        let raw = std::mem::take(&mut self.buffer);
        let data = decode_content(self.encoding, raw);
        Ok(ReconstructedFile {
            metadata: self.metadata.clone(),
            data: Bytes::from(data),
        })
    }

    pub fn into_file(mut self) -> Result<ReconstructedFile, AssemblerError> {
        self.take_file()
    }
}

/// Remove the content coding. Undecodable content is kept as received.
fn decode_content(encoding: ContentEncoding, raw: Vec<u8>) -> Vec<u8> {
    let decoded = match encoding {
        ContentEncoding::Identity => return raw,
        ContentEncoding::Gzip => read_all(GzDecoder::new(raw.as_slice())),
        // "deflate" is zlib-wrapped per RFC 9110, but raw deflate is common
        ContentEncoding::Deflate => read_all(ZlibDecoder::new(raw.as_slice()))
            .or_else(|_| read_all(DeflateDecoder::new(raw.as_slice()))),
    };
    match decoded {
        Ok(data) => data,
        Err(e) => {
            warn!(?encoding, error = %e, "content decoding failed, keeping raw bytes");
            raw
        }
    }
}

fn read_all<R: Read>(mut reader: R) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}
