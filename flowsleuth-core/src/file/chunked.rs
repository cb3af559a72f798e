//! Incremental HTTP chunked transfer decoding.
//!
//! Unlike a one-shot parser over a complete body, [`ChunkDecoder`] keeps
//! its position between pushes, so chunk headers and CRLFs may be split at
//! any byte boundary.

use crate::error::AssemblerError;

/// Longest accepted chunk-size or trailer line.
const MAX_LINE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Reading the hex size line.
    Size,
    /// Inside chunk data.
    Data { remaining: u64 },
    /// Expecting the CRLF after chunk data; `seen` bytes of it consumed.
    DataEnd { seen: u8 },
    /// Reading trailer lines after the last chunk.
    Trailer,
    Done,
}

/// Streaming decoder for `Transfer-Encoding: chunked` bodies.
#[derive(Debug, Clone)]
pub struct ChunkDecoder {
    state: ChunkState,
    line: Vec<u8>,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            line: Vec::new(),
        }
    }

    /// The terminating zero-size chunk and trailers have been read.
    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Decode as much of `input` as possible, appending chunk data to
    /// `out`. Returns the number of input bytes consumed; input after the
    /// end of the body is left untouched.
    pub fn push(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, AssemblerError> {
        let mut pos = 0;
        while pos < input.len() {
            match self.state {
                ChunkState::Size => {
                    let Some(line) = self.read_line(input, &mut pos)? else {
                        break;
                    };
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data { remaining: size }
                    };
                }
                ChunkState::Data { remaining } => {
                    let take = remaining.min((input.len() - pos) as u64) as usize;
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        ChunkState::DataEnd { seen: 0 }
                    } else {
                        ChunkState::Data { remaining }
                    };
                }
                ChunkState::DataEnd { seen } => {
                    let expected = if seen == 0 { b'\r' } else { b'\n' };
                    if input[pos] != expected {
                        return Err(AssemblerError::Framing(
                            "missing CRLF after chunk data".to_string(),
                        ));
                    }
                    pos += 1;
                    self.state = if seen == 0 {
                        ChunkState::DataEnd { seen: 1 }
                    } else {
                        ChunkState::Size
                    };
                }
                ChunkState::Trailer => {
                    let Some(line) = self.read_line(input, &mut pos)? else {
                        break;
                    };
                    if line.is_empty() {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => break,
            }
        }
        Ok(pos)
    }

    /// Accumulate one CRLF-terminated line across pushes. Returns the line
    /// without its terminator once complete.
    fn read_line(&mut self, input: &[u8], pos: &mut usize) -> Result<Option<Vec<u8>>, AssemblerError> {
        while *pos < input.len() {
            let byte = input[*pos];
            *pos += 1;
            if byte == b'\n' {
                if self.line.last() == Some(&b'\r') {
                    self.line.pop();
                }
                return Ok(Some(std::mem::take(&mut self.line)));
            }
            if self.line.len() >= MAX_LINE {
                return Err(AssemblerError::Framing("chunk line too long".to_string()));
            }
            self.line.push(byte);
        }
        Ok(None)
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, AssemblerError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| AssemblerError::Framing("non-ASCII chunk size".to_string()))?;
    // Chunk extensions follow a semicolon
    let size = text.split(';').next().unwrap_or(text).trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| AssemblerError::Framing(format!("bad chunk size {size:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"5\r\nhello\r\n7;name=x\r\n, world\r\n0\r\nX-Trailer: 1\r\n\r\nNEXT";

    #[test]
    fn test_decode_in_one_push() {
        let mut decoder = ChunkDecoder::new();
        let mut out = Vec::new();
        let consumed = decoder.push(BODY, &mut out).unwrap();
        assert!(decoder.is_done());
        assert_eq!(out, b"hello, world");
        assert_eq!(&BODY[consumed..], b"NEXT");
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let mut decoder = ChunkDecoder::new();
        let mut out = Vec::new();
        let mut consumed = 0;
        for i in 0..BODY.len() {
            consumed += decoder.push(&BODY[i..i + 1], &mut out).unwrap();
            if decoder.is_done() {
                break;
            }
        }
        assert_eq!(out, b"hello, world");
        assert_eq!(consumed, BODY.len() - 4);
    }

    #[test]
    fn test_bad_size_is_framing_error() {
        let mut decoder = ChunkDecoder::new();
        let mut out = Vec::new();
        let err = decoder.push(b"zz\r\n", &mut out).unwrap_err();
        assert!(matches!(err, AssemblerError::Framing(_)));
    }

    #[test]
    fn test_missing_crlf_after_data() {
        let mut decoder = ChunkDecoder::new();
        let mut out = Vec::new();
        assert!(decoder.push(b"2\r\nabXY", &mut out).is_err());
    }
}
