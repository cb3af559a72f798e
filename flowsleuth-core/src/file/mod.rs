//! File reconstruction.
//!
//! A handler that recognizes a transfer creates a [`FileAssembler`] in
//! `Pending`, activates it once the transfer is confirmed, and pushes body
//! bytes into it. Finished files go to a [`FileSink`]. Assemblers live in a
//! [`FileAssemblerList`] so an abandoned transfer is settled by capacity
//! pressure instead of leaking.

mod assembler;
mod chunked;
mod list;
mod sink;

pub use assembler::{
    AssemblerState, ContentEncoding, FileAssembler, FileMetadata, Framing, ReconstructedFile,
    DEFAULT_MAX_FILE_SIZE,
};
pub use chunked::ChunkDecoder;
pub use list::{AssemblerKey, AssemblerOutcome, CloseReason, FileAssemblerList};
pub use sink::{FileSink, MemorySink, NullSink};

/// Replace path separators and control characters so a name taken from
/// the wire cannot escape the sink's directory.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.chars().take(200).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename(".."), "unnamed");
        assert_eq!(sanitize_filename("a\u{0}b"), "a_b");
    }
}
