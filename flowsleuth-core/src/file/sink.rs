//! Destinations for reconstructed files.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

/// Receives finished files as `(path_hint, bytes)`.
///
/// The returned string is where the file ended up, reported in
/// `FileReconstructed` events. Layout is up to the sink.
pub trait FileSink: Send {
    fn store(&mut self, path_hint: &str, data: &[u8]) -> io::Result<String>;
}

/// Keeps every stored file in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    files: Arc<Mutex<Vec<(String, Bytes)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored files in arrival order.
    pub fn files(&self) -> Vec<(String, Bytes)> {
        self.files.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

impl FileSink for MemorySink {
    fn store(&mut self, path_hint: &str, data: &[u8]) -> io::Result<String> {
        self.files
            .lock()
            .push((path_hint.to_string(), Bytes::copy_from_slice(data)));
        Ok(format!("memory:{path_hint}"))
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl FileSink for NullSink {
    fn store(&mut self, path_hint: &str, _data: &[u8]) -> io::Result<String> {
        Ok(path_hint.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_shares_storage() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        let location = writer.store("10.0.0.1/TCP-80/a.txt", b"abc").unwrap();
        assert_eq!(location, "memory:10.0.0.1/TCP-80/a.txt");
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.files()[0].1.as_ref(), b"abc");
    }
}
