//! Capacity-bounded set of in-flight file assemblers.

use std::net::SocketAddr;
use std::sync::Arc;

use compact_str::CompactString;
use parking_lot::Mutex;
use tracing::debug;

use super::{FileAssembler, Framing, ReconstructedFile};
use crate::cache::{CacheStats, PopularityCache};
use crate::protocol::ApplicationProtocol;

/// Identity of one transfer.
///
/// `extended_id` separates transfers multiplexed over one connection
/// (file handles, stream ids); it is `None` for one-at-a-time protocols.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssemblerKey {
    pub client: SocketAddr,
    pub server: SocketAddr,
    pub protocol: ApplicationProtocol,
    pub extended_id: Option<CompactString>,
}

impl AssemblerKey {
    pub fn new(client: SocketAddr, server: SocketAddr, protocol: ApplicationProtocol) -> Self {
        Self {
            client,
            server,
            protocol,
            extended_id: None,
        }
    }

    pub fn with_extended_id(mut self, id: impl Into<CompactString>) -> Self {
        self.extended_id = Some(id.into());
        self
    }

    fn same_connection(&self, client: SocketAddr, server: SocketAddr) -> bool {
        self.client == client && self.server == server
    }
}

/// How the connection carrying a set of assemblers ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly FIN close or end of capture.
    Fin,
    /// RST; incomplete transfers are aborted.
    Reset,
}

/// What became of an assembler that left the list.
#[derive(Debug)]
pub enum AssemblerOutcome {
    Finished(ReconstructedFile),
    /// Active transfer that could not complete.
    Aborted {
        key: AssemblerKey,
        assembler: FileAssembler,
    },
    /// Never activated.
    Discarded { key: AssemblerKey },
}

/// Settle an assembler leaving the list. A closing stream finishes an
/// unknown-length transfer that has data; everything else incomplete is
/// aborted.
fn settle(key: AssemblerKey, mut assembler: FileAssembler, reason: CloseReason) -> AssemblerOutcome {
    use super::AssemblerState::*;

    if assembler.state() == Pending {
        assembler.abort();
        return AssemblerOutcome::Discarded { key };
    }
    if assembler.state() == Active
        && reason == CloseReason::Fin
        && assembler.framing() == Framing::UntilClose
        && assembler.buffered() > 0
    {
        // finish() on an UntilClose transfer cannot fail
        let _ = assembler.finish();
    }
    if assembler.state() == Active {
        assembler.abort();
    }
    match assembler.take_file() {
        Ok(file) => AssemblerOutcome::Finished(file),
        Err(_) => AssemblerOutcome::Aborted { key, assembler },
    }
}

/// In-flight transfers keyed by connection, protocol and extended id.
///
/// Capacity pressure settles the coldest assembler as if its stream had
/// closed; the result is parked until [`FileAssemblerList::take_evicted`].
pub struct FileAssemblerList {
    cache: Mutex<PopularityCache<AssemblerKey, FileAssembler>>,
    evicted: Arc<Mutex<Vec<AssemblerOutcome>>>,
}

impl FileAssemblerList {
    pub fn new(capacity: usize) -> Self {
        let evicted: Arc<Mutex<Vec<AssemblerOutcome>>> = Arc::default();
        let parked = Arc::clone(&evicted);
        let cache = PopularityCache::with_eviction_hook(
            capacity,
            move |key: AssemblerKey, assembler: FileAssembler| {
                debug!(
                    client = %key.client,
                    server = %key.server,
                    protocol = %key.protocol,
                    state = assembler.state().as_str(),
                    received = assembler.received(),
                    "file assembler evicted"
                );
                parked.lock().push(settle(key, assembler, CloseReason::Fin));
            },
        );
        Self {
            cache: Mutex::new(cache),
            evicted,
        }
    }

    /// Register a transfer, returning any assembler it replaced.
    pub fn insert(&self, key: AssemblerKey, assembler: FileAssembler) -> Option<FileAssembler> {
        self.cache.lock().insert(key, assembler)
    }

    pub fn contains(&self, key: &AssemblerKey) -> bool {
        self.cache.lock().contains_key(key)
    }

    /// Run `f` on the assembler under `key`, marking it recently used.
    pub fn with_mut<R>(&self, key: &AssemblerKey, f: impl FnOnce(&mut FileAssembler) -> R) -> Option<R> {
        self.cache.lock().get_mut(key).map(f)
    }

    pub fn remove(&self, key: &AssemblerKey) -> Option<FileAssembler> {
        self.cache.lock().remove(key)
    }

    /// Remove and return the file under `key` if it has finished.
    pub fn take_finished(&self, key: &AssemblerKey) -> Option<ReconstructedFile> {
        let mut cache = self.cache.lock();
        if !cache.peek(key).is_some_and(FileAssembler::is_finished) {
            return None;
        }
        cache.remove(key).and_then(|a| a.into_file().ok())
    }

    /// Remove every assembler belonging to one connection and settle it.
    pub fn drain_connection(
        &self,
        client: SocketAddr,
        server: SocketAddr,
        reason: CloseReason,
    ) -> Vec<AssemblerOutcome> {
        let removed = self
            .cache
            .lock()
            .remove_where(|key, _| key.same_connection(client, server));
        removed
            .into_iter()
            .map(|(key, assembler)| settle(key, assembler, reason))
            .collect()
    }

    /// Remove and settle everything (end of capture).
    pub fn drain_all(&self) -> Vec<AssemblerOutcome> {
        let removed = self.cache.lock().drain();
        removed
            .into_iter()
            .map(|(key, assembler)| settle(key, assembler, CloseReason::Fin))
            .collect()
    }

    /// Outcomes of assemblers evicted since the last call.
    pub fn take_evicted(&self) -> Vec<AssemblerOutcome> {
        std::mem::take(&mut *self.evicted.lock())
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cache.lock().capacity()
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
        self.evicted.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }
}
