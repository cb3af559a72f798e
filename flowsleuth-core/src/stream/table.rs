//! Active TCP session pool.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{ConnectionKey, TcpSession};
use crate::cache::{CacheStats, PopularityCache};

/// Shared handle to one session. The table lock is released before a
/// handle's own lock is taken.
pub type SessionHandle = Arc<Mutex<TcpSession>>;

/// Capacity-bounded map of active sessions.
///
/// Sessions pushed out by capacity pressure are force-closed by the
/// eviction hook and parked until [`SessionTable::take_evicted`] collects
/// them, so the dispatcher can flush their handlers and assemblers.
///
/// Callers must not hold a session lock while calling into the table: the
/// eviction hook locks the evicted session.
pub struct SessionTable {
    cache: Mutex<PopularityCache<ConnectionKey, SessionHandle>>,
    evicted: Arc<Mutex<Vec<(ConnectionKey, SessionHandle)>>>,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        let evicted: Arc<Mutex<Vec<(ConnectionKey, SessionHandle)>>> = Arc::default();
        let parked = Arc::clone(&evicted);
        let cache = PopularityCache::with_eviction_hook(
            capacity,
            move |key: ConnectionKey, session: SessionHandle| {
                {
                    let mut guard = session.lock();
                    debug!(
                        client = %guard.client(),
                        server = %guard.server(),
                        state = guard.state().as_str(),
                        "session evicted"
                    );
                    guard.force_close();
                }
                parked.lock().push((key, session));
            },
        );
        Self {
            cache: Mutex::new(cache),
            evicted,
        }
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<SessionHandle> {
        self.cache.lock().get(key).cloned()
    }

    /// Insert a new session and return its handle.
    pub fn insert(&self, key: ConnectionKey, session: TcpSession) -> SessionHandle {
        let handle = Arc::new(Mutex::new(session));
        let replaced = self.cache.lock().insert(key, Arc::clone(&handle));
        if let Some(old) = replaced {
            old.lock().force_close();
        }
        handle
    }

    pub fn remove(&self, key: &ConnectionKey) -> Option<SessionHandle> {
        self.cache.lock().remove(key)
    }

    /// Sessions evicted since the last call, already closed.
    pub fn take_evicted(&self) -> Vec<(ConnectionKey, SessionHandle)> {
        std::mem::take(&mut *self.evicted.lock())
    }

    /// Remove every session, oldest first. Does not close them.
    pub fn drain(&self) -> Vec<(ConnectionKey, SessionHandle)> {
        self.cache.lock().drain()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
        self.evicted.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }
}
