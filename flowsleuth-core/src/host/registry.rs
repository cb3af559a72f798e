//! Address-keyed host table.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Host;

/// Shared handle to one host record.
pub type HostHandle = Arc<Mutex<Host>>;

/// All hosts observed since the last reset, ordered by address.
///
/// The registry lock covers only the map lookup; callers lock the returned
/// handle afterwards.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: Mutex<BTreeMap<IpAddr, HostHandle>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing host for `address`, or a new one first seen at `frame`.
    /// The flag is true when the host was created by this call.
    pub fn get_or_insert(&self, address: IpAddr, frame: u64, timestamp_us: i64) -> (HostHandle, bool) {
        let mut hosts = self.hosts.lock();
        if let Some(host) = hosts.get(&address) {
            return (Arc::clone(host), false);
        }
        let host = Arc::new(Mutex::new(Host::new(address, frame, timestamp_us)));
        hosts.insert(address, Arc::clone(&host));
        (host, true)
    }

    pub fn get(&self, address: &IpAddr) -> Option<HostHandle> {
        self.hosts.lock().get(address).cloned()
    }

    pub fn len(&self) -> usize {
        self.hosts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.lock().is_empty()
    }

    /// Copies of every host, ordered by address.
    pub fn snapshot(&self) -> Vec<Host> {
        let handles: Vec<HostHandle> = self.hosts.lock().values().cloned().collect();
        handles.iter().map(|h| h.lock().clone()).collect()
    }

    pub fn clear(&self) {
        self.hosts.lock().clear();
    }
}
