//! Per-address host records.
//!
//! A [`Host`] is created the first time an address shows up in a frame and
//! lives until a full reset. The dispatcher updates counters and the
//! link-layer address; handlers add names, services, OS votes and details
//! through the [`HostHandle`] they are given.

mod registry;

pub use registry::{HostHandle, HostRegistry};

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::net::IpAddr;

use compact_str::CompactString;

use crate::protocol::ApplicationProtocol;

/// Number of recent link-layer addresses remembered per host.
pub const MAC_HISTORY_LEN: usize = 4;

/// Fingerprinter name for votes cast from the IP TTL or hop limit.
pub const TTL_FINGERPRINTER: &str = "ttl";

/// OS family whose usual initial TTL (64, 128 or 255) is the smallest one
/// not below `ttl`.
pub fn os_from_ttl(ttl: u8) -> &'static str {
    match ttl {
        0..=64 => "Linux/Unix",
        65..=128 => "Windows",
        _ => "Network device",
    }
}

/// Six-byte link-layer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Result of [`Host::set_mac`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacChange {
    /// First address ever recorded.
    First,
    /// Same as the current address.
    Unchanged,
    /// Switched back to an address seen recently.
    Recent { previous: MacAddr },
    /// An address not in the recent history.
    New { previous: MacAddr },
}

/// Metadata about a service a host offers on one port.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Service {
    pub protocol: Option<ApplicationProtocol>,
    pub attributes: BTreeMap<CompactString, String>,
}

/// One tracked network identity.
#[derive(Debug, Clone)]
pub struct Host {
    address: IpAddr,
    mac: Option<MacAddr>,
    /// Most recent first, current address included.
    mac_history: VecDeque<MacAddr>,
    hostnames: BTreeSet<String>,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    services: BTreeMap<u16, Service>,
    /// fingerprinter -> OS guess -> accumulated weight
    os_votes: BTreeMap<CompactString, BTreeMap<CompactString, f64>>,
    open_tcp_ports: BTreeSet<u16>,
    details: Vec<(CompactString, String)>,
    first_seen_frame: u64,
    first_seen_us: i64,
    last_seen_us: i64,
}

impl Host {
    pub fn new(address: IpAddr, first_seen_frame: u64, timestamp_us: i64) -> Self {
        Self {
            address,
            mac: None,
            mac_history: VecDeque::with_capacity(MAC_HISTORY_LEN),
            hostnames: BTreeSet::new(),
            packets_sent: 0,
            packets_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            services: BTreeMap::new(),
            os_votes: BTreeMap::new(),
            open_tcp_ports: BTreeSet::new(),
            details: Vec::new(),
            first_seen_frame,
            first_seen_us: timestamp_us,
            last_seen_us: timestamp_us,
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn mac(&self) -> Option<MacAddr> {
        self.mac
    }

    pub fn mac_history(&self) -> impl Iterator<Item = &MacAddr> {
        self.mac_history.iter()
    }

    /// Record the link-layer address seen for this host.
    ///
    /// Switching between addresses in the short history is reported as
    /// [`MacChange::Recent`], so hosts that alternate between a couple of
    /// interfaces do not look like spoofing.
    pub fn set_mac(&mut self, mac: MacAddr) -> MacChange {
        let change = match self.mac {
            None => MacChange::First,
            Some(current) if current == mac => return MacChange::Unchanged,
            Some(previous) if self.mac_history.contains(&mac) => MacChange::Recent { previous },
            Some(previous) => MacChange::New { previous },
        };
        self.mac_history.retain(|m| *m != mac);
        self.mac_history.push_front(mac);
        self.mac_history.truncate(MAC_HISTORY_LEN);
        self.mac = Some(mac);
        change
    }

    /// Returns true if the name was not known yet.
    pub fn add_hostname(&mut self, name: &str) -> bool {
        let name = name.trim_end_matches('.');
        if name.is_empty() || self.hostnames.contains(name) {
            return false;
        }
        self.hostnames.insert(name.to_string())
    }

    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        self.hostnames.iter().map(String::as_str)
    }

    pub fn record_sent(&mut self, bytes: usize, timestamp_us: i64) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
        self.last_seen_us = self.last_seen_us.max(timestamp_us);
    }

    pub fn record_received(&mut self, bytes: usize, timestamp_us: i64) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
        self.last_seen_us = self.last_seen_us.max(timestamp_us);
    }

    /// Service entry for `port`, created on first use.
    pub fn service_mut(&mut self, port: u16) -> &mut Service {
        self.services.entry(port).or_default()
    }

    pub fn services(&self) -> &BTreeMap<u16, Service> {
        &self.services
    }

    pub fn add_open_tcp_port(&mut self, port: u16) -> bool {
        self.open_tcp_ports.insert(port)
    }

    pub fn open_tcp_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.open_tcp_ports.iter().copied()
    }

    /// Add `weight` to the score `fingerprinter` gives `os`.
    pub fn add_os_vote(&mut self, fingerprinter: &str, os: &str, weight: f64) {
        *self
            .os_votes
            .entry(CompactString::from(fingerprinter))
            .or_default()
            .entry(CompactString::from(os))
            .or_insert(0.0) += weight;
    }

    /// One vote from the TTL of a packet this host sent.
    pub fn vote_os_from_ttl(&mut self, ttl: u8) {
        self.add_os_vote(TTL_FINGERPRINTER, os_from_ttl(ttl), 1.0);
    }

    /// OS with the highest score summed over all fingerprinters.
    pub fn best_os_guess(&self) -> Option<(&str, f64)> {
        let mut totals: BTreeMap<&str, f64> = BTreeMap::new();
        for guesses in self.os_votes.values() {
            for (os, weight) in guesses {
                *totals.entry(os.as_str()).or_insert(0.0) += weight;
            }
        }
        totals
            .into_iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
    }

    pub fn os_votes(&self, fingerprinter: &str) -> Option<&BTreeMap<CompactString, f64>> {
        self.os_votes.get(fingerprinter)
    }

    /// Set a detail, replacing an earlier value under the same key.
    pub fn set_detail(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.details.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.details.push((CompactString::from(key), value)),
        }
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn details(&self) -> &[(CompactString, String)] {
        &self.details
    }

    pub fn first_seen_frame(&self) -> u64 {
        self.first_seen_frame
    }

    pub fn first_seen_us(&self) -> i64 {
        self.first_seen_us
    }

    pub fn last_seen_us(&self) -> i64 {
        self.last_seen_us
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Host {}

impl PartialOrd for Host {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Host {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address.cmp(&other.address)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)?;
        if let Some(name) = self.hostnames.iter().next() {
            write!(f, " [{name}]")?;
        }
        if let Some(mac) = self.mac {
            write!(f, " ({mac})")?;
        }
        Ok(())
    }
}
