//! IPv4 fragment reassembly.
//!
//! Owned by one pipeline instance; nothing here is process-global.
//! Completed datagrams are rebuilt with a plain 20-byte header and fed back
//! through the decoder as a raw IPv4 frame.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use bytes::{Bytes, BytesMut};
use etherparse::{IpNumber, Ipv4Header};
use parking_lot::Mutex;
use tracing::trace;

use crate::cache::{CacheStats, PopularityCache};
use crate::protocol::Ipv4Layer;

/// Largest datagram an IPv4 header can describe.
const MAX_DATAGRAM: usize = u16::MAX as usize;

/// Fragments belonging to one datagram share this key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: u8,
    pub identification: u16,
}

impl From<&Ipv4Layer> for FragmentKey {
    fn from(ip: &Ipv4Layer) -> Self {
        Self {
            source: ip.source,
            destination: ip.destination,
            protocol: ip.protocol,
            identification: ip.identification,
        }
    }
}

#[derive(Debug, Default)]
struct FragmentBuffer {
    /// payload offset -> bytes, first arrival kept
    parts: BTreeMap<usize, Bytes>,
    /// Payload length, known once the last fragment arrives.
    total: Option<usize>,
    ttl: u8,
}

impl FragmentBuffer {
    /// Stitch the payload together if every byte is present.
    fn assemble(&self) -> Option<Bytes> {
        let total = self.total?;
        let mut out = BytesMut::with_capacity(total);
        for (&offset, part) in &self.parts {
            let have = out.len();
            if offset > have {
                return None;
            }
            let end = (offset + part.len()).min(total);
            if end > have {
                out.extend_from_slice(&part[have - offset..end - offset]);
            }
        }
        (out.len() == total).then(|| out.freeze())
    }
}

/// Bounded cache of partially received datagrams.
pub struct FragmentCache {
    cache: Mutex<PopularityCache<FragmentKey, FragmentBuffer>>,
}

impl FragmentCache {
    pub fn new(capacity: usize) -> Self {
        let cache = PopularityCache::with_eviction_hook(
            capacity,
            |key: FragmentKey, buffer: FragmentBuffer| {
                trace!(
                    src = %key.source,
                    dst = %key.destination,
                    id = key.identification,
                    parts = buffer.parts.len(),
                    "incomplete datagram evicted"
                );
            },
        );
        Self {
            cache: Mutex::new(cache),
        }
    }

    /// Add one fragment's payload. Returns the whole datagram, header
    /// included, once the last missing piece arrives.
    pub fn add_fragment(&self, ip: &Ipv4Layer, payload: Bytes) -> Option<Bytes> {
        let key = FragmentKey::from(ip);
        let offset = usize::from(ip.fragment_offset);
        let end = offset + payload.len();
        if end > MAX_DATAGRAM - Ipv4Header::MIN_LEN {
            self.cache.lock().remove(&key);
            return None;
        }

        let assembled = {
            let mut cache = self.cache.lock();
            if !cache.contains_key(&key) {
                cache.insert(key, FragmentBuffer::default());
            }
            let buffer = cache.get_mut(&key)?;
            buffer.parts.entry(offset).or_insert(payload);
            if !ip.more_fragments {
                buffer.total = Some(end);
            }
            if offset == 0 {
                buffer.ttl = ip.ttl;
            }
            let assembled = buffer.assemble().map(|data| (data, buffer.ttl));
            if assembled.is_some() {
                cache.remove(&key);
            }
            assembled
        };

        let (payload, ttl) = assembled?;
        rebuild_datagram(&key, ttl, &payload)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }
}

fn rebuild_datagram(key: &FragmentKey, ttl: u8, payload: &[u8]) -> Option<Bytes> {
    let payload_len = u16::try_from(payload.len()).ok()?;
    let mut header = Ipv4Header::new(
        payload_len,
        ttl,
        IpNumber(key.protocol),
        key.source.octets(),
        key.destination.octets(),
    )
    .ok()?;
    header.identification = key.identification;
    header.header_checksum = header.calc_header_checksum();

    let mut out = BytesMut::with_capacity(Ipv4Header::MIN_LEN + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    Some(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Decoder, LinkType};

    fn fragment(offset: u16, more: bool, id: u16) -> Ipv4Layer {
        Ipv4Layer {
            source: Ipv4Addr::new(10, 0, 0, 1),
            destination: Ipv4Addr::new(10, 0, 0, 2),
            protocol: 17,
            ttl: 64,
            identification: id,
            dont_fragment: false,
            more_fragments: more,
            fragment_offset: offset,
            total_length: 0,
            header_length: 20,
        }
    }

    fn udp_datagram() -> Vec<u8> {
        // UDP header (8) + 24 bytes payload
        let mut d = vec![0x30, 0x39, 0x00, 0x35, 0x00, 32, 0x00, 0x00];
        d.extend_from_slice(b"abcdefghijklmnopqrstuvwx");
        d
    }

    #[test]
    fn test_out_of_order_fragments_reassemble() {
        let cache = FragmentCache::new(8);
        let d = udp_datagram();

        assert!(cache
            .add_fragment(&fragment(16, false, 7), Bytes::copy_from_slice(&d[16..]))
            .is_none());
        assert!(cache
            .add_fragment(&fragment(0, true, 7), Bytes::copy_from_slice(&d[..8]))
            .is_none());
        let whole = cache
            .add_fragment(&fragment(8, true, 7), Bytes::copy_from_slice(&d[8..16]))
            .unwrap();
        assert!(cache.is_empty());
        assert_eq!(&whole[20..], &d[..]);

        let frame = Decoder::default()
            .decode(1, 0, LinkType::Ipv4, whole)
            .unwrap();
        let udp = frame.udp().unwrap();
        assert_eq!(udp.destination_port, 53);
        assert_eq!(frame.payload().unwrap().bytes(), b"abcdefghijklmnopqrstuvwx");
    }

    #[test]
    fn test_gap_keeps_waiting() {
        let cache = FragmentCache::new(8);
        let d = udp_datagram();
        cache.add_fragment(&fragment(0, true, 9), Bytes::copy_from_slice(&d[..8]));
        assert!(cache
            .add_fragment(&fragment(16, false, 9), Bytes::copy_from_slice(&d[16..]))
            .is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_distinct_ids_do_not_mix() {
        let cache = FragmentCache::new(1);
        let d = udp_datagram();
        cache.add_fragment(&fragment(0, true, 1), Bytes::copy_from_slice(&d[..8]));
        // Capacity 1: id 2 evicts id 1
        cache.add_fragment(&fragment(0, true, 2), Bytes::copy_from_slice(&d[..8]));
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache
            .add_fragment(&fragment(8, false, 1), Bytes::copy_from_slice(&d[8..]))
            .is_none());
    }
}
