//! Display attributes attached to decoded layers.
//!
//! Typed header data lives in [`Layer`](super::Layer); the values here are
//! the free-form name/value pairs a presentation layer renders as rows.
//! Borrowed variants point straight into the frame buffer while a layer is
//! being decoded and are converted with [`FieldValue::to_owned`] when the
//! packet is materialized.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use compact_str::CompactString;

/// A single attribute value.
#[derive(Debug, Clone)]
pub enum FieldValue<'data> {
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Bool(bool),
    IpAddr(IpAddr),
    MacAddr([u8; 6]),
    /// Zero-copy string inside the frame (or a static label).
    Str(&'data str),
    /// Zero-copy bytes inside the frame.
    Bytes(&'data [u8]),
    /// Constructed string, inline up to 24 bytes.
    OwnedString(CompactString),
    OwnedBytes(Vec<u8>),
    Null,
}

/// Attribute value that owns all of its data.
pub type OwnedFieldValue = FieldValue<'static>;

impl<'data> FieldValue<'data> {
    /// MAC address from the first six bytes, or `Null` if too short.
    pub fn mac(bytes: &[u8]) -> Self {
        match <[u8; 6]>::try_from(bytes.get(..6).unwrap_or_default()) {
            Ok(mac) => FieldValue::MacAddr(mac),
            Err(_) => FieldValue::Null,
        }
    }

    /// IPv4 address from the first four bytes, or `Null` if too short.
    pub fn ipv4(bytes: &[u8]) -> Self {
        match <[u8; 4]>::try_from(bytes.get(..4).unwrap_or_default()) {
            Ok(octets) => FieldValue::IpAddr(IpAddr::V4(Ipv4Addr::from(octets))),
            Err(_) => FieldValue::Null,
        }
    }

    /// IPv6 address from the first sixteen bytes, or `Null` if too short.
    pub fn ipv6(bytes: &[u8]) -> Self {
        match <[u8; 16]>::try_from(bytes.get(..16).unwrap_or_default()) {
            Ok(octets) => FieldValue::IpAddr(IpAddr::V6(Ipv6Addr::from(octets))),
            Err(_) => FieldValue::Null,
        }
    }

    /// Format a MAC address as colon-separated hex.
    pub fn format_mac(mac: &[u8; 6]) -> String {
        format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Numeric value widened to u64.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::UInt8(v) => Some(u64::from(*v)),
            FieldValue::UInt16(v) => Some(u64::from(*v)),
            FieldValue::UInt32(v) => Some(u64::from(*v)),
            FieldValue::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            FieldValue::OwnedString(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            FieldValue::IpAddr(ip) => Some(*ip),
            _ => None,
        }
    }

    /// Copy borrowed data so the value can outlive the decode pass.
    pub fn to_owned(&self) -> OwnedFieldValue {
        match self {
            FieldValue::UInt8(v) => FieldValue::UInt8(*v),
            FieldValue::UInt16(v) => FieldValue::UInt16(*v),
            FieldValue::UInt32(v) => FieldValue::UInt32(*v),
            FieldValue::UInt64(v) => FieldValue::UInt64(*v),
            FieldValue::Bool(v) => FieldValue::Bool(*v),
            FieldValue::IpAddr(v) => FieldValue::IpAddr(*v),
            FieldValue::MacAddr(v) => FieldValue::MacAddr(*v),
            FieldValue::Str(s) => FieldValue::OwnedString(CompactString::new(s)),
            FieldValue::Bytes(b) => FieldValue::OwnedBytes(b.to_vec()),
            FieldValue::OwnedString(s) => FieldValue::OwnedString(s.clone()),
            FieldValue::OwnedBytes(b) => FieldValue::OwnedBytes(b.clone()),
            FieldValue::Null => FieldValue::Null,
        }
    }
}

impl fmt::Display for FieldValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::UInt8(v) => write!(f, "{v}"),
            FieldValue::UInt16(v) => write!(f, "{v}"),
            FieldValue::UInt32(v) => write!(f, "{v}"),
            FieldValue::UInt64(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::IpAddr(addr) => write!(f, "{addr}"),
            FieldValue::MacAddr(mac) => f.write_str(&Self::format_mac(mac)),
            FieldValue::Str(s) => f.write_str(s),
            FieldValue::OwnedString(s) => f.write_str(s),
            FieldValue::Bytes(b) => write!(f, "[{} bytes]", b.len()),
            FieldValue::OwnedBytes(b) => write!(f, "[{} bytes]", b.len()),
            FieldValue::Null => f.write_str("NULL"),
        }
    }
}

// Borrowed and owned strings/bytes compare equal when their contents match.
impl<'b> PartialEq<FieldValue<'b>> for FieldValue<'_> {
    fn eq(&self, other: &FieldValue<'b>) -> bool {
        match (self, other) {
            (FieldValue::UInt8(a), FieldValue::UInt8(b)) => a == b,
            (FieldValue::UInt16(a), FieldValue::UInt16(b)) => a == b,
            (FieldValue::UInt32(a), FieldValue::UInt32(b)) => a == b,
            (FieldValue::UInt64(a), FieldValue::UInt64(b)) => a == b,
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a == b,
            (FieldValue::IpAddr(a), FieldValue::IpAddr(b)) => a == b,
            (FieldValue::MacAddr(a), FieldValue::MacAddr(b)) => a == b,
            (
                FieldValue::Str(_) | FieldValue::OwnedString(_),
                FieldValue::Str(_) | FieldValue::OwnedString(_),
            ) => self.as_str() == other.as_str(),
            (FieldValue::Bytes(a), FieldValue::Bytes(b)) => a == b,
            (FieldValue::Bytes(a), FieldValue::OwnedBytes(b)) => *a == b.as_slice(),
            (FieldValue::OwnedBytes(a), FieldValue::Bytes(b)) => a.as_slice() == *b,
            (FieldValue::OwnedBytes(a), FieldValue::OwnedBytes(b)) => a == b,
            (FieldValue::Null, FieldValue::Null) => true,
            _ => false,
        }
    }
}
