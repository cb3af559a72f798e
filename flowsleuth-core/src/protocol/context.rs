//! Parse context and result types.

use smallvec::SmallVec;

use super::{FieldValue, Layer};

/// Field entry for parse results: (field_name, value).
pub type FieldEntry<'data> = (&'static str, FieldValue<'data>);

/// Hint entry for child protocol detection: (hint_name, value).
pub type HintEntry = (&'static str, u64);

/// Context passed from one layer decoder to the next.
#[derive(Debug, Clone)]
pub struct ParseContext {
    /// Link type of the capture (e.g., 1 = Ethernet).
    pub link_type: u16,

    /// Decoder that produced the bytes being parsed now.
    pub parent_protocol: Option<&'static str>,

    /// Child identification hints (ethertype, ip_protocol, ...).
    pub hints: SmallVec<[HintEntry; 4]>,

    /// Offset into the frame where the current layer starts.
    pub offset: usize,
}

impl ParseContext {
    pub fn new(link_type: u16) -> Self {
        Self {
            link_type,
            parent_protocol: None,
            hints: SmallVec::new(),
            offset: 0,
        }
    }

    /// Get a hint value by key (linear search, N is small).
    #[inline]
    pub fn hint(&self, key: &str) -> Option<u64> {
        self.hints.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    /// Set a hint value (updates existing or appends).
    #[inline]
    pub fn set_hint(&mut self, key: &'static str, value: u64) {
        if let Some(entry) = self.hints.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.hints.push((key, value));
        }
    }

    /// True before the first layer has been decoded.
    pub fn is_root(&self) -> bool {
        self.parent_protocol.is_none()
    }
}

/// Result of decoding one protocol layer.
///
/// `remaining` is always a sub-slice of the input handed to the decoder, so
/// the caller can recover the header length and any trailing padding that
/// the decoder trimmed off.
#[derive(Debug, Clone)]
pub struct ParseResult<'data> {
    /// Typed header.
    pub layer: Layer,

    /// Display attributes. Most layers have fewer than 16.
    pub fields: SmallVec<[FieldEntry<'data>; 16]>,

    /// Payload for the next layer.
    pub remaining: &'data [u8],

    /// Hints for child protocol identification.
    pub child_hints: SmallVec<[HintEntry; 4]>,

    /// Decode error, if the layer was only partially understood.
    pub error: Option<String>,
}

impl<'data> ParseResult<'data> {
    pub fn success(
        layer: Layer,
        fields: SmallVec<[FieldEntry<'data>; 16]>,
        remaining: &'data [u8],
        child_hints: SmallVec<[HintEntry; 4]>,
    ) -> Self {
        Self {
            layer,
            fields,
            remaining,
            child_hints,
            error: None,
        }
    }

    /// The whole input is opaque; decoding stops here.
    pub fn error(error: String, data: &'data [u8]) -> Self {
        Self {
            layer: Layer::Unknown,
            fields: SmallVec::new(),
            remaining: data,
            child_hints: SmallVec::new(),
            error: Some(error),
        }
    }

    /// Header decoded but something after it is inconsistent.
    pub fn partial(
        layer: Layer,
        fields: SmallVec<[FieldEntry<'data>; 16]>,
        remaining: &'data [u8],
        error: String,
    ) -> Self {
        Self {
            layer,
            fields,
            remaining,
            child_hints: SmallVec::new(),
            error: Some(error),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue<'data>> {
        self.fields.iter().find(|(k, _)| *k == name).map(|(_, v)| v)
    }

    pub fn hint(&self, name: &str) -> Option<u64> {
        self.child_hints
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| *v)
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_hint_overwrites() {
        let mut ctx = ParseContext::new(1);
        assert!(ctx.is_root());
        ctx.set_hint("ethertype", 0x0800);
        ctx.set_hint("ethertype", 0x86dd);
        assert_eq!(ctx.hints.len(), 1);
        assert_eq!(ctx.hint("ethertype"), Some(0x86dd));
        assert_eq!(ctx.hint("ip_protocol"), None);
    }

    #[test]
    fn test_error_result_is_unknown_leaf() {
        let data = [1u8, 2, 3];
        let result = ParseResult::error("bad".to_string(), &data);
        assert!(!result.is_ok());
        assert_eq!(result.layer, Layer::Unknown);
        assert_eq!(result.remaining.len(), 3);
    }
}
