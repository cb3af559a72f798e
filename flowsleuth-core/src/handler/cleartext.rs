//! Dictionary word scan over frame payloads.
//!
//! Runs on the last leaf of every frame, including opaque leaves left by a
//! failed decode, so readable text is found even when the protocol is not.

use std::collections::HashSet;

use super::{FrameContext, FrameHandler};
use crate::error::HandlerError;
use crate::event::Event;
use crate::frame::{Frame, Packet};
use crate::protocol::{ApplicationProtocol, LayerKind};

/// Words looked for when no dictionary is supplied.
pub const DEFAULT_DICTIONARY: &[&str] = &[
    "password", "passwd", "username", "login", "logon", "secret", "confidential", "account",
    "admin", "administrator", "invoice", "payment", "transfer", "credit", "bank", "private",
    "token", "session", "cookie", "email", "message", "attachment", "subject", "meeting",
];

/// Shortest word considered.
const MIN_WORD_LEN: usize = 4;

/// Frame handler reporting dictionary words found in cleartext.
#[derive(Debug, Clone)]
pub struct CleartextHandler {
    dictionary: HashSet<String>,
}

impl Default for CleartextHandler {
    fn default() -> Self {
        Self::new(DEFAULT_DICTIONARY.iter().copied())
    }
}

impl CleartextHandler {
    pub fn new<'a>(words: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            dictionary: words
                .into_iter()
                .filter(|w| w.len() >= MIN_WORD_LEN)
                .map(str::to_ascii_lowercase)
                .collect(),
        }
    }

    /// Distinct dictionary words in `data`, in order of first appearance.
    pub fn scan(&self, data: &[u8]) -> Vec<String> {
        let mut found = Vec::new();
        for word in data
            .split(|b| !b.is_ascii_alphabetic())
            .filter(|w| w.len() >= MIN_WORD_LEN)
        {
            let Ok(word) = std::str::from_utf8(word) else {
                continue;
            };
            let word = word.to_ascii_lowercase();
            if self.dictionary.contains(&word) && !found.contains(&word) {
                found.push(word);
            }
        }
        found
    }
}

fn scannable(frame: &Frame) -> Option<&Packet> {
    frame
        .packets()
        .last()
        .filter(|p| matches!(p.kind(), LayerKind::Payload | LayerKind::Unknown))
        .filter(|p| p.bytes().len() >= MIN_WORD_LEN)
}

impl FrameHandler for CleartextHandler {
    fn name(&self) -> &'static str {
        "cleartext"
    }

    fn protocol(&self) -> ApplicationProtocol {
        ApplicationProtocol::Unknown
    }

    fn default_ports(&self) -> &'static [u16] {
        &[]
    }

    fn accepts(&self, frame: &Frame) -> bool {
        !self.dictionary.is_empty() && scannable(frame).is_some()
    }

    fn extract(&mut self, ctx: &mut FrameContext<'_>) -> Result<(), HandlerError> {
        let Some(leaf) = scannable(ctx.frame) else {
            return Ok(());
        };
        let words = self.scan(leaf.bytes());
        if !words.is_empty() {
            ctx.emit(Event::CleartextWordsFound {
                words,
                frame: ctx.frame.number(),
                timestamp_us: ctx.frame.timestamp_us(),
            });
        }
        Ok(())
    }
}
