//! One direction of a TCP byte stream.
//!
//! Segments are keyed by their position relative to the first sequence
//! number the stream was anchored at, so sequence wraparound never breaks
//! ordering. Positions are signed: a stream anchored on a mid-stream
//! segment may still grow backwards while nothing has been read, but only
//! by a segment that reaches the first unread byte. The contiguous front
//! never moves backwards.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use tracing::trace;

/// Default cap on buffered out-of-order segments.
pub const DEFAULT_MAX_OUT_OF_ORDER: usize = 64;

/// Counters for one stream direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Non-empty segments offered.
    pub segments: u64,
    /// Segments that carried no novel bytes.
    pub retransmissions: u64,
    /// Segments that arrived ahead of the contiguous front.
    pub out_of_order: u64,
    /// Out-of-order segments dropped by the buffer cap.
    pub evicted: u64,
    /// Novel bytes accepted.
    pub bytes: u64,
}

/// In-order segments exposed as one logical byte range.
///
/// Holds shared handles to the buffered segments; nothing is copied until
/// [`StreamWindow::materialize`]. Dropping a window discards nothing from
/// the stream.
#[derive(Debug, Clone, Default)]
pub struct StreamWindow {
    first_seq: u32,
    segments: Vec<Bytes>,
    len: usize,
}

impl StreamWindow {
    /// Sequence number of the first byte.
    pub fn first_seq(&self) -> u32 {
        self.first_seq
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.segments.iter().map(|b| b.as_ref())
    }

    /// Contiguous copy of the window (no copy for a single segment).
    pub fn materialize(&self) -> Bytes {
        match self.segments.as_slice() {
            [] => Bytes::new(),
            [only] => only.clone(),
            many => {
                let mut buf = BytesMut::with_capacity(self.len);
                for segment in many {
                    buf.extend_from_slice(segment);
                }
                buf.freeze()
            }
        }
    }
}

/// Reassembly buffer for one direction of a TCP connection.
#[derive(Debug)]
pub struct TcpStream {
    /// Sequence number at position 0.
    base_seq: u32,
    anchored: bool,
    /// Anchored from a SYN; position 0 is then fixed.
    anchored_by_syn: bool,
    /// Something has been removed from the front.
    read_any: bool,
    /// Position of the first unread byte.
    read_pos: i64,
    /// Contiguous front: every byte in `read_pos..front` is buffered.
    front: i64,
    /// position -> bytes; keys below `front` are ready, above are out of order
    segments: BTreeMap<i64, Bytes>,
    out_of_order: usize,
    max_out_of_order: usize,
    stats: StreamStats,
}

impl Default for TcpStream {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUT_OF_ORDER)
    }
}

impl TcpStream {
    pub fn new(max_out_of_order: usize) -> Self {
        Self {
            base_seq: 0,
            anchored: false,
            anchored_by_syn: false,
            read_any: false,
            read_pos: 0,
            front: 0,
            segments: BTreeMap::new(),
            out_of_order: 0,
            max_out_of_order: max_out_of_order.max(1),
            stats: StreamStats::default(),
        }
    }

    /// Anchor the stream at the first data byte after a SYN carrying `isn`.
    ///
    /// Returns false if data was already buffered; the stream then keeps
    /// its inferred anchor.
    pub fn anchor(&mut self, isn: u32) -> bool {
        if !self.segments.is_empty() || self.read_any {
            return false;
        }
        self.base_seq = isn.wrapping_add(1);
        self.anchored = true;
        self.anchored_by_syn = true;
        true
    }

    pub fn is_anchored(&self) -> bool {
        self.anchored
    }

    /// Sequence number of the contiguous front.
    pub fn front_seq(&self) -> u32 {
        self.seq_at(self.front)
    }

    /// Sequence number of the first unread byte.
    pub fn read_seq(&self) -> u32 {
        self.seq_at(self.read_pos)
    }

    /// Contiguous bytes available to read.
    pub fn bytes_ready(&self) -> usize {
        (self.front - self.read_pos) as usize
    }

    /// Buffered segments waiting behind a gap.
    pub fn out_of_order_segments(&self) -> usize {
        self.out_of_order
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Whether everything before `seq` has been received. An unanchored
    /// stream has nothing outstanding.
    pub fn is_caught_up_to(&self, seq: u32) -> bool {
        !self.anchored || self.position(seq) <= self.front
    }

    fn seq_at(&self, pos: i64) -> u32 {
        self.base_seq.wrapping_add(pos as u32)
    }

    /// Position of `seq`, resolved within 2^31 of the front.
    fn position(&self, seq: u32) -> i64 {
        let delta = seq.wrapping_sub(self.front_seq()) as i32;
        self.front + i64::from(delta)
    }

    /// Add a segment, returning the number of novel bytes accepted.
    ///
    /// Bytes already held (contiguous or buffered out of order) win over
    /// the new segment; only the uncovered parts are kept.
    pub fn add_segment(&mut self, seq: u32, data: Bytes) -> usize {
        if data.is_empty() {
            return 0;
        }
        self.stats.segments += 1;

        if !self.anchored {
            self.base_seq = seq;
            self.anchored = true;
        }

        let mut start = self.position(seq);
        let end = start + data.len() as i64;
        let mut data = data;

        if start < self.read_pos
            && end >= self.read_pos
            && !self.anchored_by_syn
            && !self.read_any
        {
            // Earlier bytes of a stream anchored mid-flow, joined to its start.
            self.rebase(start);
        }

        if end <= self.front {
            self.stats.retransmissions += 1;
            return 0;
        }
        if start < self.front {
            data = data.slice((self.front - start) as usize..);
            start = self.front;
        }
        if start > self.front {
            self.stats.out_of_order += 1;
        }

        let novel = self.insert_uncovered(start, end, &data);
        if novel == 0 {
            self.stats.retransmissions += 1;
            return 0;
        }
        self.stats.bytes += novel as u64;

        self.advance();
        self.enforce_cap();
        novel
    }

    fn insert_uncovered(&mut self, start: i64, end: i64, data: &Bytes) -> usize {
        // Buffered segments overlapping [start, end), ascending.
        let mut covering: Vec<(i64, i64)> = self
            .segments
            .range(..end)
            .rev()
            .map(|(&pos, bytes)| (pos, pos + bytes.len() as i64))
            .take_while(|&(_, seg_end)| seg_end > start)
            .collect();
        covering.reverse();

        let mut pieces: Vec<(i64, i64)> = Vec::new();
        let mut cursor = start;
        for (seg_start, seg_end) in covering {
            if seg_start > cursor {
                pieces.push((cursor, seg_start));
            }
            cursor = cursor.max(seg_end);
        }
        if cursor < end {
            pieces.push((cursor, end));
        }

        let mut novel = 0;
        for (piece_start, piece_end) in pieces {
            let from = (piece_start - start) as usize;
            let to = (piece_end - start) as usize;
            self.segments.insert(piece_start, data.slice(from..to));
            self.out_of_order += 1;
            novel += to - from;
        }
        novel
    }

    /// Move the read position back to `start`. The caller guarantees the
    /// new segment reaches the old read position, so the front walks back
    /// over everything that was ready before.
    fn rebase(&mut self, start: i64) {
        trace!(from = self.read_pos, to = start, "rebasing inferred stream start");
        self.read_pos = start;
        self.front = start;
        self.out_of_order = self.segments.len();
    }

    fn advance(&mut self) {
        while let Some(len) = self.segments.get(&self.front).map(Bytes::len) {
            self.front += len as i64;
            self.out_of_order -= 1;
        }
    }

    fn enforce_cap(&mut self) {
        while self.out_of_order > self.max_out_of_order {
            let lowest = self
                .segments
                .range(self.front + 1..)
                .next()
                .map(|(&pos, _)| pos);
            let Some(pos) = lowest else { break };
            self.segments.remove(&pos);
            self.out_of_order -= 1;
            self.stats.evicted += 1;
            trace!(seq = self.seq_at(pos), "out-of-order segment evicted");
        }
    }

    /// Expose up to `max_segments` ready segments without consuming them.
    pub fn take_contiguous_window(&self, max_segments: usize) -> StreamWindow {
        let mut window = StreamWindow {
            first_seq: self.read_seq(),
            segments: Vec::new(),
            len: 0,
        };
        for bytes in self
            .segments
            .range(self.read_pos..self.front)
            .map(|(_, b)| b)
            .take(max_segments)
        {
            window.len += bytes.len();
            window.segments.push(bytes.clone());
        }
        window
    }

    /// Discard `count` whole ready segments starting at `first_seq`.
    ///
    /// Returns the number of bytes discarded; 0 if `first_seq` is not the
    /// current read position.
    pub fn remove(&mut self, first_seq: u32, count: usize) -> usize {
        if !self.anchored || first_seq != self.read_seq() {
            return 0;
        }
        let mut removed = 0;
        for _ in 0..count {
            if self.read_pos >= self.front {
                break;
            }
            let Some(bytes) = self.segments.remove(&self.read_pos) else {
                break;
            };
            self.read_pos += bytes.len() as i64;
            removed += bytes.len();
        }
        if removed > 0 {
            self.read_any = true;
        }
        removed
    }

    /// Discard the first `len` ready bytes starting at `first_seq`,
    /// splitting a segment if the cut falls inside one.
    ///
    /// Returns the number of bytes discarded.
    pub fn consume(&mut self, first_seq: u32, len: usize) -> usize {
        if !self.anchored || first_seq != self.read_seq() {
            return 0;
        }
        let target = (self.read_pos + len as i64).min(self.front);
        let start = self.read_pos;
        while self.read_pos < target {
            let Some(bytes) = self.segments.remove(&self.read_pos) else {
                break;
            };
            let seg_end = self.read_pos + bytes.len() as i64;
            if seg_end > target {
                let keep = bytes.slice((target - self.read_pos) as usize..);
                self.segments.insert(target, keep);
                self.read_pos = target;
            } else {
                self.read_pos = seg_end;
            }
        }
        let consumed = (self.read_pos - start) as usize;
        if consumed > 0 {
            self.read_any = true;
        }
        consumed
    }

    /// Drop every ready byte. Used when no handler claims the stream.
    pub fn discard_ready(&mut self) -> usize {
        let seq = self.read_seq();
        let ready = self.bytes_ready();
        self.consume(seq, ready)
    }
}
