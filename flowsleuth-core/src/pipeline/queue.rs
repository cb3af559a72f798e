//! Fixed-capacity FIFO shared between pipeline stages.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::frame::LinkType;

/// Captured bytes waiting to be decoded.
#[derive(Debug, Clone)]
pub struct RawUnit {
    pub timestamp_us: i64,
    pub data: Bytes,
    pub link_type: LinkType,
}

impl RawUnit {
    pub fn new(timestamp_us: i64, link_type: LinkType, data: impl Into<Bytes>) -> Self {
        Self {
            timestamp_us,
            data: data.into(),
            link_type,
        }
    }
}

/// FIFO that refuses items once full instead of blocking.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Append `item`, or hand it back if the queue is full.
    pub fn try_push(&self, item: T) -> Result<usize, T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        Ok(items.len())
    }

    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.lock().len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fill level, 0-100.
    pub fn usage_percent(&self) -> u8 {
        percent(self.len(), self.capacity)
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

pub(crate) fn percent(len: usize, capacity: usize) -> u8 {
    ((len.min(capacity) * 100) / capacity.max(1)) as u8
}
