//! Bounded tail capture of process output
//!
//! Keeps the last `capacity` bytes written and counts everything that went
//! past, so a report can say how much output was discarded.

use std::collections::VecDeque;
use std::fmt;

/// A byte buffer that keeps only the most recent `capacity` bytes.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    buffer: VecDeque<u8>,
    capacity: usize,
    total_bytes_written: u64,
}

impl RingBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity.min(8192)),
            capacity,
            total_bytes_written: 0,
        }
    }

    /// Append `data`, discarding the oldest bytes beyond capacity.
    pub fn write(&mut self, data: &[u8]) {
        self.total_bytes_written += data.len() as u64;
        if self.capacity == 0 {
            return;
        }

        // Only the tail of an oversized write can survive.
        let data = &data[data.len().saturating_sub(self.capacity)..];
        let overflow = (self.buffer.len() + data.len()).saturating_sub(self.capacity);
        self.buffer.drain(..overflow);
        self.buffer.extend(data);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Every byte ever written, retained or not.
    #[must_use]
    pub const fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written
    }

    /// Bytes written but no longer retained.
    #[must_use]
    pub fn dropped_bytes(&self) -> u64 {
        self.total_bytes_written - self.buffer.len() as u64
    }

    #[must_use]
    pub fn was_truncated(&self) -> bool {
        self.dropped_bytes() > 0
    }

    /// The retained bytes, oldest first.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.buffer.iter().copied().collect()
    }
}

impl fmt::Display for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.contents()))
    }
}
