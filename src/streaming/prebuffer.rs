//! Pre-buffer: one-shot join smoothing during session warm-up
//!
//! While a session fills its pre-buffer, incoming chunks are held back from
//! clients. Once the oldest held chunk is older than half the configured
//! window, the whole buffer is flushed as a single burst, aligned to an
//! MPEG-TS join point, and the session goes live. The half-window policy
//! flushes as soon as there is enough material to absorb one average jitter
//! event instead of waiting out the full interval.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::mpegts;

struct Entry {
    chunk: Bytes,
    arrived: Instant,
}

pub struct PreBuffer {
    entries: VecDeque<Entry>,
    total_bytes: usize,
    /// Age the oldest entry must reach before the buffer flushes.
    flush_after: Duration,
}

impl PreBuffer {
    /// `pre_buffer_seconds × 500 ms`: the half-window readiness threshold.
    pub fn new(pre_buffer_seconds: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            total_bytes: 0,
            flush_after: Duration::from_millis(pre_buffer_seconds * 500),
        }
    }

    pub fn push(&mut self, chunk: Bytes) {
        self.total_bytes += chunk.len();
        self.entries.push_back(Entry {
            chunk,
            arrived: Instant::now(),
        });
    }

    pub fn is_ready(&self) -> bool {
        match self.entries.front() {
            Some(oldest) => oldest.arrived.elapsed() >= self.flush_after,
            None => false,
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Concatenate everything buffered, trimmed to the best join point, and
    /// leave the buffer empty. Bytes before the join point are discarded;
    /// nothing is duplicated between this burst and subsequent live chunks.
    pub fn flush(&mut self) -> Bytes {
        let mut joined = BytesMut::with_capacity(self.total_bytes);
        for entry in self.entries.drain(..) {
            joined.extend_from_slice(&entry.chunk);
        }
        self.total_bytes = 0;

        let offset = mpegts::find_stream_start(&joined).unwrap_or(0);
        let mut joined = joined.freeze();
        joined.split_to(offset);
        joined
    }
}
