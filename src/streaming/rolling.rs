//! Rolling buffer: the late-join bridge
//!
//! Once a session is live, a bounded ring of recent chunks lets a newly
//! attached client replay the last few seconds and then ride the live
//! edge. Collection starts at the first chunk carrying a video unit start
//! (PUSI + video PES start code) so the bridge always begins at a point a
//! decoder can use. The running size is maintained incrementally.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

use super::mpegts;

const MIN_CAPACITY: usize = 1024 * 1024;
const MAX_CAPACITY: usize = 10 * 1024 * 1024;
const BYTES_PER_SECOND_ESTIMATE: usize = 250 * 1024;

/// Byte cap for a given pre-buffer window; 0 disables the ring entirely.
pub fn capacity_for_window(pre_buffer_seconds: u64) -> usize {
    if pre_buffer_seconds == 0 {
        return 0;
    }
    (pre_buffer_seconds as usize * BYTES_PER_SECOND_ESTIMATE).clamp(MIN_CAPACITY, MAX_CAPACITY)
}

#[derive(Debug)]
pub struct RollingBuffer {
    chunks: VecDeque<Bytes>,
    total_bytes: usize,
    capacity: usize,
    collecting: bool,
}

impl RollingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            capacity,
            collecting: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn len_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Append a live chunk. Chunks before the first video unit start are
    /// dropped; afterwards the ring evicts from the front to stay under the
    /// cap.
    pub fn push(&mut self, chunk: &Bytes) {
        if !self.is_enabled() {
            return;
        }
        if !self.collecting {
            if !mpegts::chunk_has_video_unit_start(chunk) {
                return;
            }
            self.collecting = true;
        }

        self.total_bytes += chunk.len();
        self.chunks.push_back(chunk.clone());

        while self.total_bytes > self.capacity {
            match self.chunks.pop_front() {
                Some(evicted) => self.total_bytes -= evicted.len(),
                None => break,
            }
        }
    }

    /// Contiguous copy of the current ring contents; empty if collection
    /// has not started.
    pub fn snapshot(&self) -> Bytes {
        if self.chunks.is_empty() {
            return Bytes::new();
        }
        let mut joined = BytesMut::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            joined.extend_from_slice(chunk);
        }
        joined.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::mpegts::make_packet;

    #[test]
    fn capacity_clamps_to_bounds() {
        assert_eq!(capacity_for_window(0), 0);
        // 3s × 250 KiB/s is under the 1 MiB floor.
        assert_eq!(capacity_for_window(3), MIN_CAPACITY);
        assert_eq!(capacity_for_window(8), 8 * BYTES_PER_SECOND_ESTIMATE);
        assert_eq!(capacity_for_window(600), MAX_CAPACITY);
    }

    #[test]
    fn collection_waits_for_video_unit_start() {
        let mut ring = RollingBuffer::new(MIN_CAPACITY);
        let plain = Bytes::from(make_packet(false, false));
        let keyframe = Bytes::from(make_packet(true, true));

        ring.push(&plain);
        assert_eq!(ring.len_bytes(), 0);
        assert!(ring.snapshot().is_empty());

        ring.push(&keyframe);
        ring.push(&plain);
        assert_eq!(ring.len_bytes(), 2 * 188);

        let snapshot = ring.snapshot();
        assert_eq!(&snapshot[..188], &keyframe[..]);
    }

    #[test]
    fn ring_evicts_from_the_front_and_tracks_size() {
        let mut ring = RollingBuffer::new(1000);
        let keyframe = Bytes::from(make_packet(true, true));
        ring.push(&keyframe);

        for _ in 0..50 {
            ring.push(&Bytes::from(make_packet(false, false)));
            assert!(ring.len_bytes() <= 1000);
        }
        // 5 packets of 188 bytes fit under 1000.
        assert_eq!(ring.len_bytes(), 5 * 188);
    }

    #[test]
    fn disabled_ring_collects_nothing() {
        let mut ring = RollingBuffer::new(0);
        ring.push(&Bytes::from(make_packet(true, true)));
        assert_eq!(ring.len_bytes(), 0);
        assert!(ring.snapshot().is_empty());
        assert!(!ring.is_enabled());
    }
}
