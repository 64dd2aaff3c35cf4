//! Bounded replay buffer for session output.
//!
//! Holds the most recent output frames of one session, capped both by total
//! bytes and by frame count. When an append would break either cap the oldest
//! frames are evicted first and counted, so data loss always shows up in the
//! drop counters.

use std::collections::VecDeque;

use bytes::Bytes;

/// One chunk of PTY output, numbered in production order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFrame {
    pub seq: u64,
    pub data: Bytes,
}

impl OutputFrame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// What a single append pushed out of the buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
    pub frames: u64,
    pub bytes: u64,
}

impl Eviction {
    pub fn is_empty(&self) -> bool {
        self.frames == 0 && self.bytes == 0
    }
}

/// Frames newer than a watermark, plus how many were evicted before the
/// caller could read them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Catchup {
    pub frames: Vec<OutputFrame>,
    pub missed: u64,
    pub next_seq: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RingStats {
    pub frame_count: usize,
    pub byte_count: usize,
    pub drop_count: u64,
    pub dropped_bytes: u64,
    pub next_seq: u64,
}

#[derive(Debug)]
pub struct RingBuffer {
    frames: VecDeque<OutputFrame>,
    max_bytes: usize,
    max_frames: usize,
    current_bytes: usize,
    next_seq: u64,
    drops: u64,
    dropped_bytes: u64,
}

impl RingBuffer {
    /// Limits below one are raised to one.
    pub fn new(max_bytes: usize, max_frames: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            max_bytes: max_bytes.max(1),
            max_frames: max_frames.max(1),
            current_bytes: 0,
            next_seq: 0,
            drops: 0,
            dropped_bytes: 0,
        }
    }

    /// Appends a frame and returns its sequence number together with what was
    /// evicted to make room for it.
    ///
    /// A frame larger than the byte cap keeps only its trailing `max_bytes`
    /// bytes; the cut prefix is counted in `dropped_bytes` but not as a
    /// dropped frame.
    pub fn append(&mut self, data: impl Into<Bytes>) -> (u64, Eviction) {
        let mut data: Bytes = data.into();
        let mut eviction = Eviction::default();

        if data.len() > self.max_bytes {
            let cut = data.len() - self.max_bytes;
            data = data.slice(cut..);
            self.dropped_bytes += cut as u64;
            eviction.bytes += cut as u64;
        }

        while !self.frames.is_empty()
            && (self.current_bytes + data.len() > self.max_bytes
                || self.frames.len() + 1 > self.max_frames)
        {
            if let Some(oldest) = self.frames.pop_front() {
                self.current_bytes -= oldest.len();
                self.drops += 1;
                self.dropped_bytes += oldest.len() as u64;
                eviction.frames += 1;
                eviction.bytes += oldest.len() as u64;
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.current_bytes += data.len();
        self.frames.push_back(OutputFrame { seq, data });
        (seq, eviction)
    }

    /// Ordered copy of everything currently buffered. Does not consume.
    pub fn drain_for_replay(&self) -> Vec<OutputFrame> {
        self.frames.iter().cloned().collect()
    }

    /// Frames with `seq >= next_seq`. `missed` counts frames in that range
    /// that were already evicted.
    pub fn since(&self, next_seq: u64) -> Catchup {
        let oldest = self.frames.front().map_or(self.next_seq, |frame| frame.seq);
        let missed = oldest.saturating_sub(next_seq);
        let frames = self
            .frames
            .iter()
            .filter(|frame| frame.seq >= next_seq)
            .cloned()
            .collect();
        Catchup {
            frames,
            missed,
            next_seq: self.next_seq,
        }
    }

    pub fn byte_count(&self) -> usize {
        self.current_bytes
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn drop_count(&self) -> u64 {
        self.drops
    }

    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    /// Sequence number the next appended frame will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            frame_count: self.frame_count(),
            byte_count: self.byte_count(),
            drop_count: self.drops,
            dropped_bytes: self.dropped_bytes,
            next_seq: self.next_seq,
        }
    }

    /// Releases all buffered frames. Counters and sequence numbering survive.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.current_bytes = 0;
    }
}
