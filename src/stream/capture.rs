//! Capture buffer for an in-flight stream.

use super::frame::{Frame, FrameKind, SequencedFrame};
use crate::store::record::{ResponseHead, ResponseSnapshot};

/// Ordered record of the frames forwarded to the live caller.
///
/// A capture that exceeds its byte limit is poisoned: it stops recording
/// and can no longer produce a snapshot, so the execution must abort.
#[derive(Debug)]
pub struct StreamCapture {
    frames: Vec<SequencedFrame>,
    terminal: Option<SequencedFrame>,
    next_sequence: u64,
    bytes: usize,
    max_bytes: usize,
    poisoned: bool,
}

impl StreamCapture {
    /// Create an empty capture limited to `max_bytes` of payload.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            frames: Vec::new(),
            terminal: None,
            next_sequence: 0,
            bytes: 0,
            max_bytes,
            poisoned: false,
        }
    }

    /// Record a data frame. Keep-alives are ignored.
    ///
    /// Returns false when the frame pushed the capture over its limit.
    pub fn append(&mut self, frame: &Frame) -> bool {
        if frame.kind == FrameKind::KeepAlive || self.poisoned {
            return !self.poisoned;
        }
        self.bytes += frame.size_hint();
        if self.bytes > self.max_bytes {
            tracing::warn!(
                captured_bytes = self.bytes,
                limit = self.max_bytes,
                "stream capture exceeded its limit; result will not be cached"
            );
            self.poison();
            return false;
        }
        let sequence = self.next_sequence();
        self.frames.push(SequencedFrame {
            sequence,
            frame: frame.clone(),
        });
        true
    }

    /// Record the terminal frame.
    pub fn finalize(&mut self, terminal: &Frame) {
        let sequence = self.next_sequence();
        self.terminal = Some(SequencedFrame {
            sequence,
            frame: terminal.clone(),
        });
    }

    /// Mark the capture unusable and release its buffer.
    pub fn poison(&mut self) {
        self.poisoned = true;
        self.frames = Vec::new();
    }

    /// Check if the capture was poisoned.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Check if the terminal frame was recorded.
    pub fn is_finalized(&self) -> bool {
        self.terminal.is_some()
    }

    /// Number of data frames recorded.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Check if no data frames were recorded.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Convert a finalized, healthy capture into a snapshot.
    pub fn into_snapshot(self, head: ResponseHead) -> Option<ResponseSnapshot> {
        if self.poisoned {
            return None;
        }
        let terminal = self.terminal?;
        Some(ResponseSnapshot::frames(head, self.frames, terminal))
    }

    fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }
}
