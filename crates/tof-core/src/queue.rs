//! Bounded frame queue between the dispatcher and consumers.

use std::collections::VecDeque;

use tracing::warn;

use crate::protocol::Frame;

/// Room for an overflow report plus the frame that overflowed.
pub const MIN_CAPACITY: usize = 2;

/// FIFO of frames with a fixed capacity counted in frames.
///
/// `push` never evicts: a full queue hands the frame back and the caller
/// decides what to drop.
#[derive(Debug)]
pub struct FrameQueue {
    frames: VecDeque<Frame>,
    capacity: usize,
    resets: u64,
}

impl FrameQueue {
    /// Capacities below [`MIN_CAPACITY`] are raised to it.
    pub fn new(capacity: usize) -> Self {
        if capacity < MIN_CAPACITY {
            warn!(requested = capacity, used = MIN_CAPACITY, "Frame queue capacity too small");
        }
        let capacity = capacity.max(MIN_CAPACITY);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            resets: 0,
        }
    }

    pub fn push(&mut self, frame: Frame) -> Result<(), Frame> {
        if self.frames.len() >= self.capacity {
            return Err(frame);
        }
        self.frames.push_back(frame);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    /// Drop every buffered frame.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.resets += 1;
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Times the queue was reset.
    pub fn resets(&self) -> u64 {
        self.resets
    }
}
