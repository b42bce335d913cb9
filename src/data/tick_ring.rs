/// Bounded ring of the most recent ticks for one symbol
use std::collections::VecDeque;

use crate::types::Tick;

/// Fixed-capacity overwriting buffer. One writer per symbol pushes,
/// many readers snapshot; the owning store wraps it in a short-held
/// lock.
pub struct TickRing {
    buffer: VecDeque<Tick>,
    capacity: usize,
}

impl TickRing {
    pub fn new(capacity: usize) -> Self {
        TickRing {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a tick, evicting the oldest when full
    pub fn push(&mut self, tick: Tick) {
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(tick);
    }

    /// Most recent tick
    pub fn last(&self) -> Option<&Tick> {
        self.buffer.back()
    }

    /// Up to `n` most recent ticks, newest first
    pub fn recent(&self, n: usize) -> Vec<Tick> {
        self.buffer.iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
