//! Fixed-capacity rolling sample window
//!
//! Used for both performance samples and miss counters. Oldest samples are
//! evicted first; the average is always recomputed from the full content.

use std::collections::VecDeque;

/// FIFO window of at most `capacity` samples
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    /// Create an empty window. A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest one when full.
    ///
    /// Returns the evicted sample, if any.
    pub fn push(&mut self, sample: f64) -> Option<f64> {
        let evicted = if self.samples.len() == self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        evicted
    }

    /// Mean of the current content, `None` while empty
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.sum() / self.samples.len() as f64)
    }

    pub fn sum(&self) -> f64 {
        self.samples.iter().sum()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Oldest sample still held
    pub fn oldest(&self) -> Option<f64> {
        self.samples.front().copied()
    }
}
