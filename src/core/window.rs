//! Sliding window of fused samples.
//!
//! The window keeps the most recent `capacity` samples in arrival order.
//! Once full, each push evicts the oldest sample, so the window never
//! empties again during a session; it only slides.

use crate::core::types::FusedSample;
use crate::core::model::{ModelError, WindowTensor};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Fixed-capacity FIFO of fused samples.
#[derive(Debug, Clone)]
pub struct WindowBuffer {
    capacity: usize,
    samples: VecDeque<FusedSample>,
    /// Total pushes since creation (or the last clear)
    pushed: u64,
}

impl WindowBuffer {
    /// Create an empty window holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
            pushed: 0,
        }
    }

    /// Append a sample, dropping the oldest one first when full.
    pub fn push(&mut self, sample: FusedSample) {
        if self.capacity == 0 {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.pushed += 1;
    }

    pub fn is_full(&self) -> bool {
        self.capacity > 0 && self.samples.len() == self.capacity
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

    pub fn total_pushed(&self) -> u64 {
        self.pushed
    }

    /// Fill level in percent.
    pub fn fill_pct(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.capacity as f64 * 100.0
    }

    /// Copy the current contents, oldest first.
    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            samples: self.samples.iter().cloned().collect(),
        }
    }

    /// Discard all samples (used when a session restarts).
    pub fn clear(&mut self) {
        self.samples.clear();
        self.pushed = 0;
    }
}

/// An owned copy of the window contents at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    samples: Vec<FusedSample>,
}

impl WindowSnapshot {
    pub fn new(samples: Vec<FusedSample>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[FusedSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Feature width of the samples (0 for an empty snapshot).
    pub fn width(&self) -> usize {
        self.samples.first().map(|s| s.width()).unwrap_or(0)
    }

    /// Flatten into the `(1, window, features)` model input.
    pub fn to_tensor(&self) -> Result<WindowTensor, ModelError> {
        let width = self.width();
        let mut data = Vec::with_capacity(self.samples.len() * width);
        for sample in &self.samples {
            if sample.width() != width {
                return Err(ModelError::Shape {
                    expected: (self.samples.len(), width),
                    actual: (self.samples.len(), sample.width()),
                });
            }
            data.extend_from_slice(sample.values());
        }
        WindowTensor::new(data, self.samples.len(), width)
    }
}
