pub mod monitor;

pub use monitor::SignalMonitor;

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::params::SignalFrame;

/// Default poll period, 25 Hz
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 40;

/// Rolling electrogram history, oldest sample first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalBuffer {
    capacity: usize,
    pub ventricular: VecDeque<f32>,
    pub atrial: VecDeque<f32>,
    pub frames_received: u64,
    pub failed_polls: u64,
}

impl SignalBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ventricular: VecDeque::with_capacity(capacity),
            atrial: VecDeque::with_capacity(capacity),
            frames_received: 0,
            failed_polls: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ventricular.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ventricular.is_empty()
    }

    pub fn push_frame(&mut self, frame: &SignalFrame) {
        push_bounded(&mut self.ventricular, &frame.ventricular, self.capacity);
        push_bounded(&mut self.atrial, &frame.atrial, self.capacity);
        self.frames_received += 1;
    }

    pub fn clear(&mut self) {
        self.ventricular.clear();
        self.atrial.clear();
    }
}

fn push_bounded(channel: &mut VecDeque<f32>, samples: &[f32], capacity: usize) {
    for &sample in samples {
        if channel.len() == capacity {
            channel.pop_front();
        }
        channel.push_back(sample);
    }
}
