//! Download throughput estimation

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

/// Number of transfers remembered
pub const SPEED_SAMPLES: usize = 100;

/// Gaussian-weighted throughput over the most recent transfers
///
/// Recent samples weigh most; a sample `capacity` transfers old has almost no
/// influence.
pub struct ThroughputMeter {
    samples: Mutex<VecDeque<(u64, f64)>>,
    capacity: usize,
}

impl ThroughputMeter {
    pub fn new() -> Self {
        Self::with_capacity(SPEED_SAMPLES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Records one transfer
    pub fn record(&self, bytes: u64, elapsed: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back((bytes, elapsed.as_secs_f64()));
    }

    /// Estimated bytes per second, 0 without usable samples
    pub fn speed(&self) -> f64 {
        let samples = self.samples.lock();
        let sigma = self.capacity as f64 / 3.0;
        let mut bytes = 0.0;
        let mut seconds = 0.0;
        for (age, &(b, s)) in samples.iter().rev().enumerate() {
            let age = age as f64;
            let weight = (-(age * age) / (2.0 * sigma * sigma)).exp();
            bytes += weight * b as f64;
            seconds += weight * s;
        }
        if seconds > 0.0 {
            bytes / seconds
        } else {
            0.0
        }
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new()
    }
}
