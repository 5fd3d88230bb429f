//! Rolling-window throughput estimate
//!
//! Keeps the most recent `depth` (timestamp, byte count) samples and derives
//! bytes per second from them. Observability only.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::time::Instant;

/// Fixed-depth queue of recent transfer samples
#[derive(Debug)]
pub struct ThroughputMeter {
    depth: usize,
    samples: Mutex<VecDeque<(Instant, u64)>>,
    total_bytes: AtomicU64,
}

impl ThroughputMeter {
    pub const DEFAULT_DEPTH: usize = 50;

    pub fn new(depth: usize) -> Self {
        let depth = depth.max(2);
        Self {
            depth,
            samples: Mutex::new(VecDeque::with_capacity(depth)),
            total_bytes: AtomicU64::new(0),
        }
    }

    /// Record `bytes` moved now
    pub fn record(&self, bytes: u64) {
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        samples.push_back((Instant::now(), bytes));
        while samples.len() > self.depth {
            samples.pop_front();
        }
    }

    /// Bytes recorded since creation
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Estimate over the current window; 0 until two samples span some time
    pub fn bytes_per_second(&self) -> f64 {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        let (Some(first), Some(last)) = (samples.front(), samples.back()) else {
            return 0.0;
        };
        let span = last.0.duration_since(first.0).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        // The first sample's bytes were moved before the window opened.
        let bytes: u64 = samples.iter().skip(1).map(|(_, b)| b).sum();
        bytes as f64 / span
    }
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DEPTH)
    }
}
