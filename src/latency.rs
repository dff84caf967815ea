//! Bounded per-request latency log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// One recorded request duration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    pub recorded_at: DateTime<Utc>,
    pub duration_ms: f64,
}

/// Aggregates over a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: usize,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
}

/// Ring buffer of recent latencies; the oldest sample is evicted at capacity
#[derive(Debug)]
pub struct LatencyRecorder {
    capacity: usize,
    samples: Mutex<VecDeque<LatencySample>>,
}

impl LatencyRecorder {
    /// Create a recorder holding at most `capacity` samples (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn record(&self, duration: Duration) {
        let sample = LatencySample {
            recorded_at: Utc::now(),
            duration_ms: duration.as_micros() as f64 / 1000.0,
        };

        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Copy of the current samples, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<LatencySample> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summary statistics over the current samples
    #[must_use]
    pub fn summary(&self) -> Option<LatencySummary> {
        summarize(&self.snapshot())
    }
}

/// Nearest-rank percentiles over a set of samples
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn summarize(samples: &[LatencySample]) -> Option<LatencySummary> {
    if samples.is_empty() {
        return None;
    }

    let mut durations: Vec<f64> = samples.iter().map(|s| s.duration_ms).collect();
    durations.sort_by(f64::total_cmp);

    let count = durations.len();
    let rank = |p: f64| -> f64 {
        let idx = ((p * count as f64).ceil() as usize).clamp(1, count) - 1;
        durations[idx]
    };

    Some(LatencySummary {
        count,
        mean_ms: durations.iter().sum::<f64>() / count as f64,
        p50_ms: rank(0.50),
        p95_ms: rank(0.95),
        max_ms: durations[count - 1],
    })
}
