use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::lock;

struct SpeedSample {
    total: u64,
    timestamp: Instant,
}

/// Transfer speed over a sliding window of cumulative byte counts.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(100).max(2),
                window_size: window_size.unwrap_or(Duration::from_secs(5)),
            }),
        }
    }

    /// Records the cumulative byte count observed now.
    pub fn record(&self, total: u64) {
        self.record_at(total, Instant::now());
    }

    fn record_at(&self, total: u64, timestamp: Instant) {
        let mut s = lock(&self.inner);
        s.samples.push(SpeedSample { total, timestamp });

        // Keep one sample older than the window so the rate spans all of it.
        if let Some(cutoff) = timestamp.checked_sub(s.window_size) {
            let stale = s
                .samples
                .iter()
                .take_while(|sample| sample.timestamp < cutoff)
                .count();
            if stale > 1 {
                s.samples.drain(..stale - 1);
            }
        }

        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Average bytes/second across the retained samples, 0.0 if unknown.
    pub fn bytes_per_second(&self) -> f64 {
        let s = lock(&self.inner);
        let (Some(first), Some(last)) = (s.samples.first(), s.samples.last()) else {
            return 0.0;
        };
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }
        last.total.saturating_sub(first.total) as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to move `remaining` bytes, `None` while speed is zero.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }
}
