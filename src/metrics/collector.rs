//! Metric primitives with Prometheus text export.
//!
//! All types update with relaxed atomics and can be shared freely between
//! threads.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a counter at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment by one.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Add `v`.
    pub fn add(&self, v: u64) {
        self.value.fetch_add(v, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A value that can go up or down.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    /// Create a gauge at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the value.
    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    /// Add `v` (may be negative).
    pub fn add(&self, v: i64) {
        self.value.fetch_add(v, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Number of histogram buckets, including the overflow bucket.
const BUCKETS: usize = 9;

/// Upper bounds (exclusive, microseconds) of every bucket but the last.
const BUCKET_BOUNDS_US: [u64; BUCKETS - 1] = [
    1,
    10,
    100,
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
];

/// Latency distribution in microseconds, with decade buckets from 1us to
/// 10s.
#[derive(Debug)]
pub struct Histogram {
    count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
    buckets: [AtomicU64; BUCKETS],
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    /// Create an empty histogram.
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
            buckets: Default::default(),
        }
    }

    /// Record the time elapsed since `start`.
    pub fn observe_since(&self, start: Instant) {
        self.observe(start.elapsed().as_micros() as u64);
    }

    /// Record one observation.
    pub fn observe(&self, micros: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(micros, Ordering::Relaxed);
        self.max.fetch_max(micros, Ordering::Relaxed);

        let idx = BUCKET_BOUNDS_US
            .iter()
            .position(|&bound| micros < bound)
            .unwrap_or(BUCKETS - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Number of observations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of observations.
    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    /// Largest observation, if any.
    pub fn max(&self) -> Option<u64> {
        if self.count() == 0 {
            None
        } else {
            Some(self.max.load(Ordering::Relaxed))
        }
    }

    /// Mean observation (0 when empty).
    pub fn mean(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum() as f64 / n as f64,
        }
    }

    /// Per-bucket counts.
    pub fn bucket_counts(&self) -> [u64; BUCKETS] {
        let mut counts = [0u64; BUCKETS];
        for (count, bucket) in counts.iter_mut().zip(&self.buckets) {
            *count = bucket.load(Ordering::Relaxed);
        }
        counts
    }

    /// Prometheus histogram lines, in seconds.
    pub fn to_prometheus(&self, name: &str) -> String {
        let mut output = String::new();
        let counts = self.bucket_counts();
        let mut cumulative = 0u64;

        for (i, &bound) in BUCKET_BOUNDS_US.iter().enumerate() {
            cumulative += counts[i];
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                name,
                bound as f64 / 1_000_000.0,
                cumulative
            ));
        }
        cumulative += counts[BUCKETS - 1];
        output.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, cumulative));
        output.push_str(&format!(
            "{}_sum {}\n",
            name,
            self.sum() as f64 / 1_000_000.0
        ));
        output.push_str(&format!("{}_count {}\n", name, self.count()));
        output
    }
}

/// Records its lifetime into a histogram when dropped.
pub struct Timer<'a> {
    histogram: &'a Histogram,
    start: Instant,
}

impl<'a> Timer<'a> {
    /// Start timing.
    pub fn new(histogram: &'a Histogram) -> Self {
        Self {
            histogram,
            start: Instant::now(),
        }
    }
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.histogram.observe_since(self.start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new();
        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);

        let gauge = Gauge::new();
        gauge.set(10);
        gauge.add(-15);
        assert_eq!(gauge.get(), -5);
    }

    #[test]
    fn test_histogram_stats() {
        let hist = Histogram::new();
        assert_eq!(hist.max(), None);
        assert_eq!(hist.mean(), 0.0);

        hist.observe(100);
        hist.observe(300);
        assert_eq!(hist.count(), 2);
        assert_eq!(hist.sum(), 400);
        assert_eq!(hist.max(), Some(300));
        assert!((hist.mean() - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_histogram_buckets() {
        let hist = Histogram::new();
        hist.observe(0);
        hist.observe(5);
        hist.observe(500);
        hist.observe(u64::from(u32::MAX));

        let counts = hist.bucket_counts();
        assert_eq!(counts[0], 1);
        assert_eq!(counts[1], 1);
        assert_eq!(counts[3], 1);
        assert_eq!(counts[BUCKETS - 1], 1);
    }

    #[test]
    fn test_timer_records_on_drop() {
        let hist = Histogram::new();
        {
            let _timer = Timer::new(&hist);
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(hist.count(), 1);
        assert!(hist.sum() >= 1_000);
    }

    #[test]
    fn test_counter_concurrent() {
        let counter = Counter::new();
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        counter.inc();
                    }
                });
            }
        });
        assert_eq!(counter.get(), 8000);
    }

    #[test]
    fn test_histogram_prometheus() {
        let hist = Histogram::new();
        hist.observe(500);
        let text = hist.to_prometheus("miss_seconds");
        assert!(text.contains("miss_seconds_bucket{le=\"0.001\"} 1"));
        assert!(text.contains("miss_seconds_bucket{le=\"+Inf\"} 1"));
        assert!(text.contains("miss_seconds_count 1"));
    }
}
