//! Per-engine observability: latency histograms (p50/p95/p99 over a sample
//! ring) and monotonically increasing counters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

const RING_CAPACITY: usize = 1024;

/// Measures from creation until [`finish`](Timer::finish).
pub struct Timer {
    name: &'static str,
    started: Instant,
    registry: Arc<MetricsRegistry>,
}

impl Timer {
    pub fn finish(self) -> Duration {
        let elapsed = self.started.elapsed();
        self.registry.observe(self.name, elapsed);
        elapsed
    }
}

/// Latest `RING_CAPACITY` samples of one metric, in microseconds.
struct Histogram {
    ring: Vec<u64>,
    next: usize,
    total_observed: u64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            ring: Vec::with_capacity(RING_CAPACITY),
            next: 0,
            total_observed: 0,
        }
    }

    fn push(&mut self, micros: u64) {
        if self.ring.len() < RING_CAPACITY {
            self.ring.push(micros);
        } else {
            self.ring[self.next] = micros;
        }
        self.next = (self.next + 1) % RING_CAPACITY;
        self.total_observed += 1;
    }

    /// Nearest-rank percentile, `p` in 0..=100.
    fn percentile(&self, p: f64) -> u64 {
        if self.ring.is_empty() {
            return 0;
        }
        let mut sorted = self.ring.clone();
        sorted.sort_unstable();
        let rank = ((p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[rank.min(sorted.len() - 1)]
    }

    fn summary(&self) -> HistogramSummary {
        HistogramSummary {
            p50_us: self.percentile(50.0),
            p95_us: self.percentile(95.0),
            p99_us: self.percentile(99.0),
            count: self.total_observed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistogramSummary {
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    /// Every observation, including ones pushed out of the ring.
    pub count: u64,
}

#[derive(Default)]
pub struct MetricsRegistry {
    histograms: Mutex<HashMap<&'static str, Histogram>>,
    counters: Mutex<HashMap<&'static str, u64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, name: &'static str, elapsed: Duration) {
        let micros = elapsed.as_micros() as u64;
        self.histograms
            .lock()
            .entry(name)
            .or_insert_with(Histogram::new)
            .push(micros);
        tracing::trace!(metric = name, micros, "observed");
    }

    /// Start a timer that records into `name` when finished.
    pub fn timer(self: &Arc<Self>, name: &'static str) -> Timer {
        Timer {
            name,
            started: Instant::now(),
            registry: Arc::clone(self),
        }
    }

    pub fn incr(&self, name: &'static str, by: u64) {
        if by > 0 {
            *self.counters.lock().entry(name).or_default() += by;
        }
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn histogram(&self, name: &str) -> Option<HistogramSummary> {
        self.histograms.lock().get(name).map(Histogram::summary)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            histograms: self
                .histograms
                .lock()
                .iter()
                .map(|(name, hist)| (name.to_string(), hist.summary()))
                .collect(),
            counters: self
                .counters
                .lock()
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub histograms: HashMap<String, HistogramSummary>,
    pub counters: HashMap<String, u64>,
}

/// Well-known metric names.
pub mod metric_names {
    // histograms
    pub const SERVICE_CALL: &str = "t_service_call";
    pub const BATCH: &str = "t_batch";

    // counters
    pub const CACHE_HIT: &str = "cache_hit";
    pub const CACHE_MISS: &str = "cache_miss";
    pub const CACHE_ERROR: &str = "cache_error";
    pub const EMPTY_SKIPPED: &str = "empty_skipped";
    pub const SERVICE_CALLS: &str = "service_calls";
    pub const RETRIES: &str = "retries";
    pub const COALESCED: &str = "coalesced";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_over_observations() {
        let registry = MetricsRegistry::new();
        for us in 1..=100 {
            registry.observe(metric_names::SERVICE_CALL, Duration::from_micros(us));
        }
        let summary = registry.histogram(metric_names::SERVICE_CALL).unwrap();
        assert_eq!(summary.p50_us, 51);
        assert_eq!(summary.p99_us, 99);
        assert_eq!(summary.count, 100);
        assert!(registry.histogram("unknown").is_none());
    }

    #[test]
    fn ring_forgets_oldest_samples() {
        let mut hist = Histogram::new();
        hist.push(1_000_000);
        for _ in 0..RING_CAPACITY {
            hist.push(5);
        }
        assert_eq!(hist.percentile(100.0), 5);
        assert_eq!(hist.summary().count, RING_CAPACITY as u64 + 1);
    }

    #[test]
    fn counters_accumulate() {
        let registry = MetricsRegistry::new();
        registry.incr(metric_names::CACHE_HIT, 2);
        registry.incr(metric_names::CACHE_HIT, 3);
        registry.incr(metric_names::RETRIES, 0);
        assert_eq!(registry.counter(metric_names::CACHE_HIT), 5);
        assert_eq!(registry.counter(metric_names::RETRIES), 0);
        assert!(!registry.snapshot().counters.contains_key(metric_names::RETRIES));
    }

    #[test]
    fn timer_records_on_finish() {
        let registry = Arc::new(MetricsRegistry::new());
        registry.timer(metric_names::BATCH).finish();
        assert_eq!(registry.snapshot().histograms[metric_names::BATCH].count, 1);
    }
}
