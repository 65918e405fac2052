//! # Client Metrics
//!
//! Provide lightweight counters and a latency histogram for requests issued
//! through one client.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Atomic counters aggregate events cheaply.
//! 2. **Fixed Buckets**: Histogram buckets live in a contiguous array.
//! 3. **Explicit Registry**: The caller creates the registry and passes it in;
//!    there is no global. A registry attaches to exactly one client.
//!
//! ## Notes
//! - Bucket boundaries are expressed in microseconds.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{ClientError, ClientResult};

/// Default latency bucket boundaries in microseconds.
pub const DEFAULT_LATENCY_BUCKETS_US: [u64; 12] = [
    50, 100, 200, 500, 1_000, 2_000, 5_000, 10_000, 20_000, 50_000, 100_000, 500_000,
];

/// Snapshot of all client metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Requests handed to a connection.
    pub requests_total: u64,
    /// Requests completed with a server or transport error.
    pub errors_total: u64,
    /// Requests failed by their deadline.
    pub timeouts_total: u64,
    /// Inbound frames that matched no pending request.
    pub ignored_total: u64,
    /// Requests currently awaiting a response.
    pub inflight: u64,
    pub latency: LatencySnapshot,
}

/// Snapshot of the latency histogram.
#[derive(Debug, Clone)]
pub struct LatencySnapshot {
    pub bounds_us: Vec<u64>,
    /// Bucket counts, including the overflow bucket at the end.
    pub buckets: Vec<u64>,
    pub samples: u64,
    pub sum_us: u64,
}

/// Thread-safe metrics registry for one client.
///
/// `Ordering::Relaxed` is enough: fields are independent counters.
pub struct ClientMetrics {
    attached: AtomicBool,
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    timeouts_total: AtomicU64,
    ignored_total: AtomicU64,
    inflight: AtomicU64,
    latency: LatencyHistogram,
}

impl Default for ClientMetrics {
    fn default() -> Self {
        ClientMetrics::new()
    }
}

impl ClientMetrics {
    pub fn new() -> Self {
        ClientMetrics::with_latency_buckets(DEFAULT_LATENCY_BUCKETS_US.to_vec())
    }

    /// Creates a registry with custom latency bucket boundaries.
    ///
    /// **Input**: `bounds_us` (ascending microsecond thresholds).
    pub fn with_latency_buckets(bounds_us: Vec<u64>) -> Self {
        ClientMetrics {
            attached: AtomicBool::new(false),
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
            ignored_total: AtomicU64::new(0),
            inflight: AtomicU64::new(0),
            latency: LatencyHistogram::new(bounds_us),
        }
    }

    /// Marks the registry as owned by a client.
    ///
    /// **Output**: `Err(Contract)` if another client already attached it.
    pub fn attach(&self) -> ClientResult<()> {
        self.attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| ClientError::Contract("metrics registry is already attached to a client".into()))
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub fn record_request_start(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed request.
    ///
    /// **Logic**:
    /// 1. Decrement `inflight`.
    /// 2. Count errors and timeouts.
    /// 3. Record the latency of responses that arrived.
    pub fn record_request_end(&self, latency: Duration, outcome: RequestOutcome) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
        match outcome {
            RequestOutcome::Ok => self.latency.record(latency),
            RequestOutcome::Error => {
                self.errors_total.fetch_add(1, Ordering::Relaxed);
                self.latency.record(latency);
            }
            RequestOutcome::Timeout => {
                self.timeouts_total.fetch_add(1, Ordering::Relaxed);
            }
            RequestOutcome::Closed => {
                self.errors_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_ignored(&self) {
        self.ignored_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            ignored_total: self.ignored_total.load(Ordering::Relaxed),
            inflight: self.inflight.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Ok,
    Error,
    Timeout,
    Closed,
}

/// Fixed-bucket latency histogram.
///
/// Bucket selection is a linear scan; the list is short.
pub struct LatencyHistogram {
    bounds_us: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    /// Creates a histogram with `bounds_us.len() + 1` buckets (last is overflow).
    pub fn new(bounds_us: Vec<u64>) -> Self {
        let buckets = (0..=bounds_us.len()).map(|_| AtomicU64::new(0)).collect();
        LatencyHistogram {
            bounds_us,
            buckets,
            sum_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    /// Records a latency measurement.
    ///
    /// **Logic**:
    /// 1. Convert to microseconds.
    /// 2. Increment `samples` and add to `sum_us`.
    /// 3. Find the first bucket where `micros <= bound`, otherwise overflow.
    pub fn record(&self, latency: Duration) {
        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);
        let index = self
            .bounds_us
            .iter()
            .position(|bound| micros <= *bound)
            .unwrap_or(self.bounds_us.len());
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            bounds_us: self.bounds_us.clone(),
            buckets: self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect(),
            samples: self.samples.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_and_overflow() {
        let histogram = LatencyHistogram::new(vec![10, 100]);
        histogram.record(Duration::from_micros(5));
        histogram.record(Duration::from_micros(10));
        histogram.record(Duration::from_micros(50));
        histogram.record(Duration::from_millis(1));

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.buckets, vec![2, 1, 1]);
        assert_eq!(snapshot.samples, 4);
        assert_eq!(snapshot.sum_us, 5 + 10 + 50 + 1_000);
    }

    #[test]
    fn outcomes_update_counters() {
        let metrics = ClientMetrics::new();
        for _ in 0..3 {
            metrics.record_request_start();
        }
        metrics.record_request_end(Duration::from_micros(100), RequestOutcome::Ok);
        metrics.record_request_end(Duration::from_micros(100), RequestOutcome::Error);
        metrics.record_request_end(Duration::from_millis(5), RequestOutcome::Timeout);
        metrics.record_ignored();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 3);
        assert_eq!(snapshot.inflight, 0);
        assert_eq!(snapshot.errors_total, 1);
        assert_eq!(snapshot.timeouts_total, 1);
        assert_eq!(snapshot.ignored_total, 1);
        assert_eq!(snapshot.latency.samples, 2);
    }

    #[test]
    fn attach_is_exclusive() {
        let metrics = ClientMetrics::new();
        assert!(metrics.attach().is_ok());
        assert!(matches!(metrics.attach(), Err(ClientError::Contract(_))));
        assert!(metrics.is_attached());
    }
}
