//! Performance metrics for the inference server
//!
//! Lightweight, thread-safe counters shared by every connection handler.
//! Metrics are server-wide.
//!
//! Tracked:
//! - Connections accepted, requests served, rejections by error code
//! - Handler and inference latencies with percentiles (p50, p95, p99)
//! - The most recent slow requests
//!
//! # Example
//!
//! ```no_run
//! use mnistd::metrics::Metrics;
//!
//! let metrics = Metrics::new();
//! metrics.record_served(1_800, 950);
//! let stats = metrics.snapshot();
//! println!("p50: {}us", stats.handler.p50_us);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;

/// Number of recent latencies retained for percentile calculation.
const LATENCY_WINDOW_SIZE: usize = 1000;

/// Number of slow requests retained for reporting.
const MAX_SLOW_REQUESTS: usize = 10;

/// Handler time at or above which a request counts as slow.
pub const SLOW_REQUEST_THRESHOLD_MS: u64 = 100;

/// Rolling window of latency samples (microseconds).
#[derive(Debug)]
struct LatencyWindow {
    samples: Mutex<VecDeque<u64>>,
    sum: AtomicU64,
}

impl LatencyWindow {
    fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
            sum: AtomicU64::new(0),
        }
    }

    fn record(&self, value: u64) {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        if samples.len() >= LATENCY_WINDOW_SIZE {
            if let Some(old) = samples.pop_front() {
                self.sum.fetch_sub(old, Ordering::Relaxed);
            }
        }
        samples.push_back(value);
        self.sum.fetch_add(value, Ordering::Relaxed);
    }

    fn stats(&self) -> LatencyStats {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        if samples.is_empty() {
            return LatencyStats::default();
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();

        let len = sorted.len();
        LatencyStats {
            p50_us: sorted[len * 50 / 100],
            p95_us: sorted[len * 95 / 100],
            p99_us: sorted.get(len * 99 / 100).copied().unwrap_or(sorted[len - 1]),
            avg_us: self.sum.load(Ordering::Relaxed) / len as u64,
        }
    }
}

/// Rejection counters, one per error code the handler can close with.
#[derive(Debug, Default)]
struct RejectionCounters {
    decode: AtomicU64,
    incomplete: AtomicU64,
    timeout: AtomicU64,
    unsupported: AtomicU64,
    inference: AtomicU64,
    gate_timeout: AtomicU64,
    other: AtomicU64,
}

/// Thread-safe metrics collector. Create one per server and share it as
/// `Arc<Metrics>`.
#[derive(Debug)]
pub struct Metrics {
    connections_accepted: AtomicU64,
    requests_served: AtomicU64,
    slow_request_count: AtomicU64,
    handler_latencies: LatencyWindow,
    inference_latencies: LatencyWindow,
    rejections: RejectionCounters,
    slow_requests: Mutex<VecDeque<SlowRequest>>,
    started_at: Instant,
}

/// A request whose handler time exceeded `SLOW_REQUEST_THRESHOLD_MS`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SlowRequest {
    pub handler_ms: u64,
    pub inference_us: u64,
    /// Milliseconds since metrics started
    pub timestamp_ms: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LatencyStats {
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub avg_us: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RejectionStat {
    pub code: String,
    pub count: u64,
}

/// Point-in-time copy of all metrics.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub requests_served: u64,
    pub requests_rejected: u64,
    pub slow_request_count: u64,
    /// Whole-connection handling time
    pub handler: LatencyStats,
    /// Time inside the backend only
    pub inference: LatencyStats,
    /// Non-zero rejection counts, largest first
    pub rejections: Vec<RejectionStat>,
    pub top_slow_requests: Vec<SlowRequest>,
    pub uptime_secs: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            requests_served: AtomicU64::new(0),
            slow_request_count: AtomicU64::new(0),
            handler_latencies: LatencyWindow::new(),
            inference_latencies: LatencyWindow::new(),
            rejections: RejectionCounters::default(),
            slow_requests: Mutex::new(VecDeque::with_capacity(MAX_SLOW_REQUESTS)),
            started_at: Instant::now(),
        }
    }

    pub fn record_connection(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successfully answered request.
    pub fn record_served(&self, handler_us: u64, inference_us: u64) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
        self.handler_latencies.record(handler_us);
        self.inference_latencies.record(inference_us);

        let handler_ms = handler_us / 1000;
        if handler_ms >= SLOW_REQUEST_THRESHOLD_MS {
            self.slow_request_count.fetch_add(1, Ordering::Relaxed);
            let slow = SlowRequest {
                handler_ms,
                inference_us,
                timestamp_ms: self.started_at.elapsed().as_millis() as u64,
            };
            let mut slow_requests = self.slow_requests.lock().unwrap_or_else(PoisonError::into_inner);
            if slow_requests.len() >= MAX_SLOW_REQUESTS {
                slow_requests.pop_front();
            }
            slow_requests.push_back(slow);
        }
    }

    /// Record a connection closed without a response, keyed by
    /// `ServerError::code()`.
    pub fn record_rejected(&self, code: &str) {
        let counter = match code {
            "DECODE_ERROR" => &self.rejections.decode,
            "INCOMPLETE_MESSAGE" => &self.rejections.incomplete,
            "CONNECTION_TIMEOUT" => &self.rejections.timeout,
            "UNSUPPORTED_COMMAND" => &self.rejections.unsupported,
            "INFERENCE_ERROR" => &self.rejections.inference,
            "GATE_TIMEOUT" => &self.rejections.gate_timeout,
            _ => &self.rejections.other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let rejections = self.rejection_stats();
        let requests_rejected = rejections.iter().map(|r| r.count).sum();
        let top_slow_requests = self
            .slow_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();

        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            requests_rejected,
            slow_request_count: self.slow_request_count.load(Ordering::Relaxed),
            handler: self.handler_latencies.stats(),
            inference: self.inference_latencies.stats(),
            rejections,
            top_slow_requests,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    fn rejection_stats(&self) -> Vec<RejectionStat> {
        let r = &self.rejections;
        let counts = [
            ("DECODE_ERROR", &r.decode),
            ("INCOMPLETE_MESSAGE", &r.incomplete),
            ("CONNECTION_TIMEOUT", &r.timeout),
            ("UNSUPPORTED_COMMAND", &r.unsupported),
            ("INFERENCE_ERROR", &r.inference),
            ("GATE_TIMEOUT", &r.gate_timeout),
            ("OTHER", &r.other),
        ];

        let mut stats: Vec<_> = counts
            .iter()
            .map(|(code, counter)| RejectionStat {
                code: code.to_string(),
                count: counter.load(Ordering::Relaxed),
            })
            .filter(|stat| stat.count > 0)
            .collect();
        stats.sort_by(|a, b| b.count.cmp(&a.count));
        stats
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_metrics_new() {
        let snap = Metrics::new().snapshot();

        assert_eq!(snap.connections_accepted, 0);
        assert_eq!(snap.requests_served, 0);
        assert_eq!(snap.requests_rejected, 0);
        assert_eq!(snap.handler, LatencyStats::default());
        assert!(snap.rejections.is_empty());
        assert!(snap.top_slow_requests.is_empty());
    }

    #[test]
    fn test_record_served() {
        let m = Metrics::new();
        m.record_connection();
        m.record_served(2_000, 500);
        m.record_served(4_000, 1_500);

        let snap = m.snapshot();
        assert_eq!(snap.connections_accepted, 1);
        assert_eq!(snap.requests_served, 2);
        assert_eq!(snap.handler.avg_us, 3_000);
        assert_eq!(snap.inference.avg_us, 1_000);
    }

    #[test]
    fn test_percentile_calculation() {
        let m = Metrics::new();
        for i in 1..=100 {
            m.record_served(i, i);
        }

        let snap = m.snapshot();
        // floor-based: sorted[len * p / 100]
        assert_eq!(snap.handler.p50_us, 51);
        assert_eq!(snap.handler.p95_us, 96);
        assert_eq!(snap.handler.p99_us, 100);
    }

    #[test]
    fn test_latency_window_eviction() {
        let m = Metrics::new();
        for _ in 0..LATENCY_WINDOW_SIZE {
            m.record_served(1_000_000, 0);
        }
        for _ in 0..LATENCY_WINDOW_SIZE {
            m.record_served(10, 0);
        }

        let snap = m.snapshot();
        assert_eq!(snap.handler.p99_us, 10);
        assert_eq!(snap.handler.avg_us, 10);
    }

    #[test]
    fn test_slow_request_tracking() {
        let m = Metrics::new();
        m.record_served(99_999, 10);
        assert_eq!(m.snapshot().slow_request_count, 0);

        m.record_served(100_000, 90_000);
        let snap = m.snapshot();
        assert_eq!(snap.slow_request_count, 1);
        assert_eq!(snap.top_slow_requests[0].handler_ms, 100);
        assert_eq!(snap.top_slow_requests[0].inference_us, 90_000);
    }

    #[test]
    fn test_slow_requests_limited() {
        let m = Metrics::new();
        for i in 0..15 {
            m.record_served((200 + i) * 1000, 0);
        }

        let snap = m.snapshot();
        assert_eq!(snap.slow_request_count, 15);
        assert_eq!(snap.top_slow_requests.len(), MAX_SLOW_REQUESTS);
        assert_eq!(snap.top_slow_requests[0].handler_ms, 205);
    }

    #[test]
    fn test_rejections_by_code() {
        let m = Metrics::new();
        m.record_rejected("DECODE_ERROR");
        m.record_rejected("INCOMPLETE_MESSAGE");
        m.record_rejected("INCOMPLETE_MESSAGE");
        m.record_rejected("SOMETHING_NEW");

        let snap = m.snapshot();
        assert_eq!(snap.requests_rejected, 4);
        assert_eq!(snap.rejections[0], RejectionStat { code: "INCOMPLETE_MESSAGE".into(), count: 2 });
        assert!(snap.rejections.iter().any(|r| r.code == "OTHER" && r.count == 1));
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = Metrics::new();
        m.record_served(1_000, 100);
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["requests_served"], 1);
        assert_eq!(json["handler"]["p50_us"], 1_000);
    }

    #[test]
    fn test_thread_safety() {
        let m = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    for _ in 0..100 {
                        m.record_served(10, 5);
                        m.record_rejected("DECODE_ERROR");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = m.snapshot();
        assert_eq!(snap.requests_served, 1000);
        assert_eq!(snap.requests_rejected, 1000);
    }
}
