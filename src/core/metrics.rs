use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Core trait for per-server metrics collection
pub trait ServerMetrics: Send + Sync {
    /// Record a completed round trip with its latency
    fn record_success(&self, latency: Duration);

    /// Record a failed round trip with its latency (if available)
    fn record_failure(&self, latency: Option<Duration>);

    /// Record a timeout
    fn record_timeout(&self);

    /// Record a `cas` or conditional delete refused by the server
    fn record_cas_mismatch(&self);

    /// Record a connection attempt
    fn record_connection_attempt(&self);

    /// Record a successful connect + handshake
    fn record_connection_success(&self, latency: Duration);

    /// Record a connection failure
    fn record_connection_failure(&self);

    /// Record a connection being closed
    fn record_connection_closed(&self);

    /// Get current metrics snapshot
    fn snapshot(&self) -> MetricsSnapshot;

    /// Reset counters and latency windows; the open connection gauge is kept
    fn reset(&self);

    /// Get the server these metrics belong to
    fn server_name(&self) -> &str;
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub server_name: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeouts: u64,
    pub cas_mismatches: u64,
    pub connection_attempts: u64,
    pub connection_successes: u64,
    pub connection_failures: u64,
    pub open_connections: u64,
    pub average_latency_ms: f64,
    /// Mean connect + handshake time
    pub average_connect_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub success_rate: f64,
    pub last_request_time: Option<Instant>,
}

/// Thread-safe implementation of ServerMetrics
#[derive(Debug)]
pub struct AtomicServerMetrics {
    server_name: String,

    // Request counters
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    timeouts: AtomicU64,
    cas_mismatches: AtomicU64,

    // Connection counters
    connection_attempts: AtomicU64,
    connection_successes: AtomicU64,
    connection_failures: AtomicU64,
    open_connections: AtomicU64,

    latency_tracker: Mutex<LatencyTracker>,
    last_request_time: Mutex<Option<Instant>>,
}

impl AtomicServerMetrics {
    pub fn new(server_name: String) -> Self {
        Self {
            server_name,
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            cas_mismatches: AtomicU64::new(0),
            connection_attempts: AtomicU64::new(0),
            connection_successes: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            open_connections: AtomicU64::new(0),
            latency_tracker: Mutex::new(LatencyTracker::new()),
            last_request_time: Mutex::new(None),
        }
    }

    fn touch(&self) {
        if let Ok(mut last_time) = self.last_request_time.lock() {
            *last_time = Some(Instant::now());
        }
    }

    fn record_latency(&self, latency: Duration) {
        if let Ok(mut tracker) = self.latency_tracker.lock() {
            tracker.record_latency(latency);
        }
    }
}

impl ServerMetrics for AtomicServerMetrics {
    fn record_success(&self, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.touch();
        self.record_latency(latency);
    }

    fn record_failure(&self, latency: Option<Duration>) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.touch();
        if let Some(latency) = latency {
            self.record_latency(latency);
        }
    }

    fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.record_failure(None); // Timeout is also a failure
    }

    fn record_cas_mismatch(&self) {
        self.cas_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connection_success(&self, latency: Duration) {
        self.connection_successes.fetch_add(1, Ordering::Relaxed);
        self.open_connections.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tracker) = self.latency_tracker.lock() {
            tracker.record_connection_latency(latency);
        }
    }

    fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connection_closed(&self) {
        let _ = self
            .open_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let successes = self.successful_requests.load(Ordering::Relaxed);

        let success_rate = if total > 0 {
            (successes as f64) / (total as f64) * 100.0
        } else {
            0.0
        };

        let (avg_latency, avg_connect_latency, p95_latency, p99_latency) =
            match self.latency_tracker.lock() {
                Ok(tracker) => (
                    tracker.average_latency_ms(),
                    tracker.average_connection_latency_ms(),
                    tracker.percentile_latency_ms(95.0),
                    tracker.percentile_latency_ms(99.0),
                ),
                Err(_) => (0.0, 0.0, 0.0, 0.0),
            };

        let last_request_time = self.last_request_time.lock().ok().and_then(|t| *t);

        MetricsSnapshot {
            server_name: self.server_name.clone(),
            total_requests: total,
            successful_requests: successes,
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cas_mismatches: self.cas_mismatches.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connection_successes: self.connection_successes.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            open_connections: self.open_connections.load(Ordering::Relaxed),
            average_latency_ms: avg_latency,
            average_connect_latency_ms: avg_connect_latency,
            p95_latency_ms: p95_latency,
            p99_latency_ms: p99_latency,
            success_rate,
            last_request_time,
        }
    }

    fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.successful_requests.store(0, Ordering::Relaxed);
        self.failed_requests.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.cas_mismatches.store(0, Ordering::Relaxed);
        self.connection_attempts.store(0, Ordering::Relaxed);
        self.connection_successes.store(0, Ordering::Relaxed);
        self.connection_failures.store(0, Ordering::Relaxed);

        if let Ok(mut tracker) = self.latency_tracker.lock() {
            tracker.reset();
        }
        if let Ok(mut last_time) = self.last_request_time.lock() {
            *last_time = None;
        }
    }

    fn server_name(&self) -> &str {
        &self.server_name
    }
}

/// Latency tracking with sliding window for percentiles
#[derive(Debug)]
struct LatencyTracker {
    latencies: Vec<Duration>,
    connection_latencies: Vec<Duration>,
    max_samples: usize,
    next_index: usize,
    next_connection_index: usize,
}

impl LatencyTracker {
    fn new() -> Self {
        Self {
            latencies: Vec::with_capacity(1000),
            connection_latencies: Vec::new(),
            max_samples: 1000, // Keep last 1000 samples for percentile calculation
            next_index: 0,
            next_connection_index: 0,
        }
    }

    fn record_latency(&mut self, latency: Duration) {
        if self.latencies.len() < self.max_samples {
            self.latencies.push(latency);
        } else {
            self.latencies[self.next_index] = latency;
            self.next_index = (self.next_index + 1) % self.max_samples;
        }
    }

    fn record_connection_latency(&mut self, latency: Duration) {
        if self.connection_latencies.len() < self.max_samples {
            self.connection_latencies.push(latency);
        } else {
            self.connection_latencies[self.next_connection_index] = latency;
            self.next_connection_index = (self.next_connection_index + 1) % self.max_samples;
        }
    }

    fn average_latency_ms(&self) -> f64 {
        average_ms(&self.latencies)
    }

    fn average_connection_latency_ms(&self) -> f64 {
        average_ms(&self.connection_latencies)
    }

    fn percentile_latency_ms(&self, percentile: f64) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }

        let mut sorted_latencies = self.latencies.clone();
        sorted_latencies.sort();

        let index = ((percentile / 100.0) * sorted_latencies.len() as f64) as usize;
        let index = index.min(sorted_latencies.len() - 1);

        sorted_latencies[index].as_secs_f64() * 1000.0
    }

    fn reset(&mut self) {
        self.latencies.clear();
        self.connection_latencies.clear();
        self.next_index = 0;
        self.next_connection_index = 0;
    }
}

fn average_ms(samples: &[Duration]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    let total_ms: f64 = samples.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
    total_ms / samples.len() as f64
}
