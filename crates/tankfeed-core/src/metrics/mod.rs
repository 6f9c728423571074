//! Ingestion and broadcast metrics with Prometheus text export.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket boundaries in milliseconds for ingestion cycle duration.
/// Converts to seconds: [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]
const CYCLE_DURATION_BUCKETS_MS: [u64; 7] = [10, 50, 100, 250, 500, 1000, 5000];

/// Error types for labeled metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    /// Reading files or directories
    Io,
    /// Format detection failures
    Format,
    /// Content that did not parse
    Parse,
    /// Field mapping failures
    Mapping,
    /// Remote fetch errors
    Http,
    /// Unknown/other errors
    Other,
}

impl ErrorType {
    pub const ALL: [ErrorType; 6] = [
        ErrorType::Io,
        ErrorType::Format,
        ErrorType::Parse,
        ErrorType::Mapping,
        ErrorType::Http,
        ErrorType::Other,
    ];

    /// Map an error category label (see [`crate::Error::category`]).
    pub fn from_category(category: &str) -> Self {
        match category {
            "io" => ErrorType::Io,
            "format" => ErrorType::Format,
            "parse" => ErrorType::Parse,
            "mapping" => ErrorType::Mapping,
            "http" => ErrorType::Http,
            _ => ErrorType::Other,
        }
    }

    /// Get the label value for Prometheus export.
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorType::Io => "io",
            ErrorType::Format => "format",
            ErrorType::Parse => "parse",
            ErrorType::Mapping => "mapping",
            ErrorType::Http => "http",
            ErrorType::Other => "other",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Snapshot of the cycle duration histogram.
#[derive(Debug, Clone)]
pub struct CycleDurationHistogram {
    pub sum_seconds: f64,
    pub count: u64,
    /// (upper bound in seconds, cumulative count)
    pub buckets: [(f64, u64); 7],
    pub inf_bucket: u64,
}

/// Ingestion metrics with counters, gauges, and histograms.
pub struct IngestionMetrics {
    // === COUNTERS ===
    /// Successful ingestion cycles
    cycles_total: AtomicU64,

    /// Canonical records produced
    records_total: AtomicU64,

    /// Errors by type, indexed by [`ErrorType`]
    errors: [AtomicU64; 6],

    /// Messages fanned out by the hub
    broadcasts_total: AtomicU64,

    /// Individual sends that reached a subscriber
    deliveries_total: AtomicU64,

    /// Subscribers dropped after a failed send or missed probe
    subscribers_removed_total: AtomicU64,

    // === GAUGES ===
    subscribers: AtomicU64,
    sources: AtomicU64,

    // === HISTOGRAM: ingestion_duration_seconds ===
    cycle_duration_sum_ms: AtomicU64,
    cycle_duration_count: AtomicU64,
    /// Buckets: [0.01s, 0.05s, 0.1s, 0.25s, 0.5s, 1.0s, 5.0s, +Inf]
    cycle_duration_buckets: [AtomicU64; 8],
}

impl IngestionMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            cycles_total: AtomicU64::new(0),
            records_total: AtomicU64::new(0),
            errors: Default::default(),
            broadcasts_total: AtomicU64::new(0),
            deliveries_total: AtomicU64::new(0),
            subscribers_removed_total: AtomicU64::new(0),
            subscribers: AtomicU64::new(0),
            sources: AtomicU64::new(0),
            cycle_duration_sum_ms: AtomicU64::new(0),
            cycle_duration_count: AtomicU64::new(0),
            cycle_duration_buckets: Default::default(),
        }
    }

    // === COUNTER RECORDING ===

    /// Record a successful ingestion cycle with its duration.
    pub fn record_cycle(&self, records: usize, duration: Duration) {
        self.cycles_total.fetch_add(1, Ordering::Relaxed);
        self.records_total
            .fetch_add(records as u64, Ordering::Relaxed);

        let duration_ms = duration.as_millis() as u64;
        self.cycle_duration_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.cycle_duration_count.fetch_add(1, Ordering::Relaxed);

        // Buckets are cumulative (le = less than or equal)
        for (i, &bucket_ms) in CYCLE_DURATION_BUCKETS_MS.iter().enumerate() {
            if duration_ms <= bucket_ms {
                self.cycle_duration_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.cycle_duration_buckets[7].fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error with a specific type label.
    pub fn record_error_by_type(&self, error_type: ErrorType) {
        self.errors[error_type.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record one fan-out and how it went.
    pub fn record_broadcast(&self, delivered: usize, removed: usize) {
        self.broadcasts_total.fetch_add(1, Ordering::Relaxed);
        self.deliveries_total
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.record_subscribers_removed(removed);
    }

    pub fn record_subscribers_removed(&self, removed: usize) {
        self.subscribers_removed_total
            .fetch_add(removed as u64, Ordering::Relaxed);
    }

    // === GAUGE UPDATES ===

    pub fn set_subscribers(&self, count: usize) {
        self.subscribers.store(count as u64, Ordering::Relaxed);
    }

    pub fn set_sources(&self, count: usize) {
        self.sources.store(count as u64, Ordering::Relaxed);
    }

    // === GETTERS ===

    pub fn cycles_total(&self) -> u64 {
        self.cycles_total.load(Ordering::Relaxed)
    }

    pub fn records_total(&self) -> u64 {
        self.records_total.load(Ordering::Relaxed)
    }

    /// Get total errors across all types.
    pub fn errors_total(&self) -> u64 {
        self.errors.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn errors_by_type(&self, error_type: ErrorType) -> u64 {
        self.errors[error_type.index()].load(Ordering::Relaxed)
    }

    pub fn broadcasts_total(&self) -> u64 {
        self.broadcasts_total.load(Ordering::Relaxed)
    }

    pub fn deliveries_total(&self) -> u64 {
        self.deliveries_total.load(Ordering::Relaxed)
    }

    pub fn subscribers_removed_total(&self) -> u64 {
        self.subscribers_removed_total.load(Ordering::Relaxed)
    }

    pub fn subscribers(&self) -> u64 {
        self.subscribers.load(Ordering::Relaxed)
    }

    pub fn sources(&self) -> u64 {
        self.sources.load(Ordering::Relaxed)
    }

    /// Get cycle duration histogram data for Prometheus export.
    pub fn cycle_duration_histogram(&self) -> CycleDurationHistogram {
        let mut buckets = [(0.0, 0); 7];
        for (i, &bucket_ms) in CYCLE_DURATION_BUCKETS_MS.iter().enumerate() {
            buckets[i] = (
                bucket_ms as f64 / 1000.0,
                self.cycle_duration_buckets[i].load(Ordering::Relaxed),
            );
        }
        CycleDurationHistogram {
            sum_seconds: self.cycle_duration_sum_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            count: self.cycle_duration_count.load(Ordering::Relaxed),
            buckets,
            inf_bucket: self.cycle_duration_buckets[7].load(Ordering::Relaxed),
        }
    }

    /// Export all metrics in Prometheus text format.
    ///
    /// # Example
    /// ```
    /// use tankfeed_core::metrics::IngestionMetrics;
    /// use std::time::Duration;
    ///
    /// let metrics = IngestionMetrics::new();
    /// metrics.record_cycle(3, Duration::from_millis(20));
    /// let text = metrics.export_prometheus_text();
    /// assert!(text.contains("tankfeed_records_total 3"));
    /// ```
    pub fn export_prometheus_text(&self) -> String {
        self.export_prometheus_text_with_prefix("tankfeed")
    }

    /// Export metrics in Prometheus text format with custom prefix.
    pub fn export_prometheus_text_with_prefix(&self, prefix: &str) -> String {
        let mut output = String::with_capacity(4096);

        // === COUNTERS ===

        push_metric(
            &mut output,
            prefix,
            "cycles_total",
            "counter",
            "Successful ingestion cycles",
            self.cycles_total(),
        );
        push_metric(
            &mut output,
            prefix,
            "records_total",
            "counter",
            "Canonical records produced",
            self.records_total(),
        );
        push_metric(
            &mut output,
            prefix,
            "errors_total",
            "counter",
            "Total errors encountered",
            self.errors_total(),
        );

        output.push_str(&format!("# HELP {}_errors Errors by type\n", prefix));
        output.push_str(&format!("# TYPE {}_errors counter\n", prefix));
        for error_type in ErrorType::ALL {
            output.push_str(&format!(
                "{}_errors{{type=\"{}\"}} {}\n",
                prefix,
                error_type.as_label(),
                self.errors_by_type(error_type)
            ));
        }
        output.push('\n');

        push_metric(
            &mut output,
            prefix,
            "broadcasts_total",
            "counter",
            "Messages fanned out to subscribers",
            self.broadcasts_total(),
        );
        push_metric(
            &mut output,
            prefix,
            "deliveries_total",
            "counter",
            "Messages delivered to individual subscribers",
            self.deliveries_total(),
        );
        push_metric(
            &mut output,
            prefix,
            "subscribers_removed_total",
            "counter",
            "Subscribers removed after failed delivery or missed probes",
            self.subscribers_removed_total(),
        );

        // === GAUGES ===

        push_metric(
            &mut output,
            prefix,
            "subscribers",
            "gauge",
            "Currently connected subscribers",
            self.subscribers(),
        );
        push_metric(
            &mut output,
            prefix,
            "sources",
            "gauge",
            "Registered sources",
            self.sources(),
        );

        // === HISTOGRAM: ingestion_duration_seconds ===

        let hist = self.cycle_duration_histogram();

        output.push_str(&format!(
            "# HELP {}_ingestion_duration_seconds Duration of ingestion cycles\n",
            prefix
        ));
        output.push_str(&format!(
            "# TYPE {}_ingestion_duration_seconds histogram\n",
            prefix
        ));
        for (le, count) in &hist.buckets {
            output.push_str(&format!(
                "{}_ingestion_duration_seconds_bucket{{le=\"{}\"}} {}\n",
                prefix, le, count
            ));
        }
        output.push_str(&format!(
            "{}_ingestion_duration_seconds_bucket{{le=\"+Inf\"}} {}\n",
            prefix, hist.inf_bucket
        ));
        output.push_str(&format!(
            "{}_ingestion_duration_seconds_sum {}\n",
            prefix, hist.sum_seconds
        ));
        output.push_str(&format!(
            "{}_ingestion_duration_seconds_count {}\n",
            prefix, hist.count
        ));

        output
    }
}

fn push_metric(output: &mut String, prefix: &str, name: &str, kind: &str, help: &str, value: u64) {
    output.push_str(&format!("# HELP {}_{} {}\n", prefix, name, help));
    output.push_str(&format!("# TYPE {}_{} {}\n", prefix, name, kind));
    output.push_str(&format!("{}_{} {}\n", prefix, name, value));
    output.push('\n');
}

impl Default for IngestionMetrics {
    fn default() -> Self {
        Self::new()
    }
}
