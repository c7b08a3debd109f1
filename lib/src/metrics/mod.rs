//! Proxy statistics.
//!
//! Two layers: a handful of process-wide atomic counters bumped on every
//! I/O completion, and a [`LocalDrain`] aggregating named metrics per proxy
//! and per destination, with histograms for timings. The drain sits behind
//! a lock and only sees connection-level events. The macros take the
//! [`Metrics`] handle as first argument:
//!
//! ```ignore
//! incr!(metrics, "requests");
//! incr!(metrics, "connect.errors", "example.com:80");
//! time!(metrics, "connect_time", elapsed_ms, "example.com:80");
//! ```
pub mod local_drain;

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

pub use self::local_drain::{FilteredMetric, LocalDrain, ProxyMetrics};

#[macro_export]
macro_rules! count {
    ($metrics:expr, $key:expr, $value:expr) => {
        $metrics.receive_metric($key, None, $crate::metrics::MetricValue::Count($value))
    };
    ($metrics:expr, $key:expr, $value:expr, $destination:expr) => {
        $metrics.receive_metric(
            $key,
            Some($destination as &str),
            $crate::metrics::MetricValue::Count($value),
        )
    };
}

#[macro_export]
macro_rules! incr {
    ($metrics:expr, $key:expr) => {
        $crate::count!($metrics, $key, 1)
    };
    ($metrics:expr, $key:expr, $destination:expr) => {
        $crate::count!($metrics, $key, 1, $destination)
    };
}

#[macro_export]
macro_rules! gauge_add {
    ($metrics:expr, $key:expr, $value:expr) => {
        $metrics.receive_metric($key, None, $crate::metrics::MetricValue::GaugeAdd($value))
    };
}

#[macro_export]
macro_rules! time {
    ($metrics:expr, $key:expr, $value:expr, $destination:expr) => {
        $metrics.receive_metric(
            $key,
            Some($destination as &str),
            $crate::metrics::MetricValue::Time($value),
        )
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricValue {
    Gauge(usize),
    GaugeAdd(i64),
    Count(i64),
    /// milliseconds
    Time(usize),
}

#[derive(thiserror::Error, Debug)]
pub enum MetricError {
    #[error("could not create histogram: {0}")]
    HistogramCreation(String),
    #[error("could not record time: {0}")]
    TimeRecording(String),
}

/// destinations tracked by the drain before the oldest are forgotten
pub const MAX_DESTINATIONS: usize = 1024;

/// Counters kept for the whole process
#[derive(Debug, Default)]
pub struct Statistics {
    requests: AtomicU64,
    in_bytes: AtomicU64,
    out_bytes: AtomicU64,
    dns_queries: AtomicU64,
    dns_cache_hits: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub requests: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub dns_queries: u64,
    pub dns_cache_hits: u64,
}

impl Statistics {
    pub fn add_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_in_bytes(&self, count: usize) {
        self.in_bytes.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn add_out_bytes(&self, count: usize) {
        self.out_bytes.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn add_dns_query(&self) {
        self.dns_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_dns_cache_hit(&self) {
        self.dns_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            dns_queries: self.dns_queries.load(Ordering::Relaxed),
            dns_cache_hits: self.dns_cache_hits.load(Ordering::Relaxed),
        }
    }
}

/// The metrics handle shared by every worker
pub struct Metrics {
    pub statistics: Statistics,
    drain: Mutex<LocalDrain>,
}

impl Metrics {
    pub fn new(max_destinations: usize) -> Metrics {
        Metrics {
            statistics: Statistics::default(),
            drain: Mutex::new(LocalDrain::new(max_destinations)),
        }
    }

    pub fn receive_metric(&self, key: &'static str, destination: Option<&str>, metric: MetricValue) {
        self.drain.lock().receive_metric(key, destination, metric);
    }

    pub fn dump(&self) -> ProxyMetrics {
        self.drain.lock().dump()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics_snapshot() {
        let statistics = Statistics::default();
        statistics.add_request();
        statistics.add_in_bytes(100);
        statistics.add_out_bytes(40);
        statistics.add_dns_query();
        statistics.add_dns_query();
        statistics.add_dns_cache_hit();

        assert_eq!(
            statistics.snapshot(),
            StatisticsSnapshot {
                requests: 1,
                in_bytes: 100,
                out_bytes: 40,
                dns_queries: 2,
                dns_cache_hits: 1,
            }
        );
    }

    #[test]
    fn macros_feed_the_drain() {
        let metrics = Metrics::new(MAX_DESTINATIONS);
        incr!(metrics, "requests");
        incr!(metrics, "requests");
        count!(metrics, "connect.errors", 2, "example.com:80");
        gauge_add!(metrics, "requests.active", 1);
        time!(metrics, "connect_time", 12, "example.com:80");

        let dump = metrics.dump();
        assert_eq!(dump.proxy.get("requests"), Some(&FilteredMetric::Count(2)));
        assert_eq!(dump.proxy.get("requests.active"), Some(&FilteredMetric::Gauge(1)));
        let destination = dump.destinations.get("example.com:80").unwrap();
        assert_eq!(destination.get("connect.errors"), Some(&FilteredMetric::Count(2)));
        assert!(matches!(
            destination.get("connect_time"),
            Some(FilteredMetric::Percentiles(_))
        ));
    }
}
