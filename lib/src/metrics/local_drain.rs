//! Named metrics aggregated in memory until the binary dumps them.
//!
//! ```plain
//! LocalDrain {
//!     proxy: MetricsMap { name -> AggregatedMetric },
//!     destinations: "host:port" -> MetricsMap { name -> AggregatedMetric },
//! }
//! ```
//!
//! Only connection-level events reach the drain. Per-I/O byte counts live
//! in the atomic [`Statistics`](super::Statistics).
use std::collections::{BTreeMap, VecDeque};

use hdrhistogram::Histogram;
use serde::Serialize;

use crate::metrics::{MetricError, MetricValue};

#[derive(Debug, Clone)]
enum AggregatedMetric {
    Gauge(usize),
    Count(i64),
    /// milliseconds
    Time(Histogram<u32>),
}

impl AggregatedMetric {
    fn new(metric: MetricValue) -> Result<AggregatedMetric, MetricError> {
        Ok(match metric {
            MetricValue::Gauge(value) => AggregatedMetric::Gauge(value),
            MetricValue::GaugeAdd(value) => AggregatedMetric::Gauge(value.max(0) as usize),
            MetricValue::Count(value) => AggregatedMetric::Count(value),
            MetricValue::Time(value) => {
                let mut histogram = Histogram::new(3)
                    .map_err(|error| MetricError::HistogramCreation(error.to_string()))?;
                histogram
                    .record(value as u64)
                    .map_err(|error| MetricError::TimeRecording(error.to_string()))?;
                AggregatedMetric::Time(histogram)
            }
        })
    }

    fn update(&mut self, name: &str, metric: MetricValue) {
        match (self, metric) {
            (AggregatedMetric::Gauge(stored), MetricValue::Gauge(value)) => *stored = value,
            (AggregatedMetric::Gauge(stored), MetricValue::GaugeAdd(delta)) => {
                *stored = (*stored as i64 + delta).max(0) as usize;
            }
            (AggregatedMetric::Count(stored), MetricValue::Count(value)) => *stored += value,
            (AggregatedMetric::Time(histogram), MetricValue::Time(value)) => {
                if let Err(error) = histogram.record(value as u64) {
                    error!("could not record {} = {}ms: {}", name, value, error);
                }
            }
            (stored, metric) => {
                error!("metric {} holds {:?}, ignoring {:?}", name, stored, metric)
            }
        }
    }

    fn to_filtered(&self) -> FilteredMetric {
        match self {
            AggregatedMetric::Gauge(value) => FilteredMetric::Gauge(*value as u64),
            AggregatedMetric::Count(value) => FilteredMetric::Count(*value),
            AggregatedMetric::Time(histogram) => FilteredMetric::Percentiles(Percentiles {
                samples: histogram.len(),
                p_50: histogram.value_at_percentile(50.0),
                p_90: histogram.value_at_percentile(90.0),
                p_99: histogram.value_at_percentile(99.0),
                p_99_9: histogram.value_at_percentile(99.9),
                p_100: histogram.max(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Percentiles {
    pub samples: u64,
    pub p_50: u64,
    pub p_90: u64,
    pub p_99: u64,
    pub p_99_9: u64,
    pub p_100: u64,
}

/// A metric as it is dumped
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilteredMetric {
    Gauge(u64),
    Count(i64),
    Percentiles(Percentiles),
}

#[derive(Debug, Clone, Default)]
struct MetricsMap(BTreeMap<&'static str, AggregatedMetric>);

impl MetricsMap {
    fn receive(&mut self, name: &'static str, metric: MetricValue) -> Result<(), MetricError> {
        match self.0.get_mut(name) {
            Some(stored) => stored.update(name, metric),
            None => {
                self.0.insert(name, AggregatedMetric::new(metric)?);
            }
        }
        Ok(())
    }

    fn dump(&self) -> BTreeMap<String, FilteredMetric> {
        self.0
            .iter()
            .map(|(name, metric)| ((*name).to_owned(), metric.to_filtered()))
            .collect()
    }
}

/// Everything the drain knows, ready to be serialized
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProxyMetrics {
    pub proxy: BTreeMap<String, FilteredMetric>,
    /// `host:port` -> metrics
    pub destinations: BTreeMap<String, BTreeMap<String, FilteredMetric>>,
}

#[derive(Debug)]
pub struct LocalDrain {
    proxy: MetricsMap,
    destinations: BTreeMap<String, MetricsMap>,
    /// destinations in order of first appearance, the oldest goes first
    arrival: VecDeque<String>,
    max_destinations: usize,
}

impl LocalDrain {
    pub fn new(max_destinations: usize) -> LocalDrain {
        LocalDrain {
            proxy: MetricsMap::default(),
            destinations: BTreeMap::new(),
            arrival: VecDeque::new(),
            max_destinations,
        }
    }

    pub fn receive_metric(
        &mut self,
        name: &'static str,
        destination: Option<&str>,
        metric: MetricValue,
    ) {
        let result = match destination {
            Some(destination) => self.receive_destination_metric(name, destination, metric),
            None => self.proxy.receive(name, metric),
        };
        if let Err(error) = result {
            error!("could not receive metric {}: {}", name, error);
        }
    }

    fn receive_destination_metric(
        &mut self,
        name: &'static str,
        destination: &str,
        metric: MetricValue,
    ) -> Result<(), MetricError> {
        if self.max_destinations == 0 {
            return Ok(());
        }
        if let Some(metrics) = self.destinations.get_mut(destination) {
            return metrics.receive(name, metric);
        }

        while self.destinations.len() >= self.max_destinations {
            let Some(oldest) = self.arrival.pop_front() else {
                break;
            };
            trace!("forgetting the metrics of {}", oldest);
            self.destinations.remove(&oldest);
        }
        self.arrival.push_back(destination.to_owned());
        self.destinations
            .entry(destination.to_owned())
            .or_default()
            .receive(name, metric)
    }

    pub fn destination_count(&self) -> usize {
        self.destinations.len()
    }

    pub fn dump(&self) -> ProxyMetrics {
        ProxyMetrics {
            proxy: self.proxy.dump(),
            destinations: self
                .destinations
                .iter()
                .map(|(destination, metrics)| (destination.to_owned(), metrics.dump()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_metrics_aggregate() {
        let mut drain = LocalDrain::new(8);
        drain.receive_metric("requests.active", None, MetricValue::GaugeAdd(2));
        drain.receive_metric("requests.active", None, MetricValue::GaugeAdd(-3));
        drain.receive_metric("dns.queries", None, MetricValue::Count(1));
        // incompatible updates are ignored
        drain.receive_metric("dns.queries", None, MetricValue::Gauge(7));

        let dump = drain.dump();
        assert_eq!(dump.proxy.get("requests.active"), Some(&FilteredMetric::Gauge(0)));
        assert_eq!(dump.proxy.get("dns.queries"), Some(&FilteredMetric::Count(1)));
        assert!(dump.destinations.is_empty());
    }

    #[test]
    fn connect_times_have_percentiles() {
        let mut drain = LocalDrain::new(8);
        for value in 1..=100 {
            drain.receive_metric("connect_time", Some("example.com:80"), MetricValue::Time(value));
        }

        let dump = drain.dump();
        match dump.destinations["example.com:80"].get("connect_time") {
            Some(FilteredMetric::Percentiles(percentiles)) => {
                assert_eq!(percentiles.samples, 100);
                assert_eq!(percentiles.p_50, 50);
                assert_eq!(percentiles.p_100, 100);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn oldest_destination_is_forgotten() {
        let mut drain = LocalDrain::new(2);
        drain.receive_metric("connect.errors", Some("a:80"), MetricValue::Count(1));
        drain.receive_metric("connect.errors", Some("b:80"), MetricValue::Count(1));
        // known destinations do not evict anything
        drain.receive_metric("connect.errors", Some("a:80"), MetricValue::Count(1));
        assert_eq!(drain.destination_count(), 2);

        drain.receive_metric("connect.errors", Some("c:80"), MetricValue::Count(1));
        let dump = drain.dump();
        assert_eq!(drain.destination_count(), 2);
        assert!(!dump.destinations.contains_key("a:80"));
        assert!(dump.destinations.contains_key("b:80"));
        assert_eq!(
            dump.destinations["c:80"].get("connect.errors"),
            Some(&FilteredMetric::Count(1))
        );
    }

    #[test]
    fn destination_metrics_can_be_disabled() {
        let mut drain = LocalDrain::new(0);
        drain.receive_metric("connect.errors", Some("a:80"), MetricValue::Count(1));
        assert_eq!(drain.destination_count(), 0);
    }
}
