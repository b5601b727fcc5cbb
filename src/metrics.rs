#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Metric names exported by the engine.
pub mod names {
    pub const AGENT_LATENCY_MS: &str = "agent_latency_ms";
    pub const RETRY_ATTEMPTS_TOTAL: &str = "retry_attempts_total";
    pub const REPLANS_TOTAL: &str = "replans_total";
    pub const ROLLBACKS_TOTAL: &str = "rollbacks_total";
    pub const BUDGET_EXCEEDED_TOTAL: &str = "budget_exceeded_total";
    pub const COST_PER_RUN_USD: &str = "cost_per_run_usd";
    pub const CIRCUIT_BREAKER_STATE: &str = "circuit_breaker_state";
    pub const WORKER_HEARTBEAT_UNIX: &str = "worker_heartbeat_unix";
    pub const CANARY_LATENCY_MS: &str = "canary_latency_ms";
    pub const CANARY_COST_USD: &str = "canary_cost_usd";
    pub const CANARY_RUNS_TOTAL: &str = "canary_runs_total";
    pub const CHAOS_RECOVERY_MS: &str = "chaos_recovery_ms";
    pub const SLA_VIOLATIONS_TOTAL: &str = "sla_violations_total";
    pub const RUNS_FINISHED_TOTAL: &str = "runs_finished_total";
}

/// Upper bounds of histogram buckets; the last bucket is unbounded.
const DEFAULT_BUCKETS: [f64; 12] = [
    0.01, 0.1, 1.0, 10.0, 50.0, 100.0, 250.0, 1_000.0, 5_000.0, 30_000.0, 120_000.0, 600_000.0,
];

pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct MetricKey {
    name: String,
    labels: Labels,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramValue {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    /// `(upper_bound, cumulative_count)`; `None` marks the overflow bucket.
    pub buckets: Vec<(Option<f64>, u64)>,
}

impl HistogramValue {
    fn empty() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            buckets: DEFAULT_BUCKETS
                .iter()
                .map(|bound| (Some(*bound), 0))
                .chain(std::iter::once((None, 0)))
                .collect(),
        }
    }

    fn observe(&mut self, value: f64) {
        self.count = self.count.saturating_add(1);
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.buckets
            .iter_mut()
            .filter(|(bound, _)| bound.map_or(true, |upper| value <= upper))
            .for_each(|(_, count)| *count = count.saturating_add(1));
    }

    #[must_use]
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample<T> {
    pub name: String,
    pub labels: Labels,
    pub value: T,
}

/// Point-in-time export consumed by an external collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MetricsSnapshot {
    pub counters: Vec<Sample<f64>>,
    pub gauges: Vec<Sample<f64>>,
    pub histograms: Vec<Sample<HistogramValue>>,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        find(&self.counters, name, labels).copied()
    }

    #[must_use]
    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        find(&self.gauges, name, labels).copied()
    }

    #[must_use]
    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> Option<&HistogramValue> {
        find(&self.histograms, name, labels)
    }

    /// Sum of a counter across every label set.
    #[must_use]
    pub fn counter_total(&self, name: &str) -> f64 {
        self.counters
            .iter()
            .filter(|sample| sample.name == name)
            .map(|sample| sample.value)
            .sum()
    }
}

fn find<'a, T>(samples: &'a [Sample<T>], name: &str, labels: &[(&str, &str)]) -> Option<&'a T> {
    let key = MetricKey::new(name, labels);
    samples
        .iter()
        .find(|sample| sample.name == key.name && sample.labels == key.labels)
        .map(|sample| &sample.value)
}

/// In-memory registry of labeled counters, gauges and histograms.
///
/// Only current values are kept; history belongs to the collector.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<MetricKey, f64>>,
    gauges: RwLock<BTreeMap<MetricKey, f64>>,
    histograms: RwLock<BTreeMap<MetricKey, HistogramValue>>,
}

impl MetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn increment(&self, name: &str, labels: &[(&str, &str)]) {
        self.add(name, labels, 1.0).await;
    }

    pub async fn add(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let mut counters = self.counters.write().await;
        *counters.entry(MetricKey::new(name, labels)).or_insert(0.0) += delta;
    }

    pub async fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.gauges
            .write()
            .await
            .insert(MetricKey::new(name, labels), value);
    }

    pub async fn observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.histograms
            .write()
            .await
            .entry(MetricKey::new(name, labels))
            .or_insert_with(HistogramValue::empty)
            .observe(value);
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        fn samples<T: Clone>(map: &BTreeMap<MetricKey, T>) -> Vec<Sample<T>> {
            map.iter()
                .map(|(key, value)| Sample {
                    name: key.name.clone(),
                    labels: key.labels.clone(),
                    value: value.clone(),
                })
                .collect()
        }

        MetricsSnapshot {
            counters: samples(&*self.counters.read().await),
            gauges: samples(&*self.gauges.read().await),
            histograms: samples(&*self.histograms.read().await),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_accumulate_per_label_set() {
        let registry = MetricsRegistry::new();
        registry
            .increment(names::RETRY_ATTEMPTS_TOTAL, &[("tenant", "acme")])
            .await;
        registry
            .increment(names::RETRY_ATTEMPTS_TOTAL, &[("tenant", "acme")])
            .await;
        registry
            .increment(names::RETRY_ATTEMPTS_TOTAL, &[("tenant", "globex")])
            .await;

        let snapshot = registry.snapshot().await;
        assert_eq!(
            snapshot.counter(names::RETRY_ATTEMPTS_TOTAL, &[("tenant", "acme")]),
            Some(2.0)
        );
        assert_eq!(snapshot.counter_total(names::RETRY_ATTEMPTS_TOTAL), 3.0);
    }

    #[tokio::test]
    async fn gauges_keep_latest_value() {
        let registry = MetricsRegistry::new();
        let labels = [("tenant", "acme"), ("failure_type", "transient")];
        registry
            .set_gauge(names::CIRCUIT_BREAKER_STATE, &labels, 2.0)
            .await;
        registry
            .set_gauge(names::CIRCUIT_BREAKER_STATE, &labels, 0.0)
            .await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.gauge(names::CIRCUIT_BREAKER_STATE, &labels), Some(0.0));
    }

    #[tokio::test]
    async fn histogram_tracks_count_sum_and_extremes() {
        let registry = MetricsRegistry::new();
        for latency in [5.0, 40.0, 900.0] {
            registry
                .observe(names::AGENT_LATENCY_MS, &[("step", "codegen")], latency)
                .await;
        }

        let snapshot = registry.snapshot().await;
        let histogram = snapshot
            .histogram(names::AGENT_LATENCY_MS, &[("step", "codegen")])
            .unwrap();
        assert_eq!(histogram.count, 3);
        assert!((histogram.sum - 945.0).abs() < f64::EPSILON);
        assert!((histogram.min - 5.0).abs() < f64::EPSILON);
        assert!((histogram.max - 900.0).abs() < f64::EPSILON);
        assert_eq!(histogram.buckets.last(), Some(&(None, 3)));
        assert!(histogram.buckets.contains(&(Some(50.0), 2)));
    }
}
