use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Observations kept per histogram; older ones are discarded.
const HISTOGRAM_WINDOW: usize = 1024;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// Current value of one metric series.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub metric_type: MetricType,
    pub value: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort();
        Self {
            name: name.to_string(),
            labels: sorted,
        }
    }
}

struct Window {
    observations: Mutex<VecDeque<f64>>,
    count: AtomicU64,
}

impl Window {
    fn new() -> Self {
        Self {
            observations: Mutex::new(VecDeque::with_capacity(HISTOGRAM_WINDOW)),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        let mut obs = self.observations.lock();
        if obs.len() == HISTOGRAM_WINDOW {
            obs.pop_front();
        }
        obs.push_back(value);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn summary(&self) -> HistogramSummary {
        let mut sorted: Vec<f64> = self.observations.lock().iter().copied().collect();
        if sorted.is_empty() {
            return HistogramSummary::default();
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len();
        let at = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];
        HistogramSummary {
            count: self.count.load(Ordering::Relaxed),
            sum: sorted.iter().sum(),
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

/// Process-local counters, gauges and latency windows.
///
/// Cluster-wide totals live in the monitoring store; this recorder holds what
/// one instance observed since it started.
pub struct MetricsRecorder {
    counters: DashMap<MetricKey, AtomicU64>,
    gauges: DashMap<MetricKey, AtomicI64>,
    histograms: DashMap<MetricKey, Window>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            gauges: DashMap::new(),
            histograms: DashMap::new(),
        }
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.counters
            .entry(MetricKey::new(name, labels))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .get(&MetricKey::new(name, labels))
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        self.gauges
            .entry(MetricKey::new(name, labels))
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn gauge_add(&self, name: &str, labels: &[(&str, &str)], delta: i64) {
        self.gauges
            .entry(MetricKey::new(name, labels))
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        self.gauges
            .get(&MetricKey::new(name, labels))
            .map_or(0, |g| g.load(Ordering::Relaxed))
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.histograms
            .entry(MetricKey::new(name, labels))
            .or_insert_with(Window::new)
            .observe(value);
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .get(&MetricKey::new(name, labels))
            .map(|h| h.summary())
            .unwrap_or_default()
    }

    /// Current value of every series, sorted by name.
    pub fn samples(&self) -> Vec<MetricSample> {
        let mut out = Vec::new();
        for entry in self.counters.iter() {
            out.push(MetricSample {
                name: entry.key().name.clone(),
                labels: entry.key().labels.clone(),
                metric_type: MetricType::Counter,
                value: entry.value().load(Ordering::Relaxed) as f64,
            });
        }
        for entry in self.gauges.iter() {
            out.push(MetricSample {
                name: entry.key().name.clone(),
                labels: entry.key().labels.clone(),
                metric_type: MetricType::Gauge,
                value: entry.value().load(Ordering::Relaxed) as f64,
            });
        }
        for entry in self.histograms.iter() {
            out.push(MetricSample {
                name: entry.key().name.clone(),
                labels: entry.key().labels.clone(),
                metric_type: MetricType::Histogram,
                value: entry.value().summary().p50,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        out
    }
}
