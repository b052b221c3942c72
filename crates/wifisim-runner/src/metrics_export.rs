//! In-memory metrics collection and export.
//!
//! [`InMemoryRecorder`] is installed as the global `metrics` recorder for a
//! run. At the end of the run a [`MetricsSnapshot`] is taken and written as
//! JSON or in the Prometheus text exposition format.
//!
//! Series that carry a `node` label are summed into a per-metric total and
//! also kept per node. Other labels (for example the `reason` of a PHY drop)
//! are folded into the metric name as `name{label=value}` so each breakdown
//! stays visible in the export.

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Samples kept per histogram series for percentile estimates.
const HISTOGRAM_RESERVOIR_SIZE: usize = 4096;

/// Labels that identify the emitting node rather than a breakdown.
const NODE_LABELS: [&str; 3] = ["node", "node_type", "groups"];

// ============================================================================
// Snapshot
// ============================================================================

/// Metric values of one node.
#[derive(Debug, Default, Clone, Serialize)]
pub struct NodeMetrics {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub gauges: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// All metric values at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Simulated time at which the snapshot was taken.
    pub simulation_time_s: f64,
    /// Totals over all nodes.
    pub counters: BTreeMap<String, u64>,
    /// Gauges summed over all nodes.
    pub gauges: BTreeMap<String, f64>,
    /// Histograms merged over all nodes.
    pub histograms: BTreeMap<String, HistogramSummary>,
    /// Per-node breakdown.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, NodeMetrics>,
    /// Descriptions registered through `describe_*`.
    #[serde(skip)]
    pub descriptions: BTreeMap<String, String>,
}

/// Summary statistics of a histogram.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

impl HistogramSummary {
    /// Summarise `samples`. `count` and `sum` cover every recorded value,
    /// the samples may be a subset of them.
    fn from_samples(count: u64, sum: f64, min: f64, max: f64, samples: &[f64]) -> Self {
        if count == 0 {
            return HistogramSummary::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        let quantile = |q: f64| -> f64 {
            if sorted.is_empty() {
                return 0.0;
            }
            let idx = (q * (sorted.len() - 1) as f64).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };
        HistogramSummary {
            count,
            sum,
            min,
            max,
            mean: sum / count as f64,
            p50: quantile(0.5),
            p90: quantile(0.9),
            p99: quantile(0.99),
        }
    }
}

// ============================================================================
// Export
// ============================================================================

/// Write the snapshot as pretty-printed JSON.
pub fn export_json<W: Write>(snapshot: &MetricsSnapshot, writer: &mut W) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut *writer, snapshot)?;
    writeln!(writer)?;
    Ok(())
}

/// Prometheus metric name and the labels folded into a snapshot key.
fn prometheus_parts(key: &str) -> (String, Option<&str>) {
    match key.split_once('{') {
        Some((name, rest)) => (name.replace('.', "_"), rest.strip_suffix('}')),
        None => (key.replace('.', "_"), None),
    }
}

fn prometheus_labels(extra: Option<&str>, node: Option<&str>, quantile: Option<&str>) -> String {
    let mut parts = Vec::new();
    if let Some(node) = node {
        parts.push(format!("node=\"{}\"", node));
    }
    if let Some(extra) = extra {
        for pair in extra.split(',') {
            if let Some((k, v)) = pair.split_once('=') {
                parts.push(format!("{}=\"{}\"", k, v));
            }
        }
    }
    if let Some(q) = quantile {
        parts.push(format!("quantile=\"{}\"", q));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", parts.join(","))
    }
}

/// Write the snapshot in the Prometheus text exposition format.
///
/// Totals are written without a `node` label, per-node values with one.
pub fn export_prometheus<W: Write>(snapshot: &MetricsSnapshot, writer: &mut W) -> std::io::Result<()> {
    let mut announced: Vec<String> = Vec::new();
    let mut header = |writer: &mut W, name: &str, kind: &str, help: Option<&String>| -> std::io::Result<()> {
        if announced.iter().any(|n| n == name) {
            return Ok(());
        }
        if let Some(help) = help {
            writeln!(writer, "# HELP {} {}", name, help)?;
        }
        writeln!(writer, "# TYPE {} {}", name, kind)?;
        announced.push(name.to_string());
        Ok(())
    };

    for (key, value) in &snapshot.counters {
        let (name, extra) = prometheus_parts(key);
        header(writer, &name, "counter", snapshot.descriptions.get(base_name(key)))?;
        writeln!(writer, "{}{} {}", name, prometheus_labels(extra, None, None), value)?;
        for (node, metrics) in &snapshot.nodes {
            if let Some(v) = metrics.counters.get(key) {
                writeln!(writer, "{}{} {}", name, prometheus_labels(extra, Some(node), None), v)?;
            }
        }
    }

    for (key, value) in &snapshot.gauges {
        let (name, extra) = prometheus_parts(key);
        header(writer, &name, "gauge", snapshot.descriptions.get(base_name(key)))?;
        writeln!(writer, "{}{} {}", name, prometheus_labels(extra, None, None), value)?;
        for (node, metrics) in &snapshot.nodes {
            if let Some(v) = metrics.gauges.get(key) {
                writeln!(writer, "{}{} {}", name, prometheus_labels(extra, Some(node), None), v)?;
            }
        }
    }

    for (key, summary) in &snapshot.histograms {
        let (name, extra) = prometheus_parts(key);
        header(writer, &name, "summary", snapshot.descriptions.get(base_name(key)))?;
        write_summary(writer, &name, extra, None, summary)?;
        for (node, metrics) in &snapshot.nodes {
            if let Some(s) = metrics.histograms.get(key) {
                write_summary(writer, &name, extra, Some(node), s)?;
            }
        }
    }

    Ok(())
}

fn write_summary<W: Write>(
    writer: &mut W,
    name: &str,
    extra: Option<&str>,
    node: Option<&str>,
    summary: &HistogramSummary,
) -> std::io::Result<()> {
    for (q, value) in [("0.5", summary.p50), ("0.9", summary.p90), ("0.99", summary.p99)] {
        writeln!(writer, "{}{} {}", name, prometheus_labels(extra, node, Some(q)), value)?;
    }
    writeln!(writer, "{}_sum{} {}", name, prometheus_labels(extra, node, None), summary.sum)?;
    writeln!(writer, "{}_count{} {}", name, prometheus_labels(extra, node, None), summary.count)?;
    Ok(())
}

fn base_name(key: &str) -> &str {
    key.split_once('{').map_or(key, |(name, _)| name)
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Default)]
struct CounterCell(AtomicU64);

/// f64 stored as its bit pattern.
#[derive(Debug, Default)]
struct GaugeCell(AtomicU64);

impl GaugeCell {
    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn update(&self, f: impl Fn(f64) -> f64) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = f(f64::from_bits(current)).to_bits();
            match self.0.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

#[derive(Debug)]
struct HistogramData {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    reservoir: Vec<f64>,
    /// xorshift state for reservoir replacement.
    rng: u64,
}

impl Default for HistogramData {
    fn default() -> Self {
        HistogramData {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            reservoir: Vec::new(),
            rng: 0x9E37_79B9_7F4A_7C15,
        }
    }
}

impl HistogramData {
    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if self.reservoir.len() < HISTOGRAM_RESERVOIR_SIZE {
            self.reservoir.push(value);
            return;
        }
        self.rng ^= self.rng << 13;
        self.rng ^= self.rng >> 7;
        self.rng ^= self.rng << 17;
        let slot = (self.rng % self.count) as usize;
        if slot < HISTOGRAM_RESERVOIR_SIZE {
            self.reservoir[slot] = value;
        }
    }

    fn summary(&self) -> HistogramSummary {
        HistogramSummary::from_samples(self.count, self.sum, self.min, self.max, &self.reservoir)
    }
}

#[derive(Debug, Default)]
struct HistogramCell(Mutex<HistogramData>);

/// Where a registered series lands in the snapshot.
#[derive(Debug, Clone)]
struct SeriesInfo {
    /// Metric name with breakdown labels folded in.
    display: String,
    node: Option<String>,
}

impl SeriesInfo {
    fn from_key(key: &Key) -> Self {
        let mut node = None;
        let mut extra = Vec::new();
        for label in key.labels() {
            if label.key() == "node" {
                node = Some(label.value().to_string());
            } else if !NODE_LABELS.contains(&label.key()) {
                extra.push(format!("{}={}", label.key(), label.value()));
            }
        }
        let display = if extra.is_empty() {
            key.name().to_string()
        } else {
            format!("{}{{{}}}", key.name(), extra.join(","))
        };
        SeriesInfo { display, node }
    }
}

/// Unique identity of a series: name plus every label.
fn series_id(key: &Key) -> String {
    let mut id = key.name().to_string();
    for label in key.labels() {
        id.push('|');
        id.push_str(label.key());
        id.push('=');
        id.push_str(label.value());
    }
    id
}

#[derive(Debug)]
struct Series<T> {
    info: SeriesInfo,
    cell: Arc<T>,
}

#[derive(Debug)]
struct Registry<T> {
    series: RwLock<BTreeMap<String, Series<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Registry {
            series: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T: Default> Registry<T> {
    fn get_or_create(&self, key: &Key) -> Arc<T> {
        let id = series_id(key);
        if let Some(series) = self.series.read().get(&id) {
            return series.cell.clone();
        }
        self.series
            .write()
            .entry(id)
            .or_insert_with(|| Series {
                info: SeriesInfo::from_key(key),
                cell: Arc::new(T::default()),
            })
            .cell
            .clone()
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    counters: Registry<CounterCell>,
    gauges: Registry<GaugeCell>,
    histograms: Registry<HistogramCell>,
    descriptions: RwLock<BTreeMap<String, String>>,
}

impl RecorderState {
    fn describe(&self, key: KeyName, description: SharedString) {
        self.descriptions
            .write()
            .insert(key.as_str().to_string(), String::from(&*description));
    }

    fn snapshot(&self, simulation_time_s: f64) -> MetricsSnapshot {
        let mut counters: BTreeMap<String, u64> = BTreeMap::new();
        let mut gauges: BTreeMap<String, f64> = BTreeMap::new();
        let mut nodes: BTreeMap<String, NodeMetrics> = BTreeMap::new();

        for series in self.counters.series.read().values() {
            let value = series.cell.0.load(Ordering::Relaxed);
            *counters.entry(series.info.display.clone()).or_insert(0) += value;
            if let Some(node) = &series.info.node {
                let per_node = nodes.entry(node.clone()).or_default();
                *per_node.counters.entry(series.info.display.clone()).or_insert(0) += value;
            }
        }

        for series in self.gauges.series.read().values() {
            let value = series.cell.get();
            *gauges.entry(series.info.display.clone()).or_insert(0.0) += value;
            if let Some(node) = &series.info.node {
                let per_node = nodes.entry(node.clone()).or_default();
                *per_node.gauges.entry(series.info.display.clone()).or_insert(0.0) += value;
            }
        }

        // Merged summaries pool the reservoirs of every series of a metric.
        let mut merged: BTreeMap<String, HistogramData> = BTreeMap::new();
        for series in self.histograms.series.read().values() {
            let data = series.cell.0.lock();
            if let Some(node) = &series.info.node {
                nodes
                    .entry(node.clone())
                    .or_default()
                    .histograms
                    .insert(series.info.display.clone(), data.summary());
            }
            let total = merged.entry(series.info.display.clone()).or_default();
            total.count += data.count;
            total.sum += data.sum;
            total.min = total.min.min(data.min);
            total.max = total.max.max(data.max);
            total.reservoir.extend_from_slice(&data.reservoir);
        }
        let histograms = merged
            .into_iter()
            .map(|(name, data)| (name, data.summary()))
            .collect();

        MetricsSnapshot {
            simulation_time_s,
            counters,
            gauges,
            histograms,
            nodes,
            descriptions: self.descriptions.read().clone(),
        }
    }
}

// ============================================================================
// Recorder
// ============================================================================

/// A `metrics` recorder that keeps every series in memory.
///
/// Clones share the same storage, so one clone can be installed globally
/// while another takes the snapshot.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecorder {
    state: Arc<RecorderState>,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current values of every series.
    pub fn snapshot(&self, simulation_time_s: f64) -> MetricsSnapshot {
        self.state.snapshot(simulation_time_s)
    }
}

struct CounterHandle(Arc<CounterCell>);

impl metrics::CounterFn for CounterHandle {
    fn increment(&self, value: u64) {
        self.0 .0.fetch_add(value, Ordering::Relaxed);
    }

    fn absolute(&self, value: u64) {
        self.0 .0.store(value, Ordering::Relaxed);
    }
}

struct GaugeHandle(Arc<GaugeCell>);

impl metrics::GaugeFn for GaugeHandle {
    fn increment(&self, value: f64) {
        self.0.update(|v| v + value);
    }

    fn decrement(&self, value: f64) {
        self.0.update(|v| v - value);
    }

    fn set(&self, value: f64) {
        self.0.update(|_| value);
    }
}

struct HistogramHandle(Arc<HistogramCell>);

impl metrics::HistogramFn for HistogramHandle {
    fn record(&self, value: f64) {
        self.0 .0.lock().record(value);
    }
}

impl Recorder for InMemoryRecorder {
    fn describe_counter(&self, key: KeyName, _unit: Option<Unit>, description: SharedString) {
        self.state.describe(key, description);
    }

    fn describe_gauge(&self, key: KeyName, _unit: Option<Unit>, description: SharedString) {
        self.state.describe(key, description);
    }

    fn describe_histogram(&self, key: KeyName, _unit: Option<Unit>, description: SharedString) {
        self.state.describe(key, description);
    }

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(CounterHandle(self.state.counters.get_or_create(key))))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(GaugeHandle(self.state.gauges.get_or_create(key))))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(Arc::new(HistogramHandle(self.state.histograms.get_or_create(key))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_sample(recorder: &InMemoryRecorder) {
        metrics::with_local_recorder(recorder, || {
            metrics::counter!("wifisim.phy.tx_ppdus", "node" => "ap", "node_type" => "ap").increment(3);
            metrics::counter!("wifisim.phy.tx_ppdus", "node" => "sta1", "node_type" => "sta").increment(2);
            metrics::counter!("wifisim.phy.rx_drop", "node" => "sta1", "node_type" => "sta", "reason" => "txing")
                .increment(1);
            metrics::gauge!("wifisim.test.gauge", "node" => "ap").set(4.0);
            for v in 1..=100 {
                metrics::histogram!("wifisim.ping.rtt", "node" => "sta1").record(v as f64);
            }
        });
    }

    #[test]
    fn test_counters_aggregate_per_node() {
        let recorder = InMemoryRecorder::new();
        record_sample(&recorder);
        let snapshot = recorder.snapshot(1.0);

        assert_eq!(snapshot.counters.get("wifisim.phy.tx_ppdus"), Some(&5));
        assert_eq!(snapshot.nodes["ap"].counters.get("wifisim.phy.tx_ppdus"), Some(&3));
        assert_eq!(snapshot.nodes["sta1"].counters.get("wifisim.phy.tx_ppdus"), Some(&2));
        assert_eq!(snapshot.counters.get("wifisim.phy.rx_drop{reason=txing}"), Some(&1));
    }

    #[test]
    fn test_gauge_operations() {
        let cell = GaugeCell::default();
        let gauge = GaugeHandle(Arc::new(cell));
        metrics::GaugeFn::set(&gauge, 10.0);
        metrics::GaugeFn::increment(&gauge, 5.0);
        metrics::GaugeFn::decrement(&gauge, 3.0);
        assert!((gauge.0.get() - 12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_histogram_summary() {
        let recorder = InMemoryRecorder::new();
        record_sample(&recorder);
        let summary = &recorder.snapshot(0.0).histograms["wifisim.ping.rtt"];

        assert_eq!(summary.count, 100);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 100.0);
        assert!((summary.mean - 50.5).abs() < 1e-9);
        assert!((summary.p50 - 50.0).abs() <= 1.0);
        assert!((summary.p99 - 99.0).abs() <= 1.0);
    }

    #[test]
    fn test_histogram_reservoir_is_bounded() {
        let mut data = HistogramData::default();
        for v in 0..(HISTOGRAM_RESERVOIR_SIZE * 3) {
            data.record(v as f64);
        }
        assert_eq!(data.reservoir.len(), HISTOGRAM_RESERVOIR_SIZE);
        assert_eq!(data.count, (HISTOGRAM_RESERVOIR_SIZE * 3) as u64);
        assert_eq!(data.max, (HISTOGRAM_RESERVOIR_SIZE * 3 - 1) as f64);
    }

    #[test]
    fn test_export_json() {
        let recorder = InMemoryRecorder::new();
        record_sample(&recorder);
        let mut out = Vec::new();
        export_json(&recorder.snapshot(2.5), &mut out).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["simulation_time_s"], 2.5);
        assert_eq!(value["counters"]["wifisim.phy.tx_ppdus"], 5);
        assert_eq!(value["nodes"]["sta1"]["histograms"]["wifisim.ping.rtt"]["count"], 100);
    }

    #[test]
    fn test_export_prometheus() {
        let recorder = InMemoryRecorder::new();
        metrics::with_local_recorder(&recorder, || {
            metrics::describe_counter!("wifisim.phy.tx_ppdus", "PPDUs transmitted");
        });
        record_sample(&recorder);
        let mut out = Vec::new();
        export_prometheus(&recorder.snapshot(0.0), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("# HELP wifisim_phy_tx_ppdus PPDUs transmitted"));
        assert!(text.contains("# TYPE wifisim_phy_tx_ppdus counter"));
        assert!(text.contains("wifisim_phy_tx_ppdus 5"));
        assert!(text.contains("wifisim_phy_tx_ppdus{node=\"ap\"} 3"));
        assert!(text.contains("wifisim_phy_rx_drop{node=\"sta1\",reason=\"txing\"} 1"));
        assert!(text.contains("wifisim_ping_rtt_count 100"));
        assert_eq!(text.matches("# TYPE wifisim_phy_rx_drop").count(), 1);
    }
}
