//! In-process telemetry: metrics and tracing spans.
//!
//! Every other component (and external collaborators such as gate services)
//! emits counters, gauges and histograms here and opens spans around timed
//! work. Storage is bounded: each named metric keeps a windowed series,
//! histograms keep a sample window for percentile queries, and finished
//! spans move into a bounded ring. Recording never fails; telemetry being
//! full or a span id being unknown degrades to a logged warning, not an
//! error surfaced to the caller.

mod span;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::span::{Span, SpanLog, SpanStatus};

/// Points retained per named metric series.
const MAX_SERIES_POINTS: usize = 1_000;

/// Samples retained per histogram for percentile derivation.
const HISTOGRAM_WINDOW: usize = 1_000;

/// Finished spans retained in the completed ring.
const MAX_COMPLETED_SPANS: usize = 1_000;

/// Metric kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Accumulating sum.
    Counter,
    /// Last-value-wins.
    Gauge,
    /// Sample distribution with percentile queries.
    Histogram,
}

/// One recorded metric point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    /// Metric name.
    pub name: String,
    /// Recorded value.
    pub value: f64,
    /// Caller-supplied tags.
    pub tags: BTreeMap<String, String>,
    /// When the point was recorded.
    pub timestamp: DateTime<Utc>,
    /// Metric kind.
    pub kind: MetricKind,
}

/// Aggregate statistics for one histogram.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramStats {
    /// Number of samples in the window.
    pub count: usize,
    /// Smallest sample.
    pub min: f64,
    /// Largest sample.
    pub max: f64,
    /// Arithmetic mean.
    pub mean: f64,
    /// 50th percentile.
    pub median: f64,
    /// 95th percentile.
    pub p95: f64,
    /// 99th percentile.
    pub p99: f64,
}

/// Read-only roll-up of current telemetry state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySummary {
    /// Counter totals by name.
    pub counters: HashMap<String, f64>,
    /// Latest gauge values by name.
    pub gauges: HashMap<String, f64>,
    /// Histogram statistics by name.
    pub histograms: HashMap<String, HistogramStats>,
    /// Number of named metric series.
    pub series_count: usize,
    /// Spans currently open.
    pub active_spans: usize,
    /// Spans in the completed ring.
    pub completed_spans: usize,
}

/// Full snapshot for external reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryExport {
    /// Roll-up of aggregates.
    pub summary: TelemetrySummary,
    /// Windowed raw points per named series.
    pub series: HashMap<String, Vec<Metric>>,
    /// Most recent finished spans, oldest first.
    pub recent_spans: Vec<Span>,
}

#[derive(Debug, Default)]
struct TelemetryInner {
    series: HashMap<String, VecDeque<Metric>>,
    counters: HashMap<String, f64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, VecDeque<f64>>,
    active_spans: HashMap<String, Span>,
    completed_spans: VecDeque<Span>,
}

/// Metrics and tracing collector.
///
/// Shared as `Arc<Telemetry>`; all operations take `&self` and are safe to
/// call from any task. Recording never returns an error.
#[derive(Debug, Default)]
pub struct Telemetry {
    inner: Mutex<TelemetryInner>,
}

impl Telemetry {
    /// Create an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TelemetryInner> {
        // Recording must survive a panicking peer; take the data as-is.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one metric point and update the matching aggregate.
    ///
    /// Counters accumulate, gauges overwrite, histograms append to the
    /// sample window.
    pub fn record_metric(
        &self,
        name: &str,
        value: f64,
        tags: BTreeMap<String, String>,
        kind: MetricKind,
    ) {
        let metric = Metric {
            name: name.to_string(),
            value,
            tags,
            timestamp: Utc::now(),
            kind,
        };

        let mut inner = self.lock();
        match kind {
            MetricKind::Counter => {
                *inner.counters.entry(name.to_string()).or_insert(0.0) += value;
            },
            MetricKind::Gauge => {
                inner.gauges.insert(name.to_string(), value);
            },
            MetricKind::Histogram => {
                let samples = inner.histograms.entry(name.to_string()).or_default();
                samples.push_back(value);
                while samples.len() > HISTOGRAM_WINDOW {
                    samples.pop_front();
                }
            },
        }

        let series = inner.series.entry(name.to_string()).or_default();
        series.push_back(metric);
        while series.len() > MAX_SERIES_POINTS {
            series.pop_front();
        }
    }

    /// Increment a counter.
    pub fn increment(&self, name: &str, value: f64, tags: BTreeMap<String, String>) {
        self.record_metric(name, value, tags, MetricKind::Counter);
    }

    /// Set a gauge.
    pub fn gauge(&self, name: &str, value: f64, tags: BTreeMap<String, String>) {
        self.record_metric(name, value, tags, MetricKind::Gauge);
    }

    /// Record a histogram sample.
    pub fn histogram(&self, name: &str, value: f64, tags: BTreeMap<String, String>) {
        self.record_metric(name, value, tags, MetricKind::Histogram);
    }

    /// Open a span and register it as active.
    ///
    /// Returns a copy of the registered span.
    pub fn start_span(
        &self,
        name: &str,
        trace_id: &str,
        span_id: &str,
        parent_id: Option<String>,
        tags: BTreeMap<String, String>,
    ) -> Span {
        let span = Span::new(name, trace_id, span_id, parent_id, tags);
        self.lock()
            .active_spans
            .insert(span_id.to_string(), span.clone());
        span
    }

    /// Append a log entry to an active span. Unknown ids are ignored.
    pub fn span_log(&self, span_id: &str, message: impl Into<String>) {
        if let Some(span) = self.lock().active_spans.get_mut(span_id) {
            span.log(message);
        }
    }

    /// Finish an active span: compute its duration, emit the
    /// `span.<name>.duration` histogram tagged with the status, and move it
    /// to the completed ring.
    ///
    /// Finishing an unknown span id is a no-op, logged as a warning.
    pub fn finish_span(&self, span_id: &str, status: SpanStatus) {
        let finished = {
            let mut inner = self.lock();
            let Some(mut span) = inner.active_spans.remove(span_id) else {
                drop(inner);
                tracing::warn!(span_id, "finish_span called for unknown span id");
                return;
            };

            let end = Utc::now();
            span.end_time = Some(end);
            span.duration = Some(
                (end - span.start_time)
                    .to_std()
                    .unwrap_or(Duration::ZERO),
            );
            span.status = Some(status);

            inner.completed_spans.push_back(span.clone());
            while inner.completed_spans.len() > MAX_COMPLETED_SPANS {
                inner.completed_spans.pop_front();
            }
            span
        };

        let mut tags = BTreeMap::new();
        tags.insert("status".to_string(), finished.status_label().to_string());
        self.histogram(
            &format!("span.{}.duration", finished.name),
            finished.duration.unwrap_or(Duration::ZERO).as_secs_f64(),
            tags,
        );
    }

    /// Run `f` inside a span, guaranteeing the span is finished on every
    /// exit path: `Ok` finishes with [`SpanStatus::Ok`], `Err` finishes with
    /// [`SpanStatus::Error`] and records the error as a span log entry.
    pub fn with_span<T, E, F>(
        &self,
        name: &str,
        tags: BTreeMap<String, String>,
        f: F,
    ) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnOnce(&Span) -> Result<T, E>,
    {
        let trace_id = format!("{:016x}", rand::random::<u64>());
        let span_id = format!("{:016x}", rand::random::<u64>());
        let span = self.start_span(name, &trace_id, &span_id, None, tags);

        let result = f(&span);
        match &result {
            Ok(_) => self.finish_span(&span_id, SpanStatus::Ok),
            Err(err) => {
                self.span_log(&span_id, err.to_string());
                self.finish_span(&span_id, SpanStatus::Error);
            },
        }
        result
    }

    /// Percentile statistics for one histogram.
    ///
    /// An unknown or empty histogram yields zeroed stats, never an error.
    #[must_use]
    pub fn get_histogram_stats(&self, name: &str) -> HistogramStats {
        let inner = self.lock();
        let Some(samples) = inner.histograms.get(name) else {
            return HistogramStats::default();
        };
        if samples.is_empty() {
            return HistogramStats::default();
        }

        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        HistogramStats {
            count,
            min: sorted[0],
            max: sorted[count - 1],
            mean: sum / count as f64,
            median: percentile(&sorted, 0.50),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
        }
    }

    /// Read-only roll-up of current state.
    #[must_use]
    pub fn get_summary(&self) -> TelemetrySummary {
        let histogram_names: Vec<String> = {
            let inner = self.lock();
            inner.histograms.keys().cloned().collect()
        };
        let histograms = histogram_names
            .into_iter()
            .map(|name| {
                let stats = self.get_histogram_stats(&name);
                (name, stats)
            })
            .collect();

        let inner = self.lock();
        TelemetrySummary {
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
            histograms,
            series_count: inner.series.len(),
            active_spans: inner.active_spans.len(),
            completed_spans: inner.completed_spans.len(),
        }
    }

    /// Full snapshot (aggregates, windowed series, recent spans) for
    /// external reporting. No side effects.
    #[must_use]
    pub fn export_metrics(&self) -> TelemetryExport {
        let summary = self.get_summary();
        let inner = self.lock();
        TelemetryExport {
            summary,
            series: inner
                .series
                .iter()
                .map(|(name, points)| (name.clone(), points.iter().cloned().collect()))
                .collect(),
            recent_spans: inner.completed_spans.iter().cloned().collect(),
        }
    }
}

impl Span {
    fn status_label(&self) -> &'static str {
        self.status.map_or("ok", SpanStatus::as_str)
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let rank = (sorted.len() as f64 * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let telemetry = Telemetry::new();
        telemetry.increment("gates.executed", 1.0, BTreeMap::new());
        telemetry.increment("gates.executed", 2.0, BTreeMap::new());

        let summary = telemetry.get_summary();
        assert_eq!(summary.counters["gates.executed"], 3.0);
    }

    #[test]
    fn test_gauge_overwrites() {
        let telemetry = Telemetry::new();
        telemetry.gauge("queue.depth", 10.0, BTreeMap::new());
        telemetry.gauge("queue.depth", 4.0, BTreeMap::new());

        let summary = telemetry.get_summary();
        assert_eq!(summary.gauges["queue.depth"], 4.0);
    }

    #[test]
    fn test_histogram_stats() {
        let telemetry = Telemetry::new();
        for value in [1.0, 2.0, 3.0, 4.0, 5.0] {
            telemetry.histogram("x", value, BTreeMap::new());
        }

        let stats = telemetry.get_histogram_stats("x");
        assert_eq!(stats.count, 5);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 5.0);
        assert_eq!(stats.mean, 3.0);
        assert_eq!(stats.median, 3.0);
        assert_eq!(stats.p95, 5.0);
    }

    #[test]
    fn test_empty_histogram_stats() {
        let telemetry = Telemetry::new();
        let stats = telemetry.get_histogram_stats("never-recorded");
        assert_eq!(stats, HistogramStats::default());
        assert_eq!(stats.count, 0);
    }

    #[test]
    fn test_series_window_bounded() {
        let telemetry = Telemetry::new();
        for i in 0..1_500 {
            telemetry.gauge("bounded", f64::from(i), BTreeMap::new());
        }

        let export = telemetry.export_metrics();
        let series = &export.series["bounded"];
        assert_eq!(series.len(), 1_000);
        // Oldest retained point is the 500th emission.
        assert_eq!(series[0].value, 500.0);
        assert_eq!(series[999].value, 1_499.0);
    }

    #[test]
    fn test_span_lifecycle() {
        let telemetry = Telemetry::new();
        telemetry.start_span("gate.run", "t1", "s1", None, BTreeMap::new());
        telemetry.span_log("s1", "matched 3 patterns");
        telemetry.finish_span("s1", SpanStatus::Ok);

        let export = telemetry.export_metrics();
        assert_eq!(export.summary.active_spans, 0);
        assert_eq!(export.recent_spans.len(), 1);
        let span = &export.recent_spans[0];
        assert_eq!(span.status, Some(SpanStatus::Ok));
        assert_eq!(span.logs.len(), 1);
        assert!(span.duration.is_some());
        // Finishing emits the duration histogram.
        assert_eq!(
            telemetry.get_histogram_stats("span.gate.run.duration").count,
            1
        );
    }

    #[test]
    fn test_finish_unknown_span_is_noop() {
        let telemetry = Telemetry::new();
        telemetry.finish_span("no-such-span", SpanStatus::Ok);
        assert_eq!(telemetry.get_summary().completed_spans, 0);
    }

    #[test]
    fn test_with_span_finishes_on_error() {
        let telemetry = Telemetry::new();
        let result: Result<(), String> =
            telemetry.with_span("failing", BTreeMap::new(), |_span| {
                Err("pattern store unreachable".to_string())
            });
        assert!(result.is_err());

        let export = telemetry.export_metrics();
        assert_eq!(export.summary.active_spans, 0);
        let span = &export.recent_spans[0];
        assert_eq!(span.status, Some(SpanStatus::Error));
        assert_eq!(span.logs[0].message, "pattern store unreachable");
    }

    #[test]
    fn test_with_span_ok_path() {
        let telemetry = Telemetry::new();
        let result: Result<i32, String> =
            telemetry.with_span("ok", BTreeMap::new(), |_span| Ok(7));
        assert_eq!(result.unwrap(), 7);
        assert_eq!(
            telemetry.export_metrics().recent_spans[0].status,
            Some(SpanStatus::Ok)
        );
    }
}
