//! Metric samples and the bounded pipeline that carries them from VUs and
//! executors to the consumer.
//!
//! The channel is the back-pressure point: when the consumer stalls, senders
//! block on `send` rather than buffering unboundedly. The scheduler guarantees
//! nothing is sent after the end of the run is observable, so the consumer may
//! simply drain until every sender has hung up.

use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

use crossbeam_channel::{bounded, Receiver, Sender};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

// Builtin metric names emitted by the execution core.
pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const DROPPED_ITERATIONS: &str = "dropped_iterations";
pub const VUS: &str = "vus";
pub const VUS_MAX: &str = "vus_max";
pub const DATA_SENT: &str = "data_sent";
pub const DATA_RECEIVED: &str = "data_received";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Rate,
    /// Distribution metric; values are milliseconds.
    Trend,
}

/// One metric observation with tags.
#[derive(Debug, Clone)]
pub struct Sample {
    pub metric: String,
    pub kind: MetricKind,
    pub value: f64,
    pub time: SystemTime,
    pub tags: HashMap<String, String>,
}

impl Sample {
    pub fn new(metric: impl Into<String>, kind: MetricKind, value: f64) -> Self {
        Self {
            metric: metric.into(),
            kind,
            value,
            time: SystemTime::now(),
            tags: HashMap::new(),
        }
    }

    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.tags = tags;
        self
    }
}

/// A batch of samples, the unit the channel moves. Producers that already
/// have several observations from one event send them together so the
/// consumer sees them adjacently.
#[derive(Debug, Clone, Default)]
pub struct Samples(pub Vec<Sample>);

impl From<Sample> for Samples {
    fn from(sample: Sample) -> Self {
        Samples(vec![sample])
    }
}

/// The bounded sample pipeline.
pub fn sample_channel(capacity: usize) -> (Sender<Samples>, Receiver<Samples>) {
    bounded(capacity)
}

/// End-of-run statistics for one trend metric, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendStats {
    pub count: u64,
    pub min: f64,
    pub avg: f64,
    pub med: f64,
    pub p90: f64,
    pub p95: f64,
    pub max: f64,
}

/// Serializable end-of-run report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Report {
    pub counters: BTreeMap<String, f64>,
    pub gauges: BTreeMap<String, f64>,
    /// name → (successes, total).
    pub rates: BTreeMap<String, (u64, u64)>,
    pub trends: BTreeMap<String, TrendStats>,
}

impl Report {
    /// Human-readable rendering, one line per metric.
    pub fn render(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for (name, value) in &self.counters {
            let _ = writeln!(out, "  {name:.<32} {value}");
        }
        for (name, (passes, total)) in &self.rates {
            let pct = if *total == 0 {
                100.0
            } else {
                *passes as f64 / *total as f64 * 100.0
            };
            let _ = writeln!(out, "  {name:.<32} {pct:.2}% ({passes}/{total})");
        }
        for (name, t) in &self.trends {
            let _ = writeln!(
                out,
                "  {name:.<32} avg={:.2}ms min={:.2}ms med={:.2}ms p(90)={:.2}ms p(95)={:.2}ms max={:.2}ms",
                t.avg, t.min, t.med, t.p90, t.p95, t.max
            );
        }
        for (name, value) in &self.gauges {
            let _ = writeln!(out, "  {name:.<32} {value}");
        }
        out
    }
}

/// Single-owner consumer of the sample pipeline. Run [`Aggregator::consume`]
/// on its own thread and join it once every sender is dropped.
pub struct Aggregator {
    counters: HashMap<String, f64>,
    gauges: HashMap<String, f64>,
    rates: HashMap<String, (u64, u64)>,
    trends: HashMap<String, Histogram<u64>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            counters: HashMap::new(),
            gauges: HashMap::new(),
            rates: HashMap::new(),
            trends: HashMap::new(),
        }
    }

    pub fn add(&mut self, sample: &Sample) {
        match sample.kind {
            MetricKind::Counter => {
                *self.counters.entry(sample.metric.clone()).or_insert(0.0) += sample.value;
            }
            MetricKind::Gauge => {
                self.gauges.insert(sample.metric.clone(), sample.value);
            }
            MetricKind::Rate => {
                let entry = self.rates.entry(sample.metric.clone()).or_insert((0, 0));
                if sample.value != 0.0 {
                    entry.0 += 1;
                }
                entry.1 += 1;
            }
            MetricKind::Trend => {
                let hist = self.trends.entry(sample.metric.clone()).or_insert_with(|| {
                    // Microsecond resolution, up to one hour.
                    Histogram::<u64>::new_with_bounds(1, 60 * 60 * 1000 * 1000, 2).unwrap()
                });
                let micros = (sample.value * 1000.0).max(0.0) as u64;
                hist.saturating_record(micros.max(1));
            }
        }
    }

    pub fn add_all(&mut self, samples: &Samples) {
        for sample in &samples.0 {
            self.add(sample);
        }
    }

    /// Drains the receiver until all senders hang up, then returns self for
    /// reporting.
    pub fn consume(mut self, rx: Receiver<Samples>) -> Self {
        while let Ok(samples) = rx.recv() {
            self.add_all(&samples);
        }
        self
    }

    pub fn to_report(&self) -> Report {
        let mut report = Report::default();
        for (name, value) in &self.counters {
            report.counters.insert(name.clone(), *value);
        }
        for (name, value) in &self.gauges {
            report.gauges.insert(name.clone(), *value);
        }
        for (name, value) in &self.rates {
            report.rates.insert(name.clone(), *value);
        }
        for (name, hist) in &self.trends {
            let to_ms = |v: u64| v as f64 / 1000.0;
            report.trends.insert(
                name.clone(),
                TrendStats {
                    count: hist.len(),
                    min: to_ms(hist.min()),
                    avg: hist.mean() / 1000.0,
                    med: to_ms(hist.value_at_quantile(0.5)),
                    p90: to_ms(hist.value_at_quantile(0.9)),
                    p95: to_ms(hist.value_at_quantile(0.95)),
                    max: to_ms(hist.max()),
                },
            );
        }
        report
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let mut agg = Aggregator::new();
        agg.add(&Sample::new(ITERATIONS, MetricKind::Counter, 1.0));
        agg.add(&Sample::new(ITERATIONS, MetricKind::Counter, 2.0));
        agg.add(&Sample::new(VUS, MetricKind::Gauge, 5.0));
        agg.add(&Sample::new(VUS, MetricKind::Gauge, 3.0));

        let report = agg.to_report();
        assert_eq!(report.counters[ITERATIONS], 3.0);
        assert_eq!(report.gauges[VUS], 3.0);
    }

    #[test]
    fn test_rate() {
        let mut agg = Aggregator::new();
        for ok in [1.0, 1.0, 0.0, 1.0] {
            agg.add(&Sample::new("checks", MetricKind::Rate, ok));
        }
        let report = agg.to_report();
        assert_eq!(report.rates["checks"], (3, 4));
    }

    #[test]
    fn test_trend_percentiles() {
        let mut agg = Aggregator::new();
        for ms in 1..=100 {
            agg.add(&Sample::new(
                ITERATION_DURATION,
                MetricKind::Trend,
                ms as f64,
            ));
        }
        let report = agg.to_report();
        let t = &report.trends[ITERATION_DURATION];
        assert_eq!(t.count, 100);
        assert!(t.min <= 1.1);
        assert!(t.max >= 99.0);
        assert!(t.med >= 45.0 && t.med <= 55.0);
        assert!(t.p95 >= 90.0);
    }

    #[test]
    fn test_consume_until_senders_drop() {
        let (tx, rx) = sample_channel(16);
        let handle = std::thread::spawn(move || Aggregator::new().consume(rx));
        for _ in 0..10 {
            tx.send(Sample::new(ITERATIONS, MetricKind::Counter, 1.0).into())
                .unwrap();
        }
        drop(tx);
        let agg = handle.join().unwrap();
        assert_eq!(agg.to_report().counters[ITERATIONS], 10.0);
    }

    #[test]
    fn test_bounded_channel_backpressure() {
        let (tx, rx) = sample_channel(1);
        tx.send(Sample::new(ITERATIONS, MetricKind::Counter, 1.0).into())
            .unwrap();
        // The channel is full now; a try_send must fail rather than buffer.
        assert!(tx
            .try_send(Sample::new(ITERATIONS, MetricKind::Counter, 1.0).into())
            .is_err());
        drop(rx);
    }

    #[test]
    fn test_report_render_mentions_metrics() {
        let mut agg = Aggregator::new();
        agg.add(&Sample::new(ITERATIONS, MetricKind::Counter, 7.0));
        let text = agg.to_report().render();
        assert!(text.contains(ITERATIONS));
        assert!(text.contains('7'));
    }
}
