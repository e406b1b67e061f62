use std::fmt::Write;
use std::time::Duration;

use stomp_session::{MemorySink, Metric, MetricKind, Sample};

/// One line per metric that recorded anything: counters show their total,
/// trends their sample count with avg/min/max in milliseconds.
pub fn render(sink: &MemorySink, elapsed: Duration) -> String {
    let samples = sink.samples();
    let mut out = format!("scenario finished in {:.2?}\n", elapsed);
    for metric in Metric::ALL {
        let values: Vec<f64> = samples
            .iter()
            .filter(|s: &&Sample| s.metric == metric)
            .map(|s| s.value)
            .collect();
        if values.is_empty() {
            continue;
        }
        let total: f64 = values.iter().sum();
        let _ = match metric.kind() {
            MetricKind::Counter => writeln!(out, "  {:<24} {}", metric.name(), total),
            MetricKind::Trend => {
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                writeln!(
                    out,
                    "  {:<24} n={} avg={:.2}ms min={:.2}ms max={:.2}ms",
                    metric.name(),
                    values.len(),
                    total / values.len() as f64,
                    min,
                    max
                )
            }
        };
    }
    out
}
