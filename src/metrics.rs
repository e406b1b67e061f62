//! Metric definitions and the recording path shared by every session
//! component.
//!
//! An [`Instrumentation`] value is created once per [`crate::Stomp`] instance
//! and handed to every transport, session, subscription and transaction it
//! creates. Recording forwards raw samples to whatever [`SampleSink`] the host
//! has installed on the [`Runtime`]; with no sink installed it does nothing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use crate::runtime::Runtime;

/// Tag key carrying the destination of a send, read, ack or nack.
pub const TAG_DESTINATION: &str = "destination";

pub type Tags = BTreeMap<&'static str, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Trend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    BytesSent,
    BytesReceived,
    SendCount,
    SendTiming,
    SendErrorCount,
    ReadCount,
    ReadTiming,
    ReadErrorCount,
    AckCount,
    AckErrorCount,
    NackCount,
    NackErrorCount,
}

impl Metric {
    pub const ALL: [Metric; 12] = [
        Metric::BytesSent,
        Metric::BytesReceived,
        Metric::SendCount,
        Metric::SendTiming,
        Metric::SendErrorCount,
        Metric::ReadCount,
        Metric::ReadTiming,
        Metric::ReadErrorCount,
        Metric::AckCount,
        Metric::AckErrorCount,
        Metric::NackCount,
        Metric::NackErrorCount,
    ];

    /// Exported metric name.
    pub fn name(&self) -> &'static str {
        match self {
            Metric::BytesSent => "data_sent",
            Metric::BytesReceived => "data_received",
            Metric::SendCount => "stomp_send_count",
            Metric::SendTiming => "stomp_send_time",
            Metric::SendErrorCount => "stomp_send_error_count",
            Metric::ReadCount => "stomp_read_count",
            Metric::ReadTiming => "stomp_read_time",
            Metric::ReadErrorCount => "stomp_read_error_count",
            Metric::AckCount => "stomp_ack_count",
            Metric::AckErrorCount => "stomp_ack_error_count",
            Metric::NackCount => "stomp_nack_count",
            Metric::NackErrorCount => "stomp_nack_error_count",
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Metric::SendTiming | Metric::ReadTiming => MetricKind::Trend,
            _ => MetricKind::Counter,
        }
    }
}

/// Operation families that report a terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Send,
    Read,
    Ack,
    Nack,
}

impl Operation {
    pub fn success(&self) -> Metric {
        match self {
            Operation::Send => Metric::SendCount,
            Operation::Read => Metric::ReadCount,
            Operation::Ack => Metric::AckCount,
            Operation::Nack => Metric::NackCount,
        }
    }

    pub fn failure(&self) -> Metric {
        match self {
            Operation::Send => Metric::SendErrorCount,
            Operation::Read => Metric::ReadErrorCount,
            Operation::Ack => Metric::AckErrorCount,
            Operation::Nack => Metric::NackErrorCount,
        }
    }

    pub fn timing(&self) -> Option<Metric> {
        match self {
            Operation::Send => Some(Metric::SendTiming),
            Operation::Read => Some(Metric::ReadTiming),
            Operation::Ack | Operation::Nack => None,
        }
    }
}

/// One raw measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: Metric,
    pub tags: Tags,
    pub time: SystemTime,
    pub value: f64,
}

/// Destination for recorded samples. Implementations synchronize
/// internally; recording happens concurrently from I/O tasks, delivery loops
/// and foreground calls.
pub trait SampleSink: Send + Sync {
    fn push(&self, sample: Sample);
}

/// Records samples on behalf of one module instance.
#[derive(Clone)]
pub struct Instrumentation {
    runtime: Runtime,
}

impl Instrumentation {
    pub fn new(runtime: Runtime) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Forward one sample to the installed sink. A no-op when the host has
    /// no recording context.
    pub fn record(&self, metric: Metric, tags: &Tags, at: SystemTime, value: f64) {
        let Some(sink) = self.runtime.sink() else {
            return;
        };
        sink.push(Sample {
            metric,
            tags: tags.clone(),
            time: at,
            value,
        });
    }

    /// Record a counter increment of one, stamped now.
    pub fn count(&self, metric: Metric, tags: &Tags) {
        self.record(metric, tags, SystemTime::now(), 1.0);
    }

    /// Record a counter increment of `value`, stamped now.
    pub fn count_value(&self, metric: Metric, tags: &Tags, value: f64) {
        self.record(metric, tags, SystemTime::now(), value);
    }

    /// Record a duration sample in milliseconds, stamped now.
    pub fn timing(&self, metric: Metric, tags: &Tags, elapsed: Duration) {
        self.record(metric, tags, SystemTime::now(), millis(elapsed));
    }

    /// Record the terminal samples of one operation started at `started`:
    /// its timing, when the family has one, and exactly one of the success
    /// or failure counters.
    pub fn finish(&self, op: Operation, tags: &Tags, started: Instant, ok: bool) {
        let now = SystemTime::now();
        if let Some(timing) = op.timing() {
            self.record(timing, tags, now, millis(started.elapsed()));
        }
        let terminal = if ok { op.success() } else { op.failure() };
        self.record(terminal, tags, now, 1.0);
    }
}

/// Tags for an operation against `destination`; empty when unknown.
pub fn destination_tags(destination: Option<&str>) -> Tags {
    let mut tags = Tags::new();
    if let Some(d) = destination.filter(|d| !d.is_empty()) {
        tags.insert(TAG_DESTINATION, d.to_string());
    }
    tags
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// In-memory sink used by tests and the CLI summary.
#[derive(Debug, Default)]
pub struct MemorySink {
    samples: Mutex<Vec<Sample>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Sample>> {
        self.samples.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.lock().clone()
    }

    /// Number of samples recorded for `metric`.
    pub fn count(&self, metric: Metric) -> usize {
        self.lock().iter().filter(|s| s.metric == metric).count()
    }

    /// Sum of the values recorded for `metric`.
    pub fn sum(&self, metric: Metric) -> f64 {
        self.lock()
            .iter()
            .filter(|s| s.metric == metric)
            .map(|s| s.value)
            .sum()
    }

    /// Samples of `metric` tagged with `destination`.
    pub fn count_for(&self, metric: Metric, destination: &str) -> usize {
        self.lock()
            .iter()
            .filter(|s| {
                s.metric == metric
                    && s.tags.get(TAG_DESTINATION).map(String::as_str) == Some(destination)
            })
            .count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl SampleSink for MemorySink {
    fn push(&self, sample: Sample) {
        self.lock().push(sample);
    }
}
