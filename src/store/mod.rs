//! Metrics / log / lifecycle store.
//!
//! The store is an external collaborator as far as the packet plane is
//! concerned: the daemon only needs "ingest timestamped records, answer
//! time-range queries". `JsonlStore` is the shipped implementation;
//! `MemStore` backs tests.

pub mod jsonl;
pub mod mem;

use serde::{Deserialize, Serialize};

/// Inclusive unix-seconds query window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub from: i64,
    pub to: i64,
}

impl TimeRange {
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.from && ts <= self.to
    }

    pub fn span_seconds(&self) -> i64 {
        self.to - self.from
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Granularity {
    Raw,
    OneMinute,
    OneHour,
    Auto,
}

impl Granularity {
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "raw" => Ok(Granularity::Raw),
            "1m" => Ok(Granularity::OneMinute),
            "1h" => Ok(Granularity::OneHour),
            "auto" => Ok(Granularity::Auto),
            other => Err(format!("unknown granularity: {}", other).into()),
        }
    }

    /// Resolves `auto` against the queried span: raw up to 2 h, minute
    /// buckets up to 48 h, hour buckets beyond.
    pub fn resolve(self, range: TimeRange) -> Granularity {
        match self {
            Granularity::Auto => {
                let span = range.span_seconds();
                if span <= 2 * 3600 {
                    Granularity::Raw
                } else if span <= 48 * 3600 {
                    Granularity::OneMinute
                } else {
                    Granularity::OneHour
                }
            }
            other => other,
        }
    }

    fn bucket_seconds(self) -> Option<i64> {
        match self {
            Granularity::Raw | Granularity::Auto => None,
            Granularity::OneMinute => Some(60),
            Granularity::OneHour => Some(3600),
        }
    }
}

/// One sample of the daemon's cumulative traffic counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: i64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub peer_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: i64,
    pub level: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleKind {
    Start,
    Stop,
    Crash,
    Signal,
    ConnectionLost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub timestamp: i64,
    pub event: LifecycleKind,
    pub reason: String,
    pub uptime_seconds: u64,
    pub route_all_at_event: bool,
    pub route_restored: bool,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrashStats {
    pub total_events: u64,
    pub crashes: u64,
    pub connection_losses: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_crash: Option<LifecycleEvent>,
}

pub trait Store: Send + Sync {
    fn append_metric(&self, sample: MetricSample) -> crate::Result<()>;
    fn append_log(&self, record: LogRecord) -> crate::Result<()>;
    fn append_lifecycle(&self, event: LifecycleEvent) -> crate::Result<()>;

    fn query_metrics(
        &self,
        range: TimeRange,
        granularity: Granularity,
    ) -> crate::Result<Vec<MetricSample>>;
    fn query_logs(&self, range: TimeRange, limit: usize) -> crate::Result<Vec<LogRecord>>;
    fn lifecycle_tail(&self, limit: usize) -> crate::Result<Vec<LifecycleEvent>>;
    fn crash_stats(&self, range: TimeRange) -> crate::Result<CrashStats>;

    /// Per-component last-seen version strings (`versions/` layout).
    fn get_version(&self, component: &str) -> crate::Result<Option<String>>;
    fn set_version(&self, component: &str, version: &str) -> crate::Result<()>;

    fn close(&self) -> crate::Result<()>;
}

/// Appends one operational log record, swallowing (but tracing) append
/// failures so logging never takes a session down.
pub fn log(store: &dyn Store, level: &str, message: impl Into<String>) {
    let record = LogRecord {
        timestamp: crate::topology::now_unix(),
        level: level.to_string(),
        message: message.into(),
    };
    if let Err(e) = store.append_log(record) {
        tracing::warn!("log append failed: {}", e);
    }
}

/// Downsamples cumulative counter samples: the last sample of each bucket
/// represents the bucket.
pub(crate) fn downsample(
    samples: Vec<MetricSample>,
    range: TimeRange,
    granularity: Granularity,
) -> Vec<MetricSample> {
    let bucket = match granularity.resolve(range).bucket_seconds() {
        Some(bucket) => bucket,
        None => return samples,
    };

    let mut out: Vec<MetricSample> = Vec::new();
    for sample in samples {
        let slot = sample.timestamp - sample.timestamp.rem_euclid(bucket);
        match out.last_mut() {
            Some(last) if last.timestamp - last.timestamp.rem_euclid(bucket) == slot => {
                *last = sample;
            }
            _ => out.push(sample),
        }
    }
    out
}

pub(crate) fn crash_stats_from(events: &[LifecycleEvent], range: TimeRange) -> CrashStats {
    let in_range: Vec<&LifecycleEvent> = events
        .iter()
        .filter(|e| range.contains(e.timestamp))
        .collect();

    let crashes = in_range
        .iter()
        .filter(|e| e.event == LifecycleKind::Crash)
        .count() as u64;
    let connection_losses = in_range
        .iter()
        .filter(|e| e.event == LifecycleKind::ConnectionLost)
        .count() as u64;
    let last_crash = in_range
        .iter()
        .rev()
        .find(|e| e.event == LifecycleKind::Crash)
        .map(|e| (*e).clone());

    CrashStats {
        total_events: in_range.len() as u64,
        crashes,
        connection_losses,
        last_crash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: i64, bytes_in: u64) -> MetricSample {
        MetricSample {
            timestamp: ts,
            bytes_in,
            bytes_out: 0,
            packets_in: 0,
            packets_out: 0,
            peer_count: 1,
        }
    }

    #[test]
    fn auto_granularity_scales_with_span() {
        let hour = TimeRange { from: 0, to: 3600 };
        let day = TimeRange { from: 0, to: 86400 };
        let week = TimeRange {
            from: 0,
            to: 7 * 86400,
        };
        assert_eq!(Granularity::Auto.resolve(hour), Granularity::Raw);
        assert_eq!(Granularity::Auto.resolve(day), Granularity::OneMinute);
        assert_eq!(Granularity::Auto.resolve(week), Granularity::OneHour);
    }

    #[test]
    fn downsample_keeps_last_per_bucket() {
        let range = TimeRange { from: 0, to: 86400 };
        let samples = vec![sample(0, 1), sample(30, 2), sample(59, 3), sample(60, 4)];
        let out = downsample(samples, range, Granularity::OneMinute);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].bytes_in, 3);
        assert_eq!(out[1].bytes_in, 4);
    }
}
