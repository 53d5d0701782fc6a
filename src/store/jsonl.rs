//! File-backed store: one JSONL file per record kind under the data
//! directory (default `<home>/.vpn-node`), version strings as flat files
//! under `versions/`.

use crate::store::{
    crash_stats_from, downsample, CrashStats, Granularity, LifecycleEvent, LogRecord,
    MetricSample, Store, TimeRange,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const METRICS_FILE: &str = "metrics.jsonl";
const LOGS_FILE: &str = "logs.jsonl";
const LIFECYCLE_FILE: &str = "lifecycle.jsonl";
const VERSIONS_DIR: &str = "versions";

pub struct JsonlStore {
    dir: PathBuf,
    metrics: Mutex<BufWriter<File>>,
    logs: Mutex<BufWriter<File>>,
    lifecycle: Mutex<BufWriter<File>>,
}

impl JsonlStore {
    pub fn open(dir: &Path) -> crate::Result<Self> {
        fs::create_dir_all(dir)?;
        fs::create_dir_all(dir.join(VERSIONS_DIR))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            metrics: Mutex::new(Self::appender(&dir.join(METRICS_FILE))?),
            logs: Mutex::new(Self::appender(&dir.join(LOGS_FILE))?),
            lifecycle: Mutex::new(Self::appender(&dir.join(LIFECYCLE_FILE))?),
        })
    }

    /// Default data directory: `<home>/.vpn-node`.
    pub fn default_dir() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vpn-node")
    }

    fn appender(path: &Path) -> crate::Result<BufWriter<File>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(BufWriter::new(file))
    }

    fn append<T: Serialize>(writer: &Mutex<BufWriter<File>>, record: &T) -> crate::Result<()> {
        let line = serde_json::to_string(record)?;
        let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(())
    }

    fn read_all<T: DeserializeOwned>(&self, name: &str) -> crate::Result<Vec<T>> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(path)?);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(record) => out.push(record),
                // A torn final line from a crashed process is expected;
                // anything else is worth a warning but not a failure.
                Err(e) => tracing::warn!("skipping bad record in {}: {}", name, e),
            }
        }
        Ok(out)
    }

    fn version_path(&self, component: &str) -> PathBuf {
        self.dir.join(VERSIONS_DIR).join(component)
    }
}

impl Store for JsonlStore {
    fn append_metric(&self, sample: MetricSample) -> crate::Result<()> {
        Self::append(&self.metrics, &sample)
    }

    fn append_log(&self, record: LogRecord) -> crate::Result<()> {
        Self::append(&self.logs, &record)
    }

    fn append_lifecycle(&self, event: LifecycleEvent) -> crate::Result<()> {
        Self::append(&self.lifecycle, &event)
    }

    fn query_metrics(
        &self,
        range: TimeRange,
        granularity: Granularity,
    ) -> crate::Result<Vec<MetricSample>> {
        let samples: Vec<MetricSample> = self
            .read_all::<MetricSample>(METRICS_FILE)?
            .into_iter()
            .filter(|s| range.contains(s.timestamp))
            .collect();
        Ok(downsample(samples, range, granularity))
    }

    fn query_logs(&self, range: TimeRange, limit: usize) -> crate::Result<Vec<LogRecord>> {
        let mut logs: Vec<LogRecord> = self
            .read_all::<LogRecord>(LOGS_FILE)?
            .into_iter()
            .filter(|r| range.contains(r.timestamp))
            .collect();
        if logs.len() > limit {
            logs.drain(..logs.len() - limit);
        }
        Ok(logs)
    }

    fn lifecycle_tail(&self, limit: usize) -> crate::Result<Vec<LifecycleEvent>> {
        let mut events = self.read_all::<LifecycleEvent>(LIFECYCLE_FILE)?;
        if events.len() > limit {
            events.drain(..events.len() - limit);
        }
        Ok(events)
    }

    fn crash_stats(&self, range: TimeRange) -> crate::Result<CrashStats> {
        let events = self.read_all::<LifecycleEvent>(LIFECYCLE_FILE)?;
        Ok(crash_stats_from(&events, range))
    }

    fn get_version(&self, component: &str) -> crate::Result<Option<String>> {
        match fs::read_to_string(self.version_path(component)) {
            Ok(text) => Ok(Some(text.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_version(&self, component: &str, version: &str) -> crate::Result<()> {
        fs::write(self.version_path(component), version)?;
        Ok(())
    }

    fn close(&self) -> crate::Result<()> {
        for writer in [&self.metrics, &self.logs, &self.lifecycle] {
            writer.lock().unwrap_or_else(|e| e.into_inner()).flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LifecycleKind;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("meshtun-store-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn metrics_round_trip_with_range() {
        let dir = temp_dir("metrics");
        let store = JsonlStore::open(&dir).unwrap();

        for ts in [100, 200, 300] {
            store
                .append_metric(MetricSample {
                    timestamp: ts,
                    bytes_in: ts as u64,
                    bytes_out: 0,
                    packets_in: 0,
                    packets_out: 0,
                    peer_count: 0,
                })
                .unwrap();
        }

        let got = store
            .query_metrics(TimeRange { from: 150, to: 250 }, Granularity::Raw)
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].timestamp, 200);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn lifecycle_tail_and_crash_stats() {
        let dir = temp_dir("lifecycle");
        let store = JsonlStore::open(&dir).unwrap();

        let event = |ts, kind| LifecycleEvent {
            timestamp: ts,
            event: kind,
            reason: "test".to_string(),
            uptime_seconds: 1,
            route_all_at_event: false,
            route_restored: false,
            version: crate::VERSION.to_string(),
        };
        store.append_lifecycle(event(10, LifecycleKind::Start)).unwrap();
        store.append_lifecycle(event(20, LifecycleKind::Crash)).unwrap();
        store
            .append_lifecycle(event(30, LifecycleKind::ConnectionLost))
            .unwrap();

        let tail = store.lifecycle_tail(2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].timestamp, 20);

        let stats = store.crash_stats(TimeRange { from: 0, to: 100 }).unwrap();
        assert_eq!(stats.crashes, 1);
        assert_eq!(stats.connection_losses, 1);
        assert_eq!(stats.last_crash.unwrap().timestamp, 20);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn version_strings() {
        let dir = temp_dir("versions");
        let store = JsonlStore::open(&dir).unwrap();

        assert_eq!(store.get_version("node").unwrap(), None);
        store.set_version("node", "1.2.3").unwrap();
        assert_eq!(store.get_version("node").unwrap(), Some("1.2.3".to_string()));

        fs::remove_dir_all(&dir).unwrap();
    }
}
