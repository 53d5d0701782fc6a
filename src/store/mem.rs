//! In-memory store for tests.

use crate::store::{
    crash_stats_from, downsample, CrashStats, Granularity, LifecycleEvent, LogRecord,
    MetricSample, Store, TimeRange,
};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct MemStore {
    metrics: Mutex<Vec<MetricSample>>,
    logs: Mutex<Vec<LogRecord>>,
    lifecycle: Mutex<Vec<LifecycleEvent>>,
    versions: Mutex<HashMap<String, String>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lifecycle_events(&self) -> Vec<LifecycleEvent> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Store for MemStore {
    fn append_metric(&self, sample: MetricSample) -> crate::Result<()> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).push(sample);
        Ok(())
    }

    fn append_log(&self, record: LogRecord) -> crate::Result<()> {
        self.logs.lock().unwrap_or_else(|e| e.into_inner()).push(record);
        Ok(())
    }

    fn append_lifecycle(&self, event: LifecycleEvent) -> crate::Result<()> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()).push(event);
        Ok(())
    }

    fn query_metrics(
        &self,
        range: TimeRange,
        granularity: Granularity,
    ) -> crate::Result<Vec<MetricSample>> {
        let samples: Vec<MetricSample> = self
            .metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| range.contains(s.timestamp))
            .cloned()
            .collect();
        Ok(downsample(samples, range, granularity))
    }

    fn query_logs(&self, range: TimeRange, limit: usize) -> crate::Result<Vec<LogRecord>> {
        let mut logs: Vec<LogRecord> = self
            .logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| range.contains(r.timestamp))
            .cloned()
            .collect();
        if logs.len() > limit {
            logs.drain(..logs.len() - limit);
        }
        Ok(logs)
    }

    fn lifecycle_tail(&self, limit: usize) -> crate::Result<Vec<LifecycleEvent>> {
        let events = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        let start = events.len().saturating_sub(limit);
        Ok(events[start..].to_vec())
    }

    fn crash_stats(&self, range: TimeRange) -> crate::Result<CrashStats> {
        let events = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        Ok(crash_stats_from(&events, range))
    }

    fn get_version(&self, component: &str) -> crate::Result<Option<String>> {
        Ok(self
            .versions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(component)
            .cloned())
    }

    fn set_version(&self, component: &str, version: &str) -> crate::Result<()> {
        self.versions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(component.to_string(), version.to_string());
        Ok(())
    }

    fn close(&self) -> crate::Result<()> {
        Ok(())
    }
}
