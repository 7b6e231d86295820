use super::TelemetryStore;
use crate::error::StoreError;
use crate::telemetry::{AnomalyRecord, ChannelSample};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// In-process store used by tests. Queries are answered relative to a fixed
/// `now` so windows are reproducible.
pub struct MemoryStore {
    now: Mutex<DateTime<Utc>>,
    samples: Mutex<HashMap<String, Vec<ChannelSample>>>,
    failing: Mutex<HashSet<String>>,
    written: Mutex<Vec<(String, AnomalyRecord)>>,
}

impl MemoryStore {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
            samples: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("now lock") = now;
    }

    pub fn insert(&self, channel: &str, points: &[(DateTime<Utc>, f64)]) {
        let mut guard = self.samples.lock().expect("samples lock");
        let entry = guard.entry(channel.to_string()).or_default();
        entry.extend(points.iter().map(|(timestamp, value)| ChannelSample {
            timestamp: *timestamp,
            channel: channel.to_string(),
            value: *value,
        }));
        entry.sort_by_key(|sample| sample.timestamp);
    }

    pub fn clear(&self) {
        self.samples.lock().expect("samples lock").clear();
    }

    pub fn fail_channel(&self, channel: &str) {
        self.failing
            .lock()
            .expect("failing lock")
            .insert(channel.to_string());
    }

    pub fn written(&self) -> Vec<(String, AnomalyRecord)> {
        self.written.lock().expect("written lock").clone()
    }
}

impl TelemetryStore for MemoryStore {
    async fn query_channel(
        &self,
        channel: &str,
        lookback: Duration,
    ) -> Result<Vec<ChannelSample>, StoreError> {
        if self.failing.lock().expect("failing lock").contains(channel) {
            return Err(StoreError::Unavailable(format!("{channel} query refused")));
        }
        let now = *self.now.lock().expect("now lock");
        let start = now - ChronoDuration::from_std(lookback).unwrap_or_else(|_| ChronoDuration::zero());
        let guard = self.samples.lock().expect("samples lock");
        Ok(guard
            .get(channel)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|sample| sample.timestamp >= start && sample.timestamp <= now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn write_records(
        &self,
        measurement: &str,
        records: &[AnomalyRecord],
    ) -> Result<(), StoreError> {
        let mut guard = self.written.lock().expect("written lock");
        guard.extend(
            records
                .iter()
                .map(|record| (measurement.to_string(), record.clone())),
        );
        Ok(())
    }
}
