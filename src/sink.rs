use crate::pipeline::PipelineStats;
use crate::store::TelemetryStore;
use crate::telemetry::AnomalyRecord;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Persists detector output into one measurement. Write failures are logged
/// and recorded; they never abort the cycle.
pub struct AnomalySink<S> {
    store: Arc<S>,
    measurement: String,
    stats: Arc<PipelineStats>,
}

impl<S: TelemetryStore> AnomalySink<S> {
    pub fn new(store: Arc<S>, measurement: impl Into<String>, stats: Arc<PipelineStats>) -> Self {
        Self {
            store,
            measurement: measurement.into(),
            stats,
        }
    }

    /// Returns how many records reached the store.
    pub async fn persist(&self, records: &[AnomalyRecord]) -> usize {
        if records.is_empty() {
            return 0;
        }
        match self.store.write_records(&self.measurement, records).await {
            Ok(()) => {
                self.stats
                    .anomalies_written
                    .fetch_add(records.len() as u64, Ordering::Relaxed);
                tracing::info!(
                    measurement = %self.measurement,
                    anomalies = records.len(),
                    "persisted anomaly records"
                );
                records.len()
            }
            Err(err) => {
                self.stats.record_error(format!("write {}: {err}", self.measurement));
                tracing::warn!(
                    measurement = %self.measurement,
                    anomalies = records.len(),
                    error = %err,
                    "failed to persist anomaly records"
                );
                0
            }
        }
    }
}
