use crate::conditioner::{FilterState, SignalConditioner};
use crate::detect::cluster::GroupResult;
use crate::detect::{ClusterDetector, ClusterOutcome, TransitionDetector, TransitionOutcome};
use crate::fetch::{FetchOutcome, WindowFetcher};
use crate::sink::AnomalySink;
use crate::store::TelemetryStore;
use crate::telemetry::{AnomalyRecord, TimeSeriesWindow};
use std::future::Future;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

#[derive(Debug)]
pub struct PipelineStats {
    pub cycles: AtomicU64,
    pub empty_cycles: AtomicU64,
    pub anomalies_written: AtomicU64,
    pub last_cycle_micros: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            cycles: AtomicU64::new(0),
            empty_cycles: AtomicU64::new(0),
            anomalies_written: AtomicU64::new(0),
            last_cycle_micros: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn record_cycle(&self, report: &CycleReport, elapsed_micros: u64) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if matches!(report, CycleReport::Idle) {
            self.empty_cycles.fetch_add(1, Ordering::Relaxed);
        }
        self.last_cycle_micros.store(elapsed_micros, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn log_summary(&self) {
        tracing::info!(
            cycles = self.cycles.load(Ordering::Relaxed),
            empty_cycles = self.empty_cycles.load(Ordering::Relaxed),
            anomalies_written = self.anomalies_written.load(Ordering::Relaxed),
            last_cycle_micros = self.last_cycle_micros.load(Ordering::Relaxed),
            last_error = self.last_error().as_deref().unwrap_or("none"),
            "pipeline statistics"
        );
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleReport {
    /// The look-back window held no usable data.
    Idle,
    Completed {
        rows: usize,
        anomalies: usize,
        written: usize,
    },
}

/// One poll cycle of fetch, detect and persist.
pub trait CyclePipeline: Send {
    fn name(&self) -> &'static str;

    fn run_cycle(&mut self) -> impl Future<Output = CycleReport> + Send;

    /// Drops every value carried between cycles.
    fn reset_state(&mut self);
}

/// Logs each group's outcome and gathers the anomaly records.
pub(crate) fn collect_group_records(results: Vec<GroupResult>) -> Vec<AnomalyRecord> {
    let mut records = Vec::new();
    for GroupResult { group, outcome } in results {
        match &outcome {
            Ok(ClusterOutcome::Anomalies(found)) => {
                tracing::info!(group = %group, anomalies = found.len(), "cluster anomalies detected");
            }
            Ok(ClusterOutcome::Clean) => {
                tracing::debug!(group = %group, "cluster group clean");
            }
            Ok(ClusterOutcome::InsufficientData { rows, required }) => {
                tracing::debug!(group = %group, rows, required, "insufficient data for clustering");
            }
            Err(err) => {
                tracing::warn!(group = %group, error = %err, "cluster group skipped");
            }
        }
        if let Ok(outcome) = outcome {
            records.extend_from_slice(outcome.records());
        }
    }
    records
}

pub struct TransitionPipeline<S> {
    store: Arc<S>,
    fetcher: WindowFetcher,
    conditioner: SignalConditioner,
    detector: TransitionDetector,
    sink: AnomalySink<S>,
    faults: Option<(ClusterDetector, AnomalySink<S>)>,
    cluster_resets_filter: bool,
    state: FilterState,
}

impl<S: TelemetryStore> TransitionPipeline<S> {
    pub fn new(
        store: Arc<S>,
        fetcher: WindowFetcher,
        conditioner: SignalConditioner,
        detector: TransitionDetector,
        sink: AnomalySink<S>,
    ) -> Self {
        Self {
            store,
            fetcher,
            conditioner,
            detector,
            sink,
            faults: None,
            cluster_resets_filter: false,
            state: FilterState::default(),
        }
    }

    /// Also clusters each window; with `resets_filter` any cluster anomaly
    /// clears the carried filter state.
    pub fn with_faults(mut self, detector: ClusterDetector, sink: AnomalySink<S>, resets_filter: bool) -> Self {
        self.faults = Some((detector, sink));
        self.cluster_resets_filter = resets_filter;
        self
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    async fn run_faults(&mut self, window: &TimeSeriesWindow) -> (usize, usize) {
        let Some((detector, sink)) = &self.faults else {
            return (0, 0);
        };
        let records = collect_group_records(detector.detect(window));
        let written = sink.persist(&records).await;
        if self.cluster_resets_filter && !records.is_empty() {
            tracing::info!("cluster anomalies reset the signal filter");
            self.state.clear();
        }
        (records.len(), written)
    }
}

impl<S: TelemetryStore + 'static> CyclePipeline for TransitionPipeline<S> {
    fn name(&self) -> &'static str {
        "transitions"
    }

    async fn run_cycle(&mut self) -> CycleReport {
        let window = match self.fetcher.fetch(self.store.as_ref()).await {
            FetchOutcome::Data(window) => window,
            FetchOutcome::Empty => {
                self.state.clear();
                return CycleReport::Idle;
            }
        };

        tracing::debug!(
            rows = window.len(),
            channels = window.channels().len(),
            cold_start = self.state.is_cold(),
            "window fetched"
        );
        let conditioned = self.conditioner.condition(&window, &mut self.state);
        let (mut anomalies, mut written) = match self.detector.detect(&conditioned) {
            Ok(TransitionOutcome::Detected(records)) => {
                tracing::info!(transitions = records.len(), "transition detected");
                (records.len(), self.sink.persist(&records).await)
            }
            Ok(TransitionOutcome::NoTransition) => {
                tracing::debug!(rows = conditioned.len(), "no transition");
                (0, 0)
            }
            Err(err) => {
                tracing::warn!(error = %err, "transition detector skipped window");
                (0, 0)
            }
        };

        let (fault_anomalies, fault_written) = self.run_faults(&window).await;
        anomalies += fault_anomalies;
        written += fault_written;

        CycleReport::Completed {
            rows: window.len(),
            anomalies,
            written,
        }
    }

    fn reset_state(&mut self) {
        self.state.clear();
    }
}

pub struct FaultPipeline<S> {
    store: Arc<S>,
    fetcher: WindowFetcher,
    detector: ClusterDetector,
    sink: AnomalySink<S>,
}

impl<S: TelemetryStore> FaultPipeline<S> {
    pub fn new(store: Arc<S>, fetcher: WindowFetcher, detector: ClusterDetector, sink: AnomalySink<S>) -> Self {
        Self {
            store,
            fetcher,
            detector,
            sink,
        }
    }
}

impl<S: TelemetryStore + 'static> CyclePipeline for FaultPipeline<S> {
    fn name(&self) -> &'static str {
        "faults"
    }

    async fn run_cycle(&mut self) -> CycleReport {
        let window = match self.fetcher.fetch(self.store.as_ref()).await {
            FetchOutcome::Data(window) => window,
            FetchOutcome::Empty => return CycleReport::Idle,
        };
        tracing::debug!(rows = window.len(), channels = window.channels().len(), "window fetched");
        let records = collect_group_records(self.detector.detect(&window));
        let written = self.sink.persist(&records).await;
        CycleReport::Completed {
            rows: window.len(),
            anomalies: records.len(),
            written,
        }
    }

    // Cluster detection keeps nothing between cycles.
    fn reset_state(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditioner::ConditionerConfig;
    use crate::detect::cluster::{ClusterConfig, ClusterGroup};
    use crate::detect::transition::TransitionConfig;
    use crate::store::memory::MemoryStore;
    use crate::telemetry::{millis_to_dt, RF_CHANNELS};
    use std::time::Duration;

    const START_MS: i64 = 1_700_000_000_000;

    fn rf_store(forward: &[f64]) -> Arc<MemoryStore> {
        let store = MemoryStore::new(millis_to_dt(START_MS + forward.len() as i64 * 1000));
        let at = |i: usize| millis_to_dt(START_MS + i as i64 * 1000);
        let series = |value: &dyn Fn(usize) -> f64| (0..forward.len()).map(|i| (at(i), value(i))).collect::<Vec<_>>();
        store.insert("ForwardPower", &series(&|i| forward[i]));
        store.insert("ReflectionCoefficientMagnitude", &series(&|_| 0.1));
        store.insert("IncidentPowerReference", &series(&|_| 10.0));
        Arc::new(store)
    }

    fn transition_pipeline(store: Arc<MemoryStore>, stats: Arc<PipelineStats>) -> TransitionPipeline<MemoryStore> {
        TransitionPipeline::new(
            store.clone(),
            WindowFetcher::new(
                RF_CHANNELS.iter().map(|c| c.to_string()).collect(),
                Duration::from_secs(50),
                Some(Duration::from_secs(1)),
            ),
            SignalConditioner::new(ConditionerConfig {
                adaptation_alpha: 0.01,
                ..ConditionerConfig::default()
            }),
            TransitionDetector::new(TransitionConfig::default()),
            AnomalySink::new(store, "transitions", stats),
        )
    }

    #[tokio::test]
    async fn transition_cycle_persists_and_carries_state() {
        let store = rf_store(&[10.0, 10.0, 10.0, 50.0]);
        let stats = Arc::new(PipelineStats::new());
        let mut pipeline = transition_pipeline(store.clone(), stats.clone());

        let report = pipeline.run_cycle().await;
        assert_eq!(
            report,
            CycleReport::Completed {
                rows: 4,
                anomalies: 1,
                written: 1
            }
        );
        let written = store.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].0, "transitions");
        assert_eq!(written[0].1.timestamp, millis_to_dt(START_MS + 3000));
        assert!(pipeline.state().adaptation.is_some());
        assert_eq!(stats.anomalies_written.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn empty_window_is_idle_and_clears_state() {
        let store = rf_store(&[10.0, 11.0, 12.0]);
        let mut pipeline = transition_pipeline(store.clone(), Arc::new(PipelineStats::new()));
        pipeline.run_cycle().await;
        assert!(!pipeline.state().is_cold());

        store.clear();
        assert_eq!(pipeline.run_cycle().await, CycleReport::Idle);
        assert!(pipeline.state().is_cold());
    }

    #[tokio::test]
    async fn resumed_data_smooths_from_a_fresh_seed() {
        let at = |secs: i64| millis_to_dt(START_MS + secs * 1000);
        let burst = |from: i64, value: f64| (from..from + 10).map(|s| (at(s), value)).collect::<Vec<_>>();
        let store = Arc::new(MemoryStore::new(at(10)));
        store.insert("ForwardPower", &burst(0, 100.0));
        store.insert("ForwardPower", &burst(200, 20.0));
        store.insert("ForwardPower", &burst(400, 50.0));
        for from in [0, 100, 200, 400] {
            store.insert("ReflectionCoefficientMagnitude", &burst(from, 0.1));
            store.insert("IncidentPowerReference", &burst(from, 10.0));
        }
        let mut pipeline = transition_pipeline(store.clone(), Arc::new(PipelineStats::new()));
        let adaptation_near = |pipeline: &TransitionPipeline<MemoryStore>, expected: f64| {
            pipeline
                .state()
                .adaptation
                .is_some_and(|value| (value - expected).abs() < 1e-6)
        };

        pipeline.run_cycle().await;
        assert!(adaptation_near(&pipeline, 99.9));

        // ForwardPower drops out while the other channels keep reporting.
        store.set_now(at(110));
        assert!(matches!(pipeline.run_cycle().await, CycleReport::Completed { rows: 10, .. }));
        assert!(pipeline.state().is_cold());

        store.set_now(at(210));
        pipeline.run_cycle().await;
        assert!(adaptation_near(&pipeline, 19.9));

        // Nothing at all for the next window.
        store.set_now(at(300));
        assert_eq!(pipeline.run_cycle().await, CycleReport::Idle);
        assert!(pipeline.state().is_cold());

        store.set_now(at(410));
        pipeline.run_cycle().await;
        assert!(adaptation_near(&pipeline, 49.9));
    }

    #[tokio::test]
    async fn cluster_coupling_resets_filter_when_enabled() {
        let mut forward: Vec<f64> = vec![10.0; 40];
        forward.push(500.0);
        let store = rf_store(&forward);
        let stats = Arc::new(PipelineStats::new());
        let detector = ClusterDetector::new(ClusterConfig {
            groups: vec![ClusterGroup::new("fwd", vec!["ForwardPower".to_string()], 0.5)],
            min_samples: 30,
            window: None,
        });

        let mut independent = transition_pipeline(store.clone(), stats.clone()).with_faults(
            detector.clone(),
            AnomalySink::new(store.clone(), "anomalies", stats.clone()),
            false,
        );
        independent.run_cycle().await;
        assert!(!independent.state().is_cold());

        let mut coupled = transition_pipeline(store.clone(), stats.clone()).with_faults(
            detector,
            AnomalySink::new(store.clone(), "anomalies", stats),
            true,
        );
        coupled.run_cycle().await;
        assert!(coupled.state().is_cold());
        assert!(store
            .written()
            .iter()
            .any(|(measurement, record)| measurement == "anomalies"
                && record.source.as_deref() == Some("ForwardPower_uni")));
    }

    #[tokio::test]
    async fn fault_cycle_writes_tagged_anomalies() {
        let store = MemoryStore::new(millis_to_dt(START_MS + 100_000));
        let mut gas: Vec<_> = (0..40).map(|i| (millis_to_dt(START_MS + i * 1000), 1.0)).collect();
        gas.push((millis_to_dt(START_MS + 50_000), 30.0));
        let pressure: Vec<_> = gas.iter().map(|(ts, _)| (*ts, 2.0e-7)).collect();
        store.insert("GasFlow", &gas);
        store.insert("PressureLEBT", &pressure);
        let store = Arc::new(store);
        let stats = Arc::new(PipelineStats::new());

        let mut pipeline = FaultPipeline::new(
            store.clone(),
            WindowFetcher::new(
                vec!["GasFlow".to_string(), "PressureLEBT".to_string()],
                Duration::from_secs(800),
                None,
            ),
            ClusterDetector::new(ClusterConfig {
                groups: vec![ClusterGroup::new(
                    "huts",
                    vec!["GasFlow".to_string(), "PressureLEBT".to_string()],
                    0.32,
                )],
                min_samples: 30,
                window: None,
            }),
            AnomalySink::new(store.clone(), "anomalies", stats),
        );
        let report = pipeline.run_cycle().await;
        assert_eq!(
            report,
            CycleReport::Completed {
                rows: 41,
                anomalies: 1,
                written: 1
            }
        );
        let written = store.written();
        assert_eq!(written[0].1.source.as_deref(), Some("huts_multi"));
        assert_eq!(written[0].1.timestamp, millis_to_dt(START_MS + 50_000));
    }

    #[test]
    fn stats_track_idle_cycles_and_last_error() {
        let stats = PipelineStats::new();
        stats.record_cycle(&CycleReport::Idle, 10);
        stats.record_cycle(
            &CycleReport::Completed {
                rows: 3,
                anomalies: 0,
                written: 0,
            },
            20,
        );
        stats.record_error("store down");
        assert_eq!(stats.cycles.load(Ordering::Relaxed), 2);
        assert_eq!(stats.empty_cycles.load(Ordering::Relaxed), 1);
        assert_eq!(stats.last_cycle_micros.load(Ordering::Relaxed), 20);
        assert_eq!(stats.last_error().as_deref(), Some("store down"));
    }
}
