use crate::pipeline::{CycleReport, CyclePipeline, PipelineStats};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Fixed-period poll loop around one pipeline.
pub struct PollScheduler<P> {
    pipeline: P,
    period: Duration,
    idle_backoff: Duration,
    stats: Arc<PipelineStats>,
}

impl<P: CyclePipeline> PollScheduler<P> {
    pub fn new(pipeline: P, period: Duration, idle_backoff: Duration, stats: Arc<PipelineStats>) -> Self {
        Self {
            pipeline,
            period,
            idle_backoff,
            stats,
        }
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    /// Runs one cycle and returns its report with the delay before the next one.
    ///
    /// A completed cycle waits out the rest of the period. An idle cycle clears
    /// pipeline state and waits the idle backoff instead.
    pub async fn tick(&mut self) -> (CycleReport, Duration) {
        let started = Instant::now();
        let report = self.pipeline.run_cycle().await;
        let elapsed = started.elapsed();
        self.stats
            .record_cycle(&report, u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX));

        let delay = match report {
            CycleReport::Idle => {
                self.pipeline.reset_state();
                tracing::info!(
                    pipeline = self.pipeline.name(),
                    backoff_ms = self.idle_backoff.as_millis() as u64,
                    "no data in look-back window; filter state cleared"
                );
                self.idle_backoff
            }
            CycleReport::Completed {
                rows,
                anomalies,
                written,
            } => {
                tracing::debug!(
                    pipeline = self.pipeline.name(),
                    rows,
                    anomalies,
                    written,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "cycle complete"
                );
                if elapsed > self.period {
                    tracing::warn!(
                        pipeline = self.pipeline.name(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        period_ms = self.period.as_millis() as u64,
                        "cycle overran its period"
                    );
                }
                self.period.saturating_sub(elapsed)
            }
        };
        (report, delay)
    }

    /// Polls until `shutdown` resolves. Shutdown is only observed between
    /// cycles, so a running cycle always finishes.
    pub async fn run_until<F>(mut self, shutdown: F) -> P
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let (_, delay) = self.tick().await;
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!(pipeline = self.pipeline.name(), "shutdown requested; leaving poll loop");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.stats.log_summary();
        self.pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    /// Replays scripted reports; each cycle advances the paused clock by `cost`.
    struct ScriptedPipeline {
        script: VecDeque<CycleReport>,
        cost: Duration,
        resets: usize,
        started_at: Arc<Mutex<Vec<Instant>>>,
    }

    impl ScriptedPipeline {
        fn new(script: Vec<CycleReport>, cost: Duration) -> Self {
            Self {
                script: script.into(),
                cost,
                resets: 0,
                started_at: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl CyclePipeline for ScriptedPipeline {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn run_cycle(&mut self) -> CycleReport {
            self.started_at.lock().expect("lock").push(Instant::now());
            tokio::time::sleep(self.cost).await;
            self.script.pop_front().unwrap_or(CycleReport::Idle)
        }

        fn reset_state(&mut self) {
            self.resets += 1;
        }
    }

    fn completed() -> CycleReport {
        CycleReport::Completed {
            rows: 10,
            anomalies: 0,
            written: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_the_remainder_of_the_period() {
        let pipeline = ScriptedPipeline::new(vec![completed()], Duration::from_secs(2));
        let mut scheduler = PollScheduler::new(
            pipeline,
            Duration::from_secs(5),
            Duration::from_millis(2500),
            Arc::new(PipelineStats::new()),
        );
        let (report, delay) = scheduler.tick().await;
        assert_eq!(report, completed());
        assert_eq!(delay, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_cycle_does_not_sleep() {
        let pipeline = ScriptedPipeline::new(vec![completed()], Duration::from_secs(7));
        let mut scheduler = PollScheduler::new(
            pipeline,
            Duration::from_secs(5),
            Duration::from_millis(2500),
            Arc::new(PipelineStats::new()),
        );
        let (_, delay) = scheduler.tick().await;
        assert_eq!(delay, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_cycle_backs_off_and_resets_state() {
        let pipeline = ScriptedPipeline::new(vec![CycleReport::Idle], Duration::from_millis(100));
        let stats = Arc::new(PipelineStats::new());
        let mut scheduler = PollScheduler::new(
            pipeline,
            Duration::from_secs(5),
            Duration::from_millis(2500),
            stats.clone(),
        );
        let (report, delay) = scheduler.tick().await;
        assert_eq!(report, CycleReport::Idle);
        assert_eq!(delay, Duration::from_millis(2500));
        assert_eq!(scheduler.pipeline().resets, 1);
        assert_eq!(stats.empty_cycles.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cycles_start_on_a_fixed_cadence_until_shutdown() {
        let pipeline = ScriptedPipeline::new(
            vec![completed(), completed(), completed(), completed()],
            Duration::from_secs(1),
        );
        let started_at = pipeline.started_at.clone();
        let stats = Arc::new(PipelineStats::new());
        let scheduler = PollScheduler::new(
            pipeline,
            Duration::from_secs(5),
            Duration::from_millis(2500),
            stats.clone(),
        );
        let origin = Instant::now();
        let pipeline = scheduler
            .run_until(tokio::time::sleep(Duration::from_secs(12)))
            .await;

        let offsets: Vec<u64> = started_at
            .lock()
            .expect("lock")
            .iter()
            .map(|at| at.duration_since(origin).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 5, 10]);
        assert_eq!(stats.cycles.load(Ordering::Relaxed), 3);
        assert_eq!(pipeline.resets, 0);
    }
}
