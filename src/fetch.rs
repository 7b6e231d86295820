use crate::store::TelemetryStore;
use crate::telemetry::{AlignedRecord, ChannelSample, TimeSeriesWindow};
use chrono::{DateTime, Utc};
use futures::future;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Data(TimeSeriesWindow),
    /// No channel returned samples, or the aligned channels never overlap.
    Empty,
}

#[derive(Debug, Clone)]
pub struct WindowFetcher {
    channels: Vec<String>,
    lookback: Duration,
    tolerance: Option<Duration>,
}

impl WindowFetcher {
    pub fn new(channels: Vec<String>, lookback: Duration, tolerance: Option<Duration>) -> Self {
        Self {
            channels,
            lookback,
            tolerance,
        }
    }

    /// Queries every channel concurrently and aligns the results. A failing
    /// channel counts as empty; it never aborts the cycle.
    pub async fn fetch<S: TelemetryStore>(&self, store: &S) -> FetchOutcome {
        let queries = self.channels.iter().map(|channel| async move {
            (channel, store.query_channel(channel, self.lookback).await)
        });
        let results = future::join_all(queries).await;

        let mut series = Vec::with_capacity(results.len());
        for (channel, result) in results {
            let samples = match result {
                Ok(samples) => {
                    if samples.is_empty() {
                        tracing::debug!(channel = %channel, "no samples in look-back window");
                    }
                    samples
                }
                Err(err) => {
                    tracing::warn!(channel = %channel, error = %err, "channel query failed; treating as empty");
                    Vec::new()
                }
            };
            series.push((channel.clone(), samples));
        }
        align_channels(series, self.tolerance)
    }
}

fn sanitize(mut samples: Vec<ChannelSample>) -> Vec<(DateTime<Utc>, f64)> {
    samples.retain(|sample| sample.value.is_finite());
    samples.sort_by_key(|sample| sample.timestamp);
    samples.dedup_by_key(|sample| sample.timestamp);
    samples
        .into_iter()
        .map(|sample| (sample.timestamp, sample.value))
        .collect()
}

/// Index of the sample closest to `ts`; on a tie the earlier sample wins.
fn nearest_index(points: &[(DateTime<Utc>, f64)], ts: DateTime<Utc>) -> Option<usize> {
    if points.is_empty() {
        return None;
    }
    let after = points.partition_point(|(t, _)| *t < ts);
    if after == 0 {
        return Some(0);
    }
    if after == points.len() {
        return Some(points.len() - 1);
    }
    let before = after - 1;
    if ts - points[before].0 <= points[after].0 - ts {
        Some(before)
    } else {
        Some(after)
    }
}

/// Nearest-timestamp join onto the first non-empty channel's timestamps.
///
/// Channels are joined in the given order. With a tolerance, matches further
/// away than the tolerance become `NaN`.
pub fn align_channels(
    series: Vec<(String, Vec<ChannelSample>)>,
    tolerance: Option<Duration>,
) -> FetchOutcome {
    let series: Vec<(String, Vec<(DateTime<Utc>, f64)>)> = series
        .into_iter()
        .map(|(channel, samples)| (channel, sanitize(samples)))
        .filter(|(_, points)| !points.is_empty())
        .collect();

    let Some((_, base)) = series.first() else {
        return FetchOutcome::Empty;
    };
    let tolerance = tolerance.and_then(|tol| chrono::Duration::from_std(tol).ok());

    let records: Vec<AlignedRecord> = base
        .iter()
        .map(|(ts, _)| {
            let values = series
                .iter()
                .map(|(channel, points)| {
                    let value = nearest_index(points, *ts)
                        .map(|idx| points[idx])
                        .filter(|(matched, _)| match tolerance {
                            Some(tol) => (*matched - *ts).abs() <= tol,
                            None => true,
                        })
                        .map(|(_, value)| value)
                        .unwrap_or(f64::NAN);
                    (channel.clone(), value)
                })
                .collect::<BTreeMap<_, _>>();
            AlignedRecord {
                timestamp: *ts,
                values,
            }
        })
        .collect();

    let overlapping = records
        .iter()
        .any(|record| record.values.values().all(|value| value.is_finite()));
    if !overlapping {
        tracing::debug!(channels = series.len(), "aligned channels do not overlap");
        return FetchOutcome::Empty;
    }

    let channels = series.into_iter().map(|(channel, _)| channel).collect();
    FetchOutcome::Data(TimeSeriesWindow::new(channels, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::telemetry::millis_to_dt;

    fn samples(channel: &str, points: &[(i64, f64)]) -> (String, Vec<ChannelSample>) {
        (
            channel.to_string(),
            points
                .iter()
                .map(|(ms, value)| ChannelSample {
                    timestamp: millis_to_dt(*ms),
                    channel: channel.to_string(),
                    value: *value,
                })
                .collect(),
        )
    }

    fn unwrap_window(outcome: FetchOutcome) -> TimeSeriesWindow {
        match outcome {
            FetchOutcome::Data(window) => window,
            FetchOutcome::Empty => panic!("expected data"),
        }
    }

    #[test]
    fn single_channel_alignment_is_identity() {
        let input = samples("GasFlow", &[(0, 1.0), (1000, 2.0), (2000, 3.0)]);
        let window = unwrap_window(align_channels(vec![input], None));
        assert_eq!(window.channels(), &["GasFlow".to_string()]);
        assert_eq!(window.column("GasFlow"), Some(vec![1.0, 2.0, 3.0]));
        assert_eq!(
            window.timestamps(),
            vec![millis_to_dt(0), millis_to_dt(1000), millis_to_dt(2000)]
        );
    }

    #[test]
    fn joins_on_nearest_timestamp_of_first_channel() {
        let base = samples("ForwardPower", &[(0, 10.0), (1000, 11.0), (2000, 12.0)]);
        let other = samples("IncidentPowerReference", &[(100, 1.0), (1400, 2.0), (1600, 3.0)]);
        let window = unwrap_window(align_channels(vec![base, other], None));
        assert_eq!(window.len(), 3);
        assert_eq!(window.column("IncidentPowerReference"), Some(vec![1.0, 2.0, 3.0]));
    }

    #[test]
    fn ties_prefer_the_earlier_sample() {
        let base = samples("a", &[(1000, 0.0)]);
        let other = samples("b", &[(500, 1.0), (1500, 2.0)]);
        let window = unwrap_window(align_channels(vec![base, other], None));
        assert_eq!(window.column("b"), Some(vec![1.0]));
    }

    #[test]
    fn tolerance_leaves_unmatched_rows_undefined() {
        let base = samples("a", &[(0, 1.0), (10_000, 2.0)]);
        let other = samples("b", &[(200, 5.0)]);
        let window = unwrap_window(align_channels(vec![base, other], Some(Duration::from_secs(1))));
        let column = window.column("b").expect("column");
        assert_eq!(column[0], 5.0);
        assert!(column[1].is_nan());
    }

    #[test]
    fn duplicate_timestamps_keep_first() {
        let base = samples("a", &[(0, 1.0), (0, 9.0), (1000, 2.0)]);
        let window = unwrap_window(align_channels(vec![base], None));
        assert_eq!(window.column("a"), Some(vec![1.0, 2.0]));
    }

    #[test]
    fn empty_channels_are_skipped_and_all_empty_is_empty() {
        let empty = samples("a", &[]);
        let base = samples("b", &[(0, 1.0)]);
        let window = unwrap_window(align_channels(vec![empty.clone(), base], None));
        assert_eq!(window.channels(), &["b".to_string()]);
        assert!(!window.has_channel("a"));

        assert_eq!(align_channels(vec![empty], None), FetchOutcome::Empty);
        assert_eq!(align_channels(Vec::new(), None), FetchOutcome::Empty);
    }

    #[test]
    fn zero_overlap_is_empty() {
        let base = samples("a", &[(0, 1.0)]);
        let other = samples("b", &[(60_000, 1.0)]);
        assert_eq!(
            align_channels(vec![base, other], Some(Duration::from_secs(1))),
            FetchOutcome::Empty
        );
    }

    #[tokio::test]
    async fn failing_channel_degrades_to_empty() {
        let now = millis_to_dt(100_000);
        let store = MemoryStore::new(now);
        store.insert("ForwardPower", &[(millis_to_dt(90_000), 1.0), (millis_to_dt(95_000), 2.0)]);
        store.insert("GasFlow", &[(millis_to_dt(95_000), 7.0)]);
        store.fail_channel("GasFlow");

        let fetcher = WindowFetcher::new(
            vec!["ForwardPower".to_string(), "GasFlow".to_string()],
            Duration::from_secs(30),
            None,
        );
        let window = unwrap_window(fetcher.fetch(&store).await);
        assert_eq!(window.channels(), &["ForwardPower".to_string()]);
        assert_eq!(window.len(), 2);
    }

    #[tokio::test]
    async fn samples_outside_lookback_are_not_fetched() {
        let store = MemoryStore::new(millis_to_dt(100_000));
        store.insert("ForwardPower", &[(millis_to_dt(10_000), 1.0)]);
        let fetcher = WindowFetcher::new(vec!["ForwardPower".to_string()], Duration::from_secs(30), None);
        assert_eq!(fetcher.fetch(&store).await, FetchOutcome::Empty);
    }
}
