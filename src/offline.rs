//! Batch analysis of exported recordings.
//!
//! A recording is a directory of `<Channel>_df.csv` files, each with an index
//! column, a `time` column and a value column named after the channel.

use crate::conditioner::{FilterState, SignalConditioner};
use crate::config::Config;
use crate::detect::cluster::GroupResult;
use crate::detect::transition::TransitionConfig;
use crate::detect::{ClusterDetector, TransitionDetector};
use crate::fetch::{align_channels, FetchOutcome};
use crate::pipeline::collect_group_records;
use crate::telemetry::{parse_timestamp, parse_value, AnomalyRecord, ChannelSample, RF_CHANNELS};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CLUSTER_WINDOW: Duration = Duration::from_secs(800);
pub const DEFAULT_SLIDING_ROWS: usize = 500;

const TIME_COLUMN: &str = "time";

#[derive(Debug, Serialize)]
pub struct RecordingReport {
    pub recording: String,
    /// Samples loaded per channel; absent channels are reported as 0.
    pub samples: BTreeMap<String, usize>,
    pub fault_count: usize,
    pub transition_count: usize,
    pub faults: Vec<AnomalyRecord>,
    pub transitions: Vec<AnomalyRecord>,
}

/// Reads one channel export. The value column is the one named after the
/// channel, or the last column when no header matches.
pub fn load_channel_csv(path: &Path, channel: &str) -> Result<Vec<ChannelSample>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let time_idx = headers
        .iter()
        .position(|h| h.trim() == TIME_COLUMN)
        .with_context(|| format!("{} has no `{TIME_COLUMN}` column", path.display()))?;
    let value_idx = headers
        .iter()
        .position(|h| h.trim() == channel)
        .unwrap_or(headers.len().saturating_sub(1));

    let mut samples = Vec::new();
    for row in reader.records() {
        let row = row.with_context(|| format!("malformed row in {}", path.display()))?;
        let (Some(timestamp), Some(value)) = (
            row.get(time_idx).and_then(parse_timestamp),
            row.get(value_idx).and_then(parse_value),
        ) else {
            continue;
        };
        samples.push(ChannelSample {
            timestamp,
            channel: channel.to_string(),
            value,
        });
    }
    samples.sort_by_key(|sample| sample.timestamp);
    Ok(samples)
}

pub struct OfflineAnalyzer {
    channels: Vec<String>,
    tolerance: Option<Duration>,
    conditioner: SignalConditioner,
    transitions: TransitionDetector,
    clusters: ClusterDetector,
}

impl OfflineAnalyzer {
    /// Clusters in fixed sub-windows and slides the slope fit over
    /// `window_rows` rows, falling back to the configured or default sizes.
    pub fn from_config(config: &Config, window_rows: Option<usize>) -> Self {
        let mut cluster = config.cluster.clone();
        cluster.window = cluster.window.or(Some(DEFAULT_CLUSTER_WINDOW));
        let transition = TransitionConfig {
            slope_window_rows: window_rows
                .or(config.transition.slope_window_rows)
                .or(Some(DEFAULT_SLIDING_ROWS)),
            ..config.transition.clone()
        };

        let mut channels: Vec<String> = RF_CHANNELS.iter().map(|c| c.to_string()).collect();
        for channel in config.fault_channels() {
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }
        Self {
            channels,
            tolerance: config.align_tolerance,
            conditioner: SignalConditioner::new(config.conditioner.clone()),
            transitions: TransitionDetector::new(transition),
            clusters: ClusterDetector::new(cluster),
        }
    }

    pub fn analyze_recording(&self, dir: &Path) -> RecordingReport {
        let recording = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());

        let mut loaded: BTreeMap<String, Vec<ChannelSample>> = BTreeMap::new();
        for channel in &self.channels {
            let path = dir.join(format!("{channel}_df.csv"));
            let samples = match load_channel_csv(&path, channel) {
                Ok(samples) => samples,
                Err(err) => {
                    tracing::warn!(recording = %recording, channel = %channel, error = %err, "channel export unavailable");
                    Vec::new()
                }
            };
            loaded.insert(channel.clone(), samples);
        }
        let samples: BTreeMap<String, usize> = loaded.iter().map(|(k, v)| (k.clone(), v.len())).collect();

        let mut faults = Vec::new();
        for group in &self.clusters.config().groups {
            let series = group
                .channels
                .iter()
                .map(|c| (c.clone(), loaded.get(c).cloned().unwrap_or_default()))
                .collect();
            let FetchOutcome::Data(window) = align_channels(series, self.tolerance) else {
                tracing::warn!(recording = %recording, group = %group.name, "no overlapping data for group");
                continue;
            };
            let result = GroupResult {
                group: group.name.clone(),
                outcome: self.clusters.detect_group(&window, group),
            };
            faults.extend(collect_group_records(vec![result]));
        }

        let series = RF_CHANNELS
            .iter()
            .map(|c| (c.to_string(), loaded.get(*c).cloned().unwrap_or_default()))
            .collect();
        let transitions = match align_channels(series, self.tolerance) {
            FetchOutcome::Data(window) => {
                let conditioned = self.conditioner.condition(&window, &mut FilterState::default());
                match self.transitions.detect(&conditioned) {
                    Ok(outcome) => outcome.records().to_vec(),
                    Err(err) => {
                        tracing::warn!(recording = %recording, error = %err, "transition analysis skipped");
                        Vec::new()
                    }
                }
            }
            FetchOutcome::Empty => Vec::new(),
        };

        tracing::info!(
            recording = %recording,
            faults = faults.len(),
            transitions = transitions.len(),
            "recording analysed"
        );
        RecordingReport {
            recording,
            samples,
            fault_count: faults.len(),
            transition_count: transitions.len(),
            faults,
            transitions,
        }
    }

    /// Analyses every sub-directory of `root` in name order.
    pub fn analyze_directory(&self, root: &Path) -> Result<Vec<RecordingReport>> {
        let mut recordings: Vec<PathBuf> = std::fs::read_dir(root)
            .with_context(|| format!("failed to read {}", root.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_dir())
            .collect();
        recordings.sort();
        if recordings.is_empty() {
            tracing::info!(dir = %root.display(), "no recordings found");
        }
        Ok(recordings
            .iter()
            .map(|dir| self.analyze_recording(dir))
            .collect())
    }
}
