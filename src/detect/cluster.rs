use super::dbscan::{dbscan, DbscanParams};
use crate::error::DetectError;
use crate::telemetry::{
    AnomalyRecord, TimeSeriesWindow, FORWARD_POWER, INCIDENT_POWER_REFERENCE,
    REFLECTION_COEFFICIENT_MAGNITUDE,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

/// Channels clustered together under one neighbourhood radius.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterGroup {
    pub name: String,
    pub channels: Vec<String>,
    pub epsilon: f64,
}

impl ClusterGroup {
    pub fn new(name: impl Into<String>, channels: Vec<String>, epsilon: f64) -> Self {
        Self {
            name: name.into(),
            channels,
            epsilon,
        }
    }

    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new(
                "rf",
                vec![
                    FORWARD_POWER.to_string(),
                    REFLECTION_COEFFICIENT_MAGNITUDE.to_string(),
                    INCIDENT_POWER_REFERENCE.to_string(),
                ],
                14.0,
            ),
            Self::new(
                "huts",
                vec!["GasFlow".to_string(), "PressureLEBT".to_string()],
                0.32,
            ),
            Self::new("CameraLuminosity", vec!["CameraLuminosity".to_string()], 0.6),
        ]
    }

    pub fn is_multivariate(&self) -> bool {
        self.channels.len() > 1
    }

    /// `<group>_multi` for multivariate groups, `<channel>_uni` otherwise.
    pub fn source_tag(&self) -> String {
        match self.channels.as_slice() {
            [channel] => format!("{channel}_uni"),
            _ => format!("{}_multi", self.name),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClusterConfig {
    pub groups: Vec<ClusterGroup>,
    pub min_samples: usize,
    /// Non-overlapping sub-window length; `None` clusters the whole window at once.
    pub window: Option<Duration>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            groups: ClusterGroup::defaults(),
            min_samples: 30,
            window: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClusterOutcome {
    Anomalies(Vec<AnomalyRecord>),
    Clean,
    /// Clustering was skipped; no partition had `required` usable rows.
    InsufficientData { rows: usize, required: usize },
}

impl ClusterOutcome {
    pub fn records(&self) -> &[AnomalyRecord] {
        match self {
            Self::Anomalies(records) => records,
            _ => &[],
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GroupResult {
    pub group: String,
    pub outcome: Result<ClusterOutcome, DetectError>,
}

struct Row {
    timestamp: DateTime<Utc>,
    values: Vec<f64>,
}

/// Zero mean, unit (population) variance per column. Constant columns keep a
/// scale of 1 so they collapse to zero instead of dividing by zero.
pub(crate) fn standardize(rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let Some(width) = rows.first().map(Vec::len) else {
        return Vec::new();
    };
    let n = rows.len() as f64;
    let mut means = vec![0.0; width];
    for row in rows {
        for (mean, value) in means.iter_mut().zip(row) {
            *mean += value / n;
        }
    }
    let mut scales = vec![0.0; width];
    for row in rows {
        for ((scale, value), mean) in scales.iter_mut().zip(row).zip(&means) {
            *scale += (value - mean) * (value - mean) / n;
        }
    }
    for scale in &mut scales {
        *scale = scale.sqrt();
        if !(scale.is_finite() && *scale > f64::EPSILON) {
            *scale = 1.0;
        }
    }
    rows.iter()
        .map(|row| {
            row.iter()
                .zip(&means)
                .zip(&scales)
                .map(|((value, mean), scale)| (value - mean) / scale)
                .collect()
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct ClusterDetector {
    config: ClusterConfig,
}

impl ClusterDetector {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Runs every configured group against the window.
    pub fn detect(&self, window: &TimeSeriesWindow) -> Vec<GroupResult> {
        self.config
            .groups
            .iter()
            .map(|group| GroupResult {
                group: group.name.clone(),
                outcome: self.detect_group(window, group),
            })
            .collect()
    }

    pub fn detect_group(
        &self,
        window: &TimeSeriesWindow,
        group: &ClusterGroup,
    ) -> Result<ClusterOutcome, DetectError> {
        let missing: Vec<String> = group
            .channels
            .iter()
            .filter(|channel| !window.has_channel(channel))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(DetectError::MissingColumns(missing));
        }

        let rows: Vec<Row> = window
            .records()
            .iter()
            .filter_map(|record| {
                let values = group
                    .channels
                    .iter()
                    .map(|channel| record.value(channel).filter(|v| v.is_finite()))
                    .collect::<Option<Vec<f64>>>()?;
                Some(Row {
                    timestamp: record.timestamp,
                    values,
                })
            })
            .collect();

        let required = self.config.min_samples;
        let mut clustered_any = false;
        let mut anomalies = Vec::new();
        for partition in partition_rows(&rows, self.config.window) {
            if partition.len() < required {
                tracing::debug!(
                    group = %group.name,
                    rows = partition.len(),
                    required,
                    "skipping clustering for sparse partition"
                );
                continue;
            }
            clustered_any = true;
            anomalies.extend(self.cluster_partition(group, partition));
        }

        if !clustered_any {
            return Ok(ClusterOutcome::InsufficientData {
                rows: rows.len(),
                required,
            });
        }
        if anomalies.is_empty() {
            Ok(ClusterOutcome::Clean)
        } else {
            Ok(ClusterOutcome::Anomalies(anomalies))
        }
    }

    fn cluster_partition(&self, group: &ClusterGroup, rows: &[Row]) -> Vec<AnomalyRecord> {
        tracing::trace!(
            group = %group.name,
            multivariate = group.is_multivariate(),
            rows = rows.len(),
            "clustering partition"
        );
        let raw: Vec<Vec<f64>> = rows.iter().map(|row| row.values.clone()).collect();
        let labels = dbscan(
            &standardize(&raw),
            DbscanParams {
                epsilon: group.epsilon,
                min_samples: self.config.min_samples,
            },
        );
        let source = group.source_tag();
        rows.iter()
            .zip(labels)
            .filter(|(_, label)| label.is_none())
            .map(|(row, _)| {
                let values = group
                    .channels
                    .iter()
                    .cloned()
                    .zip(row.values.iter().copied())
                    .collect::<BTreeMap<_, _>>();
                AnomalyRecord::new(row.timestamp, Some(source.clone()), values)
            })
            .collect()
    }
}

/// Splits time-ordered rows into consecutive `[start, start + window)` spans
/// anchored at the first row. Every row lands in exactly one span.
fn partition_rows(rows: &[Row], window: Option<Duration>) -> Vec<&[Row]> {
    let span = window.and_then(|window| chrono::Duration::from_std(window).ok());
    let (Some(span), Some(first)) = (span, rows.first()) else {
        return if rows.is_empty() { Vec::new() } else { vec![rows] };
    };
    if span <= chrono::Duration::zero() {
        return vec![rows];
    }

    let mut partitions = Vec::new();
    let mut window_start = first.timestamp;
    let mut begin = 0;
    while begin < rows.len() {
        let window_end = window_start + span;
        let len = rows[begin..].partition_point(|row| row.timestamp < window_end);
        if len > 0 {
            partitions.push(&rows[begin..begin + len]);
            begin += len;
        }
        window_start = window_end;
    }
    partitions
}
