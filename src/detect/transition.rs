use super::peaks::prominent_peaks;
use super::slope::least_squares_slope;
use crate::conditioner::{ConditionedWindow, ADAPTATION_FILTERED, NOISE_FORWARD_FILTERED};
use crate::error::DetectError;
use crate::telemetry::{seconds_since_epoch, AnomalyRecord};
use std::collections::BTreeMap;
use std::str::FromStr;

/// How the noise-peak and adaptation-jump flags combine into a transition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Combinator {
    /// Both conditions on the same row.
    #[default]
    And,
    /// Either condition; the sensitive mode.
    Or,
}

impl FromStr for Combinator {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "and" => Ok(Self::And),
            "or" => Ok(Self::Or),
            other => Err(format!("unknown combinator `{other}` (expected and|or)")),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransitionConfig {
    pub prominence: f64,
    pub slope_threshold: f64,
    /// Sliding sub-window length in rows; `None` fits one line over the whole window.
    pub slope_window_rows: Option<usize>,
    pub combinator: Combinator,
    pub trailing_peak: bool,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            prominence: 0.5,
            slope_threshold: 0.05,
            slope_window_rows: None,
            combinator: Combinator::And,
            trailing_peak: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransitionOutcome {
    Detected(Vec<AnomalyRecord>),
    NoTransition,
}

impl TransitionOutcome {
    pub fn records(&self) -> &[AnomalyRecord] {
        match self {
            Self::Detected(records) => records,
            Self::NoTransition => &[],
        }
    }
}

/// Per-row flags over the rows where both filtered signals are defined.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RowFlags {
    /// Positions of the usable rows within the conditioned window.
    pub rows: Vec<usize>,
    pub noise_peak: Vec<bool>,
    pub adaptation_jump: Vec<bool>,
}

impl RowFlags {
    fn new(rows: Vec<usize>) -> Self {
        let len = rows.len();
        Self {
            rows,
            noise_peak: vec![false; len],
            adaptation_jump: vec![false; len],
        }
    }

    pub fn jump_count(&self) -> usize {
        self.adaptation_jump.iter().filter(|flag| **flag).count()
    }

    fn triggered(&self, combinator: Combinator) -> impl Iterator<Item = usize> + '_ {
        self.noise_peak
            .iter()
            .zip(&self.adaptation_jump)
            .enumerate()
            .filter(move |(_, (peak, jump))| match combinator {
                Combinator::And => **peak && **jump,
                Combinator::Or => **peak || **jump,
            })
            .map(|(idx, _)| self.rows[idx])
    }
}

#[derive(Clone, Debug)]
pub struct TransitionDetector {
    config: TransitionConfig,
}

impl TransitionDetector {
    pub fn new(config: TransitionConfig) -> Self {
        Self { config }
    }

    /// Computes noise-peak and adaptation-jump flags for every usable row.
    pub fn flags(&self, window: &ConditionedWindow) -> Result<RowFlags, DetectError> {
        let mut missing = Vec::new();
        if !window.is_empty() && window.adaptation_filtered.iter().all(|v| !v.is_finite()) {
            missing.push(ADAPTATION_FILTERED.to_string());
        }
        if !window.is_empty() && window.noise_filtered.iter().all(|v| !v.is_finite()) {
            missing.push(NOISE_FORWARD_FILTERED.to_string());
        }
        if !missing.is_empty() {
            return Err(DetectError::MissingColumns(missing));
        }

        let rows: Vec<usize> = (0..window.len())
            .filter(|&i| {
                window.adaptation_filtered[i].is_finite() && window.noise_filtered[i].is_finite()
            })
            .collect();
        let mut flags = RowFlags::new(rows);
        let n = flags.rows.len();
        if n < 2 {
            return Ok(flags);
        }

        let origin = seconds_since_epoch(window.timestamps[flags.rows[0]]);
        let seconds: Vec<f64> = flags
            .rows
            .iter()
            .map(|&i| seconds_since_epoch(window.timestamps[i]) - origin)
            .collect();
        let adaptation: Vec<f64> = flags.rows.iter().map(|&i| window.adaptation_filtered[i]).collect();
        let noise: Vec<f64> = flags.rows.iter().map(|&i| window.noise_filtered[i]).collect();

        let width = match self.config.slope_window_rows {
            Some(width) if width >= 2 && width < n => width,
            _ => n,
        };
        let sliding = width < n;
        for start in 0..=(n - width) {
            let end = start + width;
            let peaks = prominent_peaks(
                &noise[start..end],
                self.config.prominence,
                self.config.trailing_peak && end == n,
            );
            if peaks.is_empty() && self.config.combinator == Combinator::And {
                continue;
            }
            let steep = least_squares_slope(&seconds[start..end], &adaptation[start..end])
                .is_some_and(|slope| slope.abs() > self.config.slope_threshold);
            if steep {
                for flag in &mut flags.adaptation_jump[start..end] {
                    *flag = true;
                }
            }
            // A sub-window only vouches for its peaks when its own slope is steep.
            if steep || !sliding {
                for peak in &peaks {
                    flags.noise_peak[start + peak] = true;
                }
            }
        }
        Ok(flags)
    }

    pub fn detect(&self, window: &ConditionedWindow) -> Result<TransitionOutcome, DetectError> {
        let flags = self.flags(window)?;
        tracing::trace!(
            rows = flags.rows.len(),
            peaks = flags.noise_peak.iter().filter(|peak| **peak).count(),
            jumps = flags.jump_count(),
            "transition flags"
        );
        let records: Vec<AnomalyRecord> = flags
            .triggered(self.config.combinator)
            .map(|i| {
                AnomalyRecord::new(
                    window.timestamps[i],
                    None,
                    BTreeMap::from([
                        (ADAPTATION_FILTERED.to_string(), window.adaptation_filtered[i]),
                        (NOISE_FORWARD_FILTERED.to_string(), window.noise_filtered[i]),
                    ]),
                )
            })
            .collect();
        if records.is_empty() {
            Ok(TransitionOutcome::NoTransition)
        } else {
            Ok(TransitionOutcome::Detected(records))
        }
    }
}
