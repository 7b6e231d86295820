use crate::telemetry::{
    TimeSeriesWindow, FORWARD_POWER, INCIDENT_POWER_REFERENCE, REFLECTION_COEFFICIENT_MAGNITUDE,
};
use chrono::{DateTime, Utc};
use std::str::FromStr;

pub const ADAPTATION_FILTERED: &str = "Adaptation_filtered";
pub const NOISE_FORWARD_FILTERED: &str = "NoiseForward_filtered";

/// How reflected power is derived from the reflection coefficient magnitude.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReflectedPowerMode {
    /// `|Γ|² · P_inc`
    #[default]
    Power,
    /// `|Γ| · P_inc`
    Amplitude,
}

impl FromStr for ReflectedPowerMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "power" | "squared" => Ok(Self::Power),
            "amplitude" | "linear" => Ok(Self::Amplitude),
            other => Err(format!("unknown reflected power mode `{other}` (expected power|amplitude)")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NoiseSign {
    IncidentMinusForward,
    /// A forward-power step reads as a positive noise peak.
    #[default]
    ForwardMinusIncident,
}

impl FromStr for NoiseSign {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "incident-minus-forward" => Ok(Self::IncidentMinusForward),
            "forward-minus-incident" => Ok(Self::ForwardMinusIncident),
            other => Err(format!(
                "unknown noise sign `{other}` (expected incident-minus-forward|forward-minus-incident)"
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConditionerConfig {
    pub adaptation_alpha: f64,
    pub noise_alpha: f64,
    pub reflected_power: ReflectedPowerMode,
    pub noise_sign: NoiseSign,
}

impl Default for ConditionerConfig {
    fn default() -> Self {
        Self {
            adaptation_alpha: 0.001,
            noise_alpha: 0.02,
            reflected_power: ReflectedPowerMode::Power,
            noise_sign: NoiseSign::ForwardMinusIncident,
        }
    }
}

/// Last smoothed value of each derived signal, carried between poll cycles.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FilterState {
    pub adaptation: Option<f64>,
    pub noise: Option<f64>,
}

impl FilterState {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_cold(&self) -> bool {
        self.adaptation.is_none() && self.noise.is_none()
    }
}

/// Exponential smoothing `y[i] = α·x[i] + (1-α)·y[i-1]`.
///
/// With no seed the first defined sample seeds the filter. Undefined samples
/// leave the filter untouched and repeat the previous output.
pub fn ewma(raw: &[f64], alpha: f64, seed: Option<f64>) -> Vec<f64> {
    let mut last = seed.filter(|value| value.is_finite());
    raw.iter()
        .map(|&x| {
            if x.is_finite() {
                last = Some(match last {
                    Some(prev) => alpha * x + (1.0 - alpha) * prev,
                    None => x,
                });
            }
            last.unwrap_or(f64::NAN)
        })
        .collect()
}

/// Derived and smoothed signals for one window.
#[derive(Clone, Debug, PartialEq)]
pub struct ConditionedWindow {
    pub timestamps: Vec<DateTime<Utc>>,
    pub adaptation: Vec<f64>,
    pub noise: Vec<f64>,
    pub adaptation_filtered: Vec<f64>,
    pub noise_filtered: Vec<f64>,
}

impl ConditionedWindow {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct SignalConditioner {
    config: ConditionerConfig,
}

impl SignalConditioner {
    pub fn new(config: ConditionerConfig) -> Self {
        Self { config }
    }

    /// `Adaptation = ForwardPower - ReflectedPower`, undefined when a source channel is missing.
    pub fn adaptation(&self, window: &TimeSeriesWindow) -> Vec<f64> {
        let (Some(forward), Some(gamma), Some(incident)) = (
            window.column(FORWARD_POWER),
            window.column(REFLECTION_COEFFICIENT_MAGNITUDE),
            window.column(INCIDENT_POWER_REFERENCE),
        ) else {
            tracing::warn!("adaptation source channels missing; signal undefined");
            return vec![f64::NAN; window.len()];
        };
        forward
            .iter()
            .zip(gamma.iter())
            .zip(incident.iter())
            .map(|((fwd, gamma), inc)| {
                let reflected = match self.config.reflected_power {
                    ReflectedPowerMode::Power => gamma * gamma * inc,
                    ReflectedPowerMode::Amplitude => gamma * inc,
                };
                fwd - reflected
            })
            .collect()
    }

    pub fn noise_forward(&self, window: &TimeSeriesWindow) -> Vec<f64> {
        let (Some(forward), Some(incident)) = (
            window.column(FORWARD_POWER),
            window.column(INCIDENT_POWER_REFERENCE),
        ) else {
            tracing::warn!("forward-noise source channels missing; signal undefined");
            return vec![f64::NAN; window.len()];
        };
        forward
            .iter()
            .zip(incident.iter())
            .map(|(fwd, inc)| match self.config.noise_sign {
                NoiseSign::IncidentMinusForward => inc - fwd,
                NoiseSign::ForwardMinusIncident => fwd - inc,
            })
            .collect()
    }

    /// Derives both signals, smooths them seeded from `state`, and replaces
    /// `state` with the final smoothed values of this window. A signal with
    /// no defined sample in the window drops its seed, so smoothing restarts
    /// cold once its sources report again.
    pub fn condition(&self, window: &TimeSeriesWindow, state: &mut FilterState) -> ConditionedWindow {
        if window.is_empty() {
            state.clear();
            return ConditionedWindow {
                timestamps: Vec::new(),
                adaptation: Vec::new(),
                noise: Vec::new(),
                adaptation_filtered: Vec::new(),
                noise_filtered: Vec::new(),
            };
        }

        let adaptation = self.adaptation(window);
        let noise = self.noise_forward(window);
        let adaptation_filtered = ewma(
            &adaptation,
            self.config.adaptation_alpha,
            live_seed(&adaptation, state.adaptation),
        );
        let noise_filtered = ewma(&noise, self.config.noise_alpha, live_seed(&noise, state.noise));

        state.adaptation = adaptation_filtered.last().copied().filter(|v| v.is_finite());
        state.noise = noise_filtered.last().copied().filter(|v| v.is_finite());

        ConditionedWindow {
            timestamps: window.timestamps(),
            adaptation,
            noise,
            adaptation_filtered,
            noise_filtered,
        }
    }
}

fn live_seed(raw: &[f64], seed: Option<f64>) -> Option<f64> {
    if raw.iter().any(|v| v.is_finite()) {
        seed
    } else {
        if seed.is_some() {
            tracing::debug!("derived signal undefined for a whole window; dropping filter seed");
        }
        None
    }
}
