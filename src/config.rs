use crate::conditioner::{ConditionerConfig, NoiseSign, ReflectedPowerMode};
use crate::detect::cluster::{ClusterConfig, ClusterGroup};
use crate::detect::transition::{Combinator, TransitionConfig};
use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/anomaly-sidecar/config.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineMode {
    Transitions,
    Faults,
    Analyze,
}

impl PipelineMode {
    fn default_poll_period_secs(self) -> u64 {
        match self {
            Self::Transitions => 5,
            Self::Faults | Self::Analyze => 15,
        }
    }

    fn default_lookback_secs(self) -> u64 {
        match self {
            Self::Transitions => 50,
            Self::Faults | Self::Analyze => 800,
        }
    }

    fn default_align_tolerance_ms(self) -> Option<u64> {
        match self {
            Self::Transitions => Some(1000),
            Self::Faults | Self::Analyze => None,
        }
    }
}

fn setup_config_path(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    match lookup("ANOMALY_SETUP_CONFIG_PATH") {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(DEFAULT_SETUP_CONFIG_PATH),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetupConfigOverrides {
    #[serde(default)]
    store_url: Option<String>,
    #[serde(default)]
    store_org: Option<String>,
    #[serde(default)]
    store_bucket: Option<String>,
    #[serde(default)]
    store_measurement: Option<String>,
    #[serde(default)]
    min_samples: Option<usize>,
    #[serde(default)]
    cluster_window_secs: Option<u64>,
    #[serde(default)]
    cluster_groups: Option<Vec<ClusterGroupOverride>>,
    #[serde(default)]
    adaptation_alpha: Option<f64>,
    #[serde(default)]
    noise_alpha: Option<f64>,
    #[serde(default)]
    peak_prominence: Option<f64>,
    #[serde(default)]
    slope_threshold: Option<f64>,
    #[serde(default)]
    slope_window_rows: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClusterGroupOverride {
    name: String,
    channels: Vec<String>,
    epsilon: f64,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "anomaly-sidecar failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    parse_setup_config(contents, path)
}

fn parse_setup_config(contents: String, path: &Path) -> Option<SetupConfigOverrides> {
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "anomaly-sidecar failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub url: String,
    pub token: Option<String>,
    pub org: Option<String>,
    pub bucket: String,
    pub measurement: String,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mode: PipelineMode,
    pub store: Option<StoreConfig>,
    pub poll_period: Duration,
    pub idle_backoff: Duration,
    pub lookback: Duration,
    pub align_tolerance: Option<Duration>,
    pub conditioner: ConditionerConfig,
    pub transition: TransitionConfig,
    pub cluster: ClusterConfig,
    pub transition_measurement: String,
    pub fault_measurement: String,
    pub transitions_with_faults: bool,
    pub cluster_resets_filter: bool,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env(mode: PipelineMode) -> Result<Self> {
        dotenv().ok();
        let lookup = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let overrides = load_setup_config_overrides(&setup_config_path(&lookup));
        Self::from_lookup(mode, lookup, overrides)
    }

    pub fn from_lookup(
        mode: PipelineMode,
        lookup: impl Fn(&str) -> Option<String>,
        overrides: Option<SetupConfigOverrides>,
    ) -> Result<Self> {
        let overrides = overrides.unwrap_or_default();
        let parse_u64 = |key: &str| lookup(key).and_then(|v| v.parse::<u64>().ok());
        let parse_f64 = |key: &str| lookup(key).and_then(|v| v.parse::<f64>().ok());
        let parse_usize = |key: &str| lookup(key).and_then(|v| v.parse::<usize>().ok());
        let parse_bool = |key: &str| {
            lookup(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        };

        let store = {
            let url = lookup("ANOMALY_STORE_URL")
                .or_else(|| lookup("INFLUX_URL"))
                .or(overrides.store_url.clone());
            let bucket = lookup("ANOMALY_STORE_BUCKET")
                .or_else(|| lookup("BUCKET"))
                .or(overrides.store_bucket.clone());
            match (url, bucket) {
                (Some(url), Some(bucket)) => Some(StoreConfig {
                    url,
                    token: lookup("ANOMALY_STORE_TOKEN").or_else(|| lookup("INFLUX_TOKEN")),
                    org: lookup("ANOMALY_STORE_ORG")
                        .or_else(|| lookup("ORGANIZATION"))
                        .or(overrides.store_org.clone()),
                    bucket,
                    measurement: lookup("ANOMALY_STORE_MEASUREMENT")
                        .or(overrides.store_measurement.clone())
                        .unwrap_or_else(|| "mqtt_consumer".to_string()),
                    timeout: Duration::from_millis(
                        parse_u64("ANOMALY_STORE_TIMEOUT_MS").unwrap_or(5000),
                    ),
                }),
                _ if mode == PipelineMode::Analyze => None,
                _ => bail!(
                    "ANOMALY_STORE_URL (or INFLUX_URL) and ANOMALY_STORE_BUCKET (or BUCKET) are required"
                ),
            }
        };

        let poll_period_secs =
            parse_u64("ANOMALY_POLL_PERIOD_SECS").unwrap_or(mode.default_poll_period_secs());
        let poll_period = Duration::from_secs(poll_period_secs);
        let idle_backoff = parse_u64("ANOMALY_IDLE_BACKOFF_SECS")
            .map(Duration::from_secs)
            .unwrap_or(poll_period / 2);
        let lookback = Duration::from_secs(
            parse_u64("ANOMALY_LOOKBACK_SECS").unwrap_or(mode.default_lookback_secs()),
        );
        let align_tolerance = parse_u64("ANOMALY_ALIGN_TOLERANCE_MS")
            .or(mode.default_align_tolerance_ms())
            .filter(|ms| *ms != 0)
            .map(Duration::from_millis);

        let conditioner = ConditionerConfig {
            adaptation_alpha: parse_f64("ANOMALY_ADAPTATION_ALPHA")
                .or(overrides.adaptation_alpha)
                .unwrap_or(0.001),
            noise_alpha: parse_f64("ANOMALY_NOISE_ALPHA")
                .or(overrides.noise_alpha)
                .unwrap_or(0.02),
            reflected_power: parse_policy::<ReflectedPowerMode>(&lookup, "ANOMALY_REFLECTED_POWER")?
                .unwrap_or_default(),
            noise_sign: parse_policy::<NoiseSign>(&lookup, "ANOMALY_NOISE_SIGN")?.unwrap_or_default(),
        };

        let transition = TransitionConfig {
            prominence: parse_f64("ANOMALY_PEAK_PROMINENCE")
                .or(overrides.peak_prominence)
                .unwrap_or(0.5),
            slope_threshold: parse_f64("ANOMALY_SLOPE_THRESHOLD")
                .or(overrides.slope_threshold)
                .unwrap_or(0.05),
            slope_window_rows: parse_usize("ANOMALY_SLOPE_WINDOW_ROWS")
                .or(overrides.slope_window_rows)
                .filter(|rows| *rows != 0),
            combinator: parse_policy::<Combinator>(&lookup, "ANOMALY_COMBINATOR")?.unwrap_or_default(),
            trailing_peak: parse_bool("ANOMALY_TRAILING_PEAK").unwrap_or(true),
        };

        let groups = match overrides.cluster_groups.clone() {
            Some(groups) => groups
                .into_iter()
                .map(|group| ClusterGroup::new(group.name, group.channels, group.epsilon))
                .collect(),
            None => ClusterGroup::defaults(),
        };
        let cluster = ClusterConfig {
            groups,
            min_samples: parse_usize("ANOMALY_MIN_SAMPLES")
                .or(overrides.min_samples)
                .unwrap_or(30),
            window: parse_u64("ANOMALY_CLUSTER_WINDOW_SECS")
                .or(overrides.cluster_window_secs)
                .filter(|secs| *secs != 0)
                .map(Duration::from_secs),
        };

        let config = Self {
            mode,
            store,
            poll_period,
            idle_backoff,
            lookback,
            align_tolerance,
            conditioner,
            transition,
            cluster,
            transition_measurement: lookup("ANOMALY_TRANSITION_MEASUREMENT")
                .unwrap_or_else(|| "transitions".to_string()),
            fault_measurement: lookup("ANOMALY_FAULT_MEASUREMENT")
                .unwrap_or_else(|| "anomalies".to_string()),
            transitions_with_faults: parse_bool("ANOMALY_TRANSITIONS_WITH_FAULTS").unwrap_or(false),
            cluster_resets_filter: parse_bool("ANOMALY_CLUSTER_RESETS_FILTER").unwrap_or(false),
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, alpha) in [
            ("adaptation", self.conditioner.adaptation_alpha),
            ("noise", self.conditioner.noise_alpha),
        ] {
            if !(alpha > 0.0 && alpha <= 1.0) {
                bail!("{name} smoothing alpha must be in (0, 1], got {alpha}");
            }
        }
        if self.poll_period.is_zero() {
            bail!("poll period must be greater than zero");
        }
        if self.lookback.is_zero() {
            bail!("look-back window must be greater than zero");
        }
        if self.cluster.min_samples == 0 {
            bail!("cluster min_samples must be at least 1");
        }
        for group in &self.cluster.groups {
            if group.channels.is_empty() {
                bail!("cluster group {} has no channels", group.name);
            }
            if !(group.epsilon.is_finite() && group.epsilon > 0.0) {
                bail!("cluster group {} epsilon must be positive", group.name);
            }
        }
        if !(self.transition.prominence.is_finite() && self.transition.prominence >= 0.0) {
            bail!("peak prominence must be a non-negative number");
        }
        if !(self.transition.slope_threshold.is_finite() && self.transition.slope_threshold >= 0.0) {
            bail!("slope threshold must be a non-negative number");
        }
        if matches!(self.transition.slope_window_rows, Some(rows) if rows < 2) {
            bail!("slope window must span at least 2 rows");
        }
        Ok(())
    }

    pub fn require_store(&self) -> Result<&StoreConfig> {
        self.store
            .as_ref()
            .context("store connection settings are required for live pipelines")
    }

    /// Union of channels the configured pipeline needs, in first-seen order.
    pub fn fault_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = Vec::new();
        for group in &self.cluster.groups {
            for channel in &group.channels {
                if !channels.contains(channel) {
                    channels.push(channel.clone());
                }
            }
        }
        channels
    }
}

fn parse_policy<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr<Err = String>,
{
    match lookup(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("invalid {key}")),
        None => Ok(None),
    }
}
