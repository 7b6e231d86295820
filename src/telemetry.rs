use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

pub const FORWARD_POWER: &str = "ForwardPower";
pub const REFLECTION_COEFFICIENT_MAGNITUDE: &str = "ReflectionCoefficientMagnitude";
pub const INCIDENT_POWER_REFERENCE: &str = "IncidentPowerReference";

/// Raw channels the transition pipeline derives its signals from.
pub const RF_CHANNELS: [&str; 3] = [
    FORWARD_POWER,
    REFLECTION_COEFFICIENT_MAGNITUDE,
    INCIDENT_POWER_REFERENCE,
];

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSample {
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub value: f64,
}

/// One aligned row. Channels that had no match within tolerance hold `NaN`.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedRecord {
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

impl AlignedRecord {
    pub fn value(&self, channel: &str) -> Option<f64> {
        self.values.get(channel).copied()
    }
}

/// Rows of one look-back interval, ascending by timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeriesWindow {
    channels: Vec<String>,
    records: Vec<AlignedRecord>,
}

impl TimeSeriesWindow {
    pub fn new(channels: Vec<String>, records: Vec<AlignedRecord>) -> Self {
        Self { channels, records }
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn records(&self) -> &[AlignedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.iter().any(|name| name == channel)
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.records.iter().map(|record| record.timestamp).collect()
    }

    /// Column view of a channel; `None` when the channel never made it into the window.
    pub fn column(&self, channel: &str) -> Option<Vec<f64>> {
        if !self.has_channel(channel) {
            return None;
        }
        Some(
            self.records
                .iter()
                .map(|record| record.value(channel).unwrap_or(f64::NAN))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub values: BTreeMap<String, f64>,
    pub anomaly: bool,
}

impl AnomalyRecord {
    pub fn new(timestamp: DateTime<Utc>, source: Option<String>, values: BTreeMap<String, f64>) -> Self {
        Self {
            timestamp,
            source,
            values,
            anomaly: true,
        }
    }
}

/// Accepts RFC 3339 as returned by the store and the `YYYY-MM-DD HH:MM:SS[.f][+HH:MM]`
/// layout used by exported recordings. Naive times are read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(ts.with_timezone(&Utc));
    }
    for layout in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, layout) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

pub fn parse_value(raw: &str) -> Option<f64> {
    let value = raw.trim().parse::<f64>().ok()?;
    value.is_finite().then_some(value)
}

pub fn seconds_since_epoch(ts: DateTime<Utc>) -> f64 {
    ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_nanos()) / 1e9
}

#[cfg(test)]
pub fn millis_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_store_and_recording_timestamps() {
        let rfc = parse_timestamp("2025-06-10T09:03:46.5Z").expect("rfc3339");
        assert_eq!(rfc.timestamp_millis(), 1_749_546_226_500);

        let pandas = parse_timestamp("2025-06-10 09:03:46.500000+00:00").expect("pandas tz");
        assert_eq!(pandas, rfc);

        let naive = parse_timestamp("2025-06-10 09:03:46.5").expect("naive");
        assert_eq!(naive, rfc);

        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn rejects_non_numeric_values() {
        assert_eq!(parse_value(" 12.5 "), Some(12.5));
        assert_eq!(parse_value("nan"), None);
        assert_eq!(parse_value("inf"), None);
        assert_eq!(parse_value("abc"), None);
    }

    #[test]
    fn column_is_absent_for_unknown_channel() {
        let record = AlignedRecord {
            timestamp: millis_to_dt(0),
            values: BTreeMap::from([(FORWARD_POWER.to_string(), 1.0)]),
        };
        let window = TimeSeriesWindow::new(vec![FORWARD_POWER.to_string()], vec![record]);
        assert_eq!(window.column(FORWARD_POWER), Some(vec![1.0]));
        assert!(window.column(INCIDENT_POWER_REFERENCE).is_none());
    }
}
