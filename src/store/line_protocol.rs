use crate::telemetry::AnomalyRecord;
use std::fmt::Write;

fn escape_measurement(raw: &str) -> String {
    escape(raw, &[',', ' '])
}

fn escape_key(raw: &str) -> String {
    escape(raw, &[',', '=', ' '])
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch == '\\' || special.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Encodes one record as an InfluxDB line-protocol point.
///
/// Non-finite channel values are left out since the store rejects them; the
/// `anomaly=true` field is always present so the point is never field-less.
pub(super) fn encode_record(measurement: &str, record: &AnomalyRecord) -> String {
    let mut line = escape_measurement(measurement);
    if let Some(source) = record.source.as_deref().filter(|s| !s.is_empty()) {
        let _ = write!(line, ",source={}", escape_key(source));
    }
    line.push(' ');
    for (field, value) in &record.values {
        if !value.is_finite() {
            continue;
        }
        let _ = write!(line, "{}={},", escape_key(field), value);
    }
    let _ = write!(line, "anomaly={}", record.anomaly);
    if let Some(nanos) = record.timestamp.timestamp_nanos_opt() {
        let _ = write!(line, " {nanos}");
    }
    line
}

pub(super) fn encode_batch(measurement: &str, records: &[AnomalyRecord]) -> String {
    records
        .iter()
        .map(|record| encode_record(measurement, record))
        .collect::<Vec<_>>()
        .join("\n")
}
