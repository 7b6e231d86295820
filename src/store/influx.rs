use super::line_protocol::encode_batch;
use super::TelemetryStore;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::telemetry::{parse_timestamp, parse_value, AnomalyRecord, ChannelSample};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder};
use std::time::Duration;

/// InfluxDB v2 HTTP client: Flux reads, line-protocol writes.
#[derive(Clone)]
pub struct InfluxStore {
    client: Client,
    config: StoreConfig,
}

impl InfluxStore {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.config.token.as_deref() {
            Some(token) => request.header(AUTHORIZATION, format!("Token {token}")),
            None => request,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    /// Timeouts and refused connections mean the store is unreachable rather
    /// than a malformed request.
    fn transport_error(&self, err: reqwest::Error) -> StoreError {
        if err.is_timeout() || err.is_connect() {
            StoreError::Unavailable(format!("{}: {err}", self.config.url))
        } else {
            StoreError::Http(err)
        }
    }

    fn org_query(&self) -> Vec<(&'static str, String)> {
        self.config
            .org
            .iter()
            .map(|org| ("org", org.clone()))
            .collect()
    }
}

impl TelemetryStore for InfluxStore {
    async fn query_channel(
        &self,
        channel: &str,
        lookback: Duration,
    ) -> Result<Vec<ChannelSample>, StoreError> {
        let flux = flux_channel_query(&self.config.bucket, &self.config.measurement, channel, lookback);
        let request = self
            .client
            .post(self.endpoint("/api/v2/query"))
            .query(&self.org_query())
            .header(ACCEPT, "application/csv")
            .header(CONTENT_TYPE, "application/vnd.flux")
            .body(flux);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| self.transport_error(err))?;
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let samples = parse_annotated_csv(channel, &body)?;
        tracing::trace!(channel, rows = samples.len(), "queried channel");
        Ok(samples)
    }

    async fn write_records(
        &self,
        measurement: &str,
        records: &[AnomalyRecord],
    ) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut params = self.org_query();
        params.push(("bucket", self.config.bucket.clone()));
        params.push(("precision", "ns".to_string()));
        let request = self
            .client
            .post(self.endpoint("/api/v2/write"))
            .query(&params)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(encode_batch(measurement, records));
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

fn flux_string(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

pub(crate) fn flux_channel_query(
    bucket: &str,
    measurement: &str,
    channel: &str,
    lookback: Duration,
) -> String {
    format!(
        r#"from(bucket: "{bucket}")
    |> range(start: -{secs}s)
    |> filter(fn: (r) => r["_measurement"] == "{measurement}")
    |> filter(fn: (r) => r["_field"] == "{channel}")
    |> sort(columns: ["_time"])"#,
        bucket = flux_string(bucket),
        secs = lookback.as_secs().max(1),
        measurement = flux_string(measurement),
        channel = flux_string(channel),
    )
}

/// Concatenates every table of a Flux CSV response into one sample list.
///
/// Each table repeats its header row, so column positions are re-resolved
/// whenever a row naming both `_time` and `_value` shows up. Rows whose time or
/// value does not parse are dropped.
pub(crate) fn parse_annotated_csv(channel: &str, body: &str) -> Result<Vec<ChannelSample>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .from_reader(body.as_bytes());

    let mut columns: Option<(usize, usize)> = None;
    let mut samples = Vec::new();
    for row in reader.records() {
        let row = row?;
        let time_idx = row.iter().position(|cell| cell == "_time");
        let value_idx = row.iter().position(|cell| cell == "_value");
        if let (Some(time_idx), Some(value_idx)) = (time_idx, value_idx) {
            columns = Some((time_idx, value_idx));
            continue;
        }
        if row.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        let Some((time_idx, value_idx)) = columns else {
            continue;
        };
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
