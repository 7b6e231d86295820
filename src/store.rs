mod influx;
mod line_protocol;
#[cfg(test)]
pub mod memory;

use crate::error::StoreError;
use crate::telemetry::{AnomalyRecord, ChannelSample};
use std::future::Future;
use std::time::Duration;

pub use influx::InfluxStore;

/// Read/write boundary of the time-series store.
///
/// Implementations must bound every call in time; a slow store surfaces as a
/// `StoreError`, never as a hung cycle.
pub trait TelemetryStore: Send + Sync {
    /// Samples of one channel from the trailing `lookback` interval, ascending by time.
    fn query_channel(
        &self,
        channel: &str,
        lookback: Duration,
    ) -> impl Future<Output = Result<Vec<ChannelSample>, StoreError>> + Send;

    /// Writes one point per record into `measurement`.
    fn write_records(
        &self,
        measurement: &str,
        records: &[AnomalyRecord],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
