use thiserror::Error;

/// Time-series store failures. All of them are scoped to one cycle.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("store response was not valid annotated CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("store is unavailable: {0}")]
    Unavailable(String),
}

/// Detector preconditions that were not met for the current window.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectError {
    #[error("required columns missing: {0:?}")]
    MissingColumns(Vec<String>),
}
