use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForecastError {
    #[error("Insufficient data for vendor group '{vendor_group}': {occurrences} occurrence(s) in window")]
    InsufficientData {
        vendor_group: String,
        occurrences: usize,
    },

    #[error("Invalid date '{value}': {reason}")]
    InvalidDate { value: String, reason: String },

    #[error("Refusing to regenerate over locked record for '{vendor_group}' on {date}")]
    AmbiguousOverlap {
        vendor_group: String,
        date: NaiveDate,
    },

    #[error("Reconciliation already in progress for client '{client_id}', week of {week_start}")]
    ReconciliationConflict {
        client_id: String,
        week_start: NaiveDate,
    },

    #[error("Invalid reconciliation window: {start} is after {end}")]
    InvalidWeek { start: NaiveDate, end: NaiveDate },

    #[error("Recency weights are invalid: {0}")]
    InvalidRecencyWeights(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ForecastError>;
