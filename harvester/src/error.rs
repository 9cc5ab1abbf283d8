//! Error taxonomy for the harvesting pipeline.
//!
//! Errors are caught and logged at the smallest unit boundary (one point,
//! one host, one partition, one duplicate group) so a single bad unit never
//! aborts a run. Only configuration errors propagate before any work begins.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarvestError {
    /// Missing or contradictory configuration. Fails the run fast, before
    /// any fetch or write happens.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A data point that could not be parsed. Callers skip the point and
    /// continue with the rest of the batch.
    #[error("unparseable data point: {0}")]
    Parse(String),

    /// A monitoring API request failed. Aborts the current host/partition
    /// unit only.
    #[error("monitoring API request failed: {0}")]
    Fetch(String),

    /// A store read or write failed.
    #[error("storage operation failed: {0}")]
    Storage(#[from] rusqlite::Error),

    /// An interactive caller aborted the operation.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for HarvestError {
    fn from(err: reqwest::Error) -> Self {
        HarvestError::Fetch(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;
