//! Collector configuration.
//!
//! The struct is serde-derived so callers that own a configuration file can
//! deserialize straight into it; this crate never loads files itself.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};

/// Metrics harvested when the caller does not name any.
pub const DEFAULT_METRICS: &[&str] = &[
    "CONNECTIONS",
    "SYSTEM_NORMALIZED_CPU_USER",
    "MEMORY_RESIDENT",
    "OPCOUNTER_QUERY",
    "DISK_PARTITION_SPACE_USED_PERCENT",
    "DISK_PARTITION_IOPS_TOTAL",
];

/// Prefix marking metrics that are sampled per disk partition rather than
/// per process.
const DISK_METRIC_PREFIX: &str = "DISK_";

/// A project to harvest, as known to the monitoring API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Projects to enumerate processes for.
    pub projects: Vec<ProjectRef>,
    /// Metric names to request; `DISK_`-prefixed names are fetched per
    /// partition, everything else per process.
    pub metrics: Vec<String>,
    /// Lookback window when a series has no prior data.
    pub period_hours: i64,
    /// Sampling resolution requested from the monitoring API (ISO-8601
    /// duration, e.g. `PT1M`).
    pub granularity: String,
    /// Overlap subtracted from the last stored timestamp so boundary samples
    /// are never missed; the ingestion window rejects the re-fetched ones.
    pub overlap_minutes: i64,
    /// Ingest points without computing in-memory aggregate statistics.
    pub collect_only: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            projects: Vec::new(),
            metrics: DEFAULT_METRICS.iter().map(|m| m.to_string()).collect(),
            period_hours: 8,
            granularity: "PT1M".to_string(),
            overlap_minutes: 5,
            collect_only: false,
        }
    }
}

impl HarvestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.projects.is_empty() {
            return Err(HarvestError::Configuration(
                "at least one project must be configured".to_string(),
            ));
        }
        if let Some(p) = self.projects.iter().find(|p| p.id.is_empty() || p.name.is_empty()) {
            return Err(HarvestError::Configuration(format!(
                "project entries need both id and name (got id={:?}, name={:?})",
                p.id, p.name
            )));
        }
        if self.metrics.is_empty() {
            return Err(HarvestError::Configuration(
                "at least one metric must be configured".to_string(),
            ));
        }
        if self.period_hours <= 0 {
            return Err(HarvestError::Configuration(format!(
                "period_hours must be positive (got {})",
                self.period_hours
            )));
        }
        if self.overlap_minutes < 0 {
            return Err(HarvestError::Configuration(format!(
                "overlap_minutes must not be negative (got {})",
                self.overlap_minutes
            )));
        }
        if self.granularity.is_empty() {
            return Err(HarvestError::Configuration(
                "granularity must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Metrics sampled per process.
    pub fn system_metrics(&self) -> Vec<String> {
        self.metrics
            .iter()
            .filter(|m| !m.starts_with(DISK_METRIC_PREFIX))
            .cloned()
            .collect()
    }

    /// Metrics sampled per disk partition.
    pub fn disk_metrics(&self) -> Vec<String> {
        self.metrics
            .iter()
            .filter(|m| m.starts_with(DISK_METRIC_PREFIX))
            .cloned()
            .collect()
    }

    pub fn period(&self) -> Duration {
        Duration::hours(self.period_hours)
    }

    pub fn overlap(&self) -> Duration {
        Duration::minutes(self.overlap_minutes)
    }
}
