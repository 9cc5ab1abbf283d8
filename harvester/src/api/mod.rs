//! Monitoring API port.
//!
//! The collector talks to the remote monitoring service exclusively through
//! the [`MonitoringApi`] trait so the HTTP client stays swappable (tests use
//! a scripted double). Wire shapes keep the service's camelCase field names;
//! everything else in the crate works with the parsed, typed forms.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};

pub use http::HttpMonitoringApi;

/// Process role as reported by the monitoring API.
///
/// Unrecognized roles deserialize to `Unknown` instead of failing the whole
/// process listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessType {
    #[serde(rename = "STANDALONE")]
    Standalone,
    #[serde(rename = "REPLICA_PRIMARY")]
    ReplicaPrimary,
    #[serde(rename = "REPLICA_SECONDARY")]
    ReplicaSecondary,
    #[serde(rename = "SHARD_PRIMARY")]
    ShardPrimary,
    #[serde(rename = "SHARD_SECONDARY")]
    ShardSecondary,
    #[serde(rename = "SHARD_MONGOS")]
    ShardMongos,
    #[serde(rename = "SHARD_CONFIG_PRIMARY")]
    ShardConfigPrimary,
    #[serde(rename = "SHARD_CONFIG_SECONDARY")]
    ShardConfigSecondary,
    #[serde(other)]
    Unknown,
}

impl ProcessType {
    /// Routers and config servers carry no meaningful host telemetry; the
    /// collector only harvests data-bearing nodes.
    pub fn is_data_bearing(&self) -> bool {
        !matches!(
            self,
            ProcessType::ShardMongos
                | ProcessType::ShardConfigPrimary
                | ProcessType::ShardConfigSecondary
        )
    }
}

/// One monitored process in a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDescriptor {
    pub id: String,
    pub hostname: String,
    pub port: u16,
    pub type_name: ProcessType,
}

impl ProcessDescriptor {
    /// `host:port` address, the host component of every series key.
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// One disk partition on a monitored host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskPartition {
    pub partition_name: String,
}

/// A data point as it arrives on the wire. The timestamp is an ISO-8601
/// string and the value may be null for samples the service could not take.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDataPoint {
    pub timestamp: String,
    pub value: Option<f64>,
}

impl RawDataPoint {
    /// Parse into the typed form. Null values and malformed timestamps are
    /// reported as [`HarvestError::Parse`] so callers can skip the point.
    pub fn parse(&self) -> Result<MetricDataPoint> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|err| {
                HarvestError::Parse(format!("bad timestamp {:?}: {err}", self.timestamp))
            })?
            .with_timezone(&Utc);
        let value = self
            .value
            .ok_or_else(|| HarvestError::Parse(format!("null value at {}", self.timestamp)))?;
        if !value.is_finite() {
            return Err(HarvestError::Parse(format!(
                "non-finite value {value} at {}",
                self.timestamp
            )));
        }
        Ok(MetricDataPoint { timestamp, value })
    }
}

/// A parsed data point. Ephemeral: produced by the API client, consumed once
/// by ingestion or aggregation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricDataPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// All data points returned for one metric over one fetch window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementBatch {
    pub metric_name: String,
    pub data_points: Vec<RawDataPoint>,
}

/// Read-only client for the remote monitoring service.
#[async_trait]
pub trait MonitoringApi: Send + Sync {
    async fn list_processes(&self, project_id: &str) -> Result<Vec<ProcessDescriptor>>;

    async fn list_disk_partitions(
        &self,
        project_id: &str,
        host: &str,
        port: u16,
    ) -> Result<Vec<DiskPartition>>;

    async fn get_measurements(
        &self,
        project_id: &str,
        host: &str,
        port: u16,
        metrics: &[String],
        granularity: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MeasurementBatch>>;

    async fn get_disk_measurements(
        &self,
        project_id: &str,
        host: &str,
        port: u16,
        partition: &str,
        metrics: &[String],
        granularity: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MeasurementBatch>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_points() {
        let raw = RawDataPoint {
            timestamp: "2026-08-01T12:00:00Z".to_string(),
            value: Some(42.5),
        };
        let point = raw.parse().unwrap();
        assert_eq!(point.value, 42.5);
        assert_eq!(point.timestamp.timestamp(), 1_785_585_600);
    }

    #[test]
    fn null_value_is_a_parse_error() {
        let raw = RawDataPoint {
            timestamp: "2026-08-01T12:00:00Z".to_string(),
            value: None,
        };
        assert!(matches!(raw.parse(), Err(HarvestError::Parse(_))));
    }

    #[test]
    fn bad_timestamp_is_a_parse_error() {
        let raw = RawDataPoint {
            timestamp: "yesterday-ish".to_string(),
            value: Some(1.0),
        };
        assert!(matches!(raw.parse(), Err(HarvestError::Parse(_))));
    }

    #[test]
    fn routers_and_config_servers_are_not_data_bearing() {
        assert!(ProcessType::ReplicaPrimary.is_data_bearing());
        assert!(ProcessType::Standalone.is_data_bearing());
        assert!(!ProcessType::ShardMongos.is_data_bearing());
        assert!(!ProcessType::ShardConfigPrimary.is_data_bearing());
        assert!(!ProcessType::ShardConfigSecondary.is_data_bearing());
    }

    #[test]
    fn unknown_process_types_deserialize() {
        let descriptor: ProcessDescriptor = serde_json::from_str(
            r#"{"id":"db0.example.net:27017","hostname":"db0.example.net","port":27017,"typeName":"SOMETHING_NEW"}"#,
        )
        .unwrap();
        assert_eq!(descriptor.type_name, ProcessType::Unknown);
        assert_eq!(descriptor.address(), "db0.example.net:27017");
    }
}
