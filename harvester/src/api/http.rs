//! HTTP implementation of the monitoring API port.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{DiskPartition, MeasurementBatch, MonitoringApi, ProcessDescriptor};
use crate::error::{HarvestError, Result};

/// Envelope for list endpoints.
#[derive(Debug, Deserialize)]
struct Paginated<T> {
    results: Vec<T>,
}

/// Envelope for measurement endpoints.
#[derive(Debug, Deserialize)]
struct MeasurementsEnvelope {
    measurements: Vec<MeasurementBatch>,
}

/// `reqwest`-backed monitoring API client.
pub struct HttpMonitoringApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpMonitoringApi {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        if base_url.is_empty() {
            return Err(HarvestError::Configuration(
                "monitoring API base URL must not be empty".to_string(),
            ));
        }
        if token.is_empty() {
            return Err(HarvestError::Configuration(
                "monitoring API token must not be empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| HarvestError::Configuration(format!("http client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HarvestError::Fetch(format!("GET {url} returned {status}")));
        }
        Ok(response.json::<T>().await?)
    }

    fn measurement_query(
        metrics: &[String],
        granularity: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("granularity", granularity.to_string()),
            ("start", start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("end", end.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ];
        query.extend(metrics.iter().map(|m| ("m", m.clone())));
        query
    }
}

#[async_trait::async_trait]
impl MonitoringApi for HttpMonitoringApi {
    async fn list_processes(&self, project_id: &str) -> Result<Vec<ProcessDescriptor>> {
        let page: Paginated<ProcessDescriptor> = self
            .get_json(&format!("/groups/{project_id}/processes"), &[])
            .await?;
        Ok(page.results)
    }

    async fn list_disk_partitions(
        &self,
        project_id: &str,
        host: &str,
        port: u16,
    ) -> Result<Vec<DiskPartition>> {
        let page: Paginated<DiskPartition> = self
            .get_json(
                &format!("/groups/{project_id}/processes/{host}:{port}/disks"),
                &[],
            )
            .await?;
        Ok(page.results)
    }

    async fn get_measurements(
        &self,
        project_id: &str,
        host: &str,
        port: u16,
        metrics: &[String],
        granularity: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MeasurementBatch>> {
        let query = Self::measurement_query(metrics, granularity, start, end);
        let envelope: MeasurementsEnvelope = self
            .get_json(
                &format!("/groups/{project_id}/processes/{host}:{port}/measurements"),
                &query,
            )
            .await?;
        Ok(envelope.measurements)
    }

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
    ) -> Result<Vec<MeasurementBatch>> {
        let query = Self::measurement_query(metrics, granularity, start, end);
        let envelope: MeasurementsEnvelope = self
            .get_json(
                &format!(
                    "/groups/{project_id}/processes/{host}:{port}/disks/{partition}/measurements"
                ),
                &query,
            )
            .await?;
        Ok(envelope.measurements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rejects_empty_credentials() {
        assert!(HttpMonitoringApi::new("", "token").is_err());
        assert!(HttpMonitoringApi::new("https://api.example.com", "").is_err());
    }

    #[test]
    fn trims_trailing_slash_from_base_url() {
        let api = HttpMonitoringApi::new("https://api.example.com/v1/", "t").unwrap();
        assert_eq!(api.base_url, "https://api.example.com/v1");
    }

    #[test]
    fn measurement_query_repeats_metric_parameter() {
        let start = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 8, 1, 1, 0, 0).unwrap();
        let metrics = vec!["CONNECTIONS".to_string(), "MEMORY_RESIDENT".to_string()];
        let query = HttpMonitoringApi::measurement_query(&metrics, "PT1M", start, end);
        assert_eq!(query[0], ("granularity", "PT1M".to_string()));
        assert_eq!(query[1].1, "2026-08-01T00:00:00Z");
        assert_eq!(
            query.iter().filter(|(k, _)| *k == "m").count(),
            metrics.len()
        );
    }
}
