//! Collection orchestration.
//!
//! One run walks projects, then processes, then metrics and disk partitions,
//! fetching only the window each series is missing: from the last stored
//! timestamp minus a small overlap up to now. Every fetch result is forwarded
//! to ingestion; in analyze mode the parsed values also feed the per-project
//! aggregates and the pattern classifier. A failure in one unit is logged and
//! counted, and the run moves on to the next unit.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::analyzer::{analyze_pattern, PatternResult, PatternType};
use crate::api::{MeasurementBatch, MonitoringApi, ProcessDescriptor};
use crate::config::{HarvestConfig, ProjectRef};
use crate::error::{HarvestError, Result};
use crate::ingest::MetricsStorage;
use crate::store::{MeasurementStore, SeriesFilter};

/// Aggregate counters for one collection run. Reported regardless of
/// partial failures so a "successful" run with dropped units is observable.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunStats {
    pub projects: usize,
    pub processes_scanned: usize,
    pub partitions_scanned: usize,
    pub points_collected: usize,
    pub points_stored: usize,
    pub units_failed: usize,
}

/// Running aggregate for one metric across a project.
#[derive(Debug, Clone, Serialize)]
pub struct MetricAggregate {
    pub max_value: f64,
    pub max_location: String,
    pub total: f64,
    pub count: usize,
    /// Pattern classification per location (host, or host plus partition).
    pub patterns: BTreeMap<String, PatternResult>,
}

impl MetricAggregate {
    fn new() -> Self {
        Self {
            max_value: f64::NEG_INFINITY,
            max_location: String::new(),
            total: 0.0,
            count: 0,
            patterns: BTreeMap::new(),
        }
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }

    /// Most frequent pattern across locations; ties resolve by pattern name
    /// so repeated runs agree.
    pub fn dominant_pattern(&self) -> Option<PatternType> {
        let mut counts: BTreeMap<&'static str, (usize, PatternType)> = BTreeMap::new();
        for result in self.patterns.values() {
            let entry = counts
                .entry(result.pattern.as_str())
                .or_insert((0, result.pattern));
            entry.0 += 1;
        }
        counts
            .into_values()
            .max_by_key(|(count, _)| *count)
            .map(|(_, pattern)| pattern)
    }

    fn absorb(&mut self, location: &str, values: &[f64]) {
        for &value in values {
            self.total += value;
            self.count += 1;
            if value > self.max_value {
                self.max_value = value;
                self.max_location = location.to_string();
            }
        }
        self.patterns
            .insert(location.to_string(), analyze_pattern(values));
    }
}

/// Per-project aggregate built fresh for each collection run (unless the run
/// is collect-only) and handed to the report layer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectMetricsResult {
    pub metrics: BTreeMap<String, MetricAggregate>,
}

/// Everything one collection run produces.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionReport {
    pub results: HashMap<String, ProjectMetricsResult>,
    pub stats: RunStats,
}

pub struct MetricsCollector<A: MonitoringApi> {
    api: A,
    storage: MetricsStorage,
    store: Arc<MeasurementStore>,
    config: HarvestConfig,
}

impl<A: MonitoringApi> MetricsCollector<A> {
    pub fn new(api: A, storage: MetricsStorage, config: HarvestConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::clone(storage.store());
        Ok(Self {
            api,
            storage,
            store,
            config,
        })
    }

    pub fn storage(&self) -> &MetricsStorage {
        &self.storage
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Collect new measurements for every configured project (or just the
    /// named one). Returns per-project aggregates (empty in collect-only
    /// mode) plus the run counters.
    pub async fn collect_metrics(
        &mut self,
        project_filter: Option<&str>,
    ) -> Result<CollectionReport> {
        let projects: Vec<ProjectRef> = self
            .config
            .projects
            .iter()
            .filter(|p| project_filter.is_none_or(|filter| p.name == filter))
            .cloned()
            .collect();
        if projects.is_empty() {
            return Err(HarvestError::Configuration(match project_filter {
                Some(filter) => format!("project {filter:?} is not configured"),
                None => "no projects configured".to_string(),
            }));
        }

        let mut report = CollectionReport::default();
        for project in &projects {
            report.stats.projects += 1;
            if let Err(err) = self.collect_project(project, &mut report).await {
                report.stats.units_failed += 1;
                tracing::error!(
                    project = %project.name,
                    %err,
                    "project collection failed; continuing with remaining projects"
                );
            }
        }

        tracing::info!(
            projects = report.stats.projects,
            processes = report.stats.processes_scanned,
            partitions = report.stats.partitions_scanned,
            collected = report.stats.points_collected,
            stored = report.stats.points_stored,
            failed_units = report.stats.units_failed,
            "collection run complete"
        );
        Ok(report)
    }

    async fn collect_project(
        &mut self,
        project: &ProjectRef,
        report: &mut CollectionReport,
    ) -> Result<()> {
        let processes = self.api.list_processes(&project.id).await?;
        let disk_metrics = self.config.disk_metrics();
        let mut result = ProjectMetricsResult::default();

        for process in &processes {
            if !process.type_name.is_data_bearing() {
                tracing::debug!(
                    process = %process.address(),
                    kind = ?process.type_name,
                    "skipping non-data-bearing process"
                );
                continue;
            }
            report.stats.processes_scanned += 1;

            if let Err(err) = self
                .collect_process(project, process, &mut result, &mut report.stats)
                .await
            {
                report.stats.units_failed += 1;
                tracing::warn!(
                    project = %project.name,
                    process = %process.address(),
                    %err,
                    "process collection failed; continuing"
                );
            }

            if disk_metrics.is_empty() {
                continue;
            }
            let partitions = match self
                .api
                .list_disk_partitions(&project.id, &process.hostname, process.port)
                .await
            {
                Ok(partitions) => partitions,
                Err(err) => {
                    report.stats.units_failed += 1;
                    tracing::warn!(
                        process = %process.address(),
                        %err,
                        "partition listing failed; skipping disk metrics for host"
                    );
                    continue;
                }
            };
            for partition in partitions {
                report.stats.partitions_scanned += 1;
                if let Err(err) = self
                    .collect_partition(
                        project,
                        process,
                        &partition.partition_name,
                        &mut result,
                        &mut report.stats,
                    )
                    .await
                {
                    report.stats.units_failed += 1;
                    tracing::warn!(
                        process = %process.address(),
                        partition = %partition.partition_name,
                        %err,
                        "partition collection failed; continuing"
                    );
                }
            }
        }

        if !self.config.collect_only {
            report.results.insert(project.name.clone(), result);
        }
        Ok(())
    }

    async fn collect_process(
        &mut self,
        project: &ProjectRef,
        process: &ProcessDescriptor,
        result: &mut ProjectMetricsResult,
        stats: &mut RunStats,
    ) -> Result<()> {
        let metrics = self.config.system_metrics();
        if metrics.is_empty() {
            return Ok(());
        }
        let address = process.address();
        let now = Utc::now();
        let mut latest_known: Option<DateTime<Utc>> = None;
        for metric in &metrics {
            let latest = self
                .store
                .latest_timestamp(&SeriesFilter::host_metric(&address, metric))?;
            latest_known = Some(match latest_known {
                Some(current) => current.min(latest),
                None => latest,
            });
        }
        let Some(start) = self.window_start(latest_known, now) else {
            tracing::debug!(process = %address, "window empty; nothing new to fetch");
            return Ok(());
        };

        let batches = self
            .api
            .get_measurements(
                &project.id,
                &process.hostname,
                process.port,
                &metrics,
                &self.config.granularity,
                start,
                now,
            )
            .await?;
        self.ingest_batches(project, process, None, batches, result, stats);
        Ok(())
    }

    async fn collect_partition(
        &mut self,
        project: &ProjectRef,
        process: &ProcessDescriptor,
        partition: &str,
        result: &mut ProjectMetricsResult,
        stats: &mut RunStats,
    ) -> Result<()> {
        let metrics = self.config.disk_metrics();
        let address = process.address();
        let now = Utc::now();
        let mut latest_known: Option<DateTime<Utc>> = None;
        for metric in &metrics {
            let latest = self.store.latest_timestamp(&SeriesFilter::host_partition_metric(
                &address, partition, metric,
            ))?;
            latest_known = Some(match latest_known {
                Some(current) => current.min(latest),
                None => latest,
            });
        }
        let Some(start) = self.window_start(latest_known, now) else {
            tracing::debug!(
                process = %address,
                partition,
                "window empty; nothing new to fetch"
            );
            return Ok(());
        };

        let batches = self
            .api
            .get_disk_measurements(
                &project.id,
                &process.hostname,
                process.port,
                partition,
                &metrics,
                &self.config.granularity,
                start,
                now,
            )
            .await?;
        self.ingest_batches(project, process, Some(partition), batches, result, stats);
        Ok(())
    }

    /// Start of the minimal fetch window: the earliest last-stored timestamp
    /// across the requested metrics minus the overlap, or `now - period` when
    /// no prior data exists. `None` means there is nothing new to fetch.
    fn window_start(
        &self,
        latest_known: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let start = match latest_known {
            Some(latest) if latest > DateTime::UNIX_EPOCH => latest - self.config.overlap(),
            _ => now - self.config.period(),
        };
        if start >= now {
            None
        } else {
            Some(start)
        }
    }

    fn ingest_batches(
        &mut self,
        project: &ProjectRef,
        process: &ProcessDescriptor,
        partition: Option<&str>,
        batches: Vec<MeasurementBatch>,
        result: &mut ProjectMetricsResult,
        stats: &mut RunStats,
    ) {
        let location = match partition {
            Some(partition) => format!("{} ({partition})", process.address()),
            None => process.address(),
        };
        for batch in batches {
            stats.points_collected += batch.data_points.len();
            let stored = self.storage.store_metrics(
                &project.name,
                &process.hostname,
                process.port,
                partition,
                &batch.metric_name,
                &batch.data_points,
            );
            stats.points_stored += stored;

            if self.config.collect_only {
                continue;
            }
            let values: Vec<f64> = batch
                .data_points
                .iter()
                .filter_map(|point| point.parse().ok())
                .map(|point| point.value)
                .collect();
            if values.is_empty() {
                continue;
            }
            result
                .metrics
                .entry(batch.metric_name.clone())
                .or_insert_with(MetricAggregate::new)
                .absorb(&location, &values);
        }
    }
}
