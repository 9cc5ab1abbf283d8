//! SQLite-backed measurement and checkpoint store.
//!
//! Measurement documents keep the wire shape `{timestamp, value, metadata}`;
//! the `id` column (`INTEGER PRIMARY KEY AUTOINCREMENT`) is the
//! insertion-order identifier the duplicate cleanup relies on for
//! deterministic survivor selection. A companion `checkpoints` table holds
//! one row per tracked series.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::Result;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS measurements (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ms          INTEGER NOT NULL,
    value          REAL NOT NULL,
    project        TEXT NOT NULL,
    host           TEXT NOT NULL,
    metric         TEXT NOT NULL,
    disk_partition TEXT
);
CREATE INDEX IF NOT EXISTS idx_measurements_host_metric
    ON measurements (host, metric);
CREATE INDEX IF NOT EXISTS idx_measurements_project
    ON measurements (project);
CREATE TABLE IF NOT EXISTS checkpoints (
    series_key     TEXT PRIMARY KEY,
    host           TEXT NOT NULL,
    metric         TEXT NOT NULL,
    disk_partition TEXT,
    last_ts_ms     INTEGER NOT NULL
);
";

/// Composite identifier naming one metric time series: `host:port`, metric
/// name, and the disk partition for disk-scoped metrics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SeriesKey {
    pub host: String,
    pub metric: String,
    pub partition: Option<String>,
}

impl SeriesKey {
    pub fn new(host: impl Into<String>, metric: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            metric: metric.into(),
            partition: None,
        }
    }

    pub fn with_partition(
        host: impl Into<String>,
        metric: impl Into<String>,
        partition: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            metric: metric.into(),
            partition: Some(partition.into()),
        }
    }

    /// Canonical string form, `host:metric[:partition]`, used as the
    /// checkpoint primary key.
    pub fn canonical(&self) -> String {
        match &self.partition {
            Some(partition) => format!("{}:{}:{}", self.host, self.metric, partition),
            None => format!("{}:{}", self.host, self.metric),
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Persisted last-seen timestamp for one series.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub key: SeriesKey,
    pub last_timestamp: DateTime<Utc>,
}

/// A persisted measurement document. Never mutated; deleted only by the
/// duplicate cleanup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMeasurement {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub metadata: MeasurementMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementMetadata {
    pub project: String,
    pub host: String,
    pub metric: String,
    pub partition: Option<String>,
}

/// Identity under which two stored measurements count as duplicates. The
/// partition is part of the key on both the live dedup path and the cleanup
/// path, so distinct disk partitions are never conflated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateKey {
    pub timestamp: DateTime<Utc>,
    pub host: String,
    pub metric: String,
    pub project: String,
    pub value: f64,
    pub partition: Option<String>,
}

/// Metadata filter for reads. Unset fields do not constrain the query;
/// disk-scoped metrics are already disambiguated by their metric name.
#[derive(Debug, Clone, Default)]
pub struct SeriesFilter {
    pub project: Option<String>,
    pub host: Option<String>,
    pub metric: Option<String>,
    pub partition: Option<String>,
}

impl SeriesFilter {
    pub fn host_metric(host: impl Into<String>, metric: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            metric: Some(metric.into()),
            ..Self::default()
        }
    }

    pub fn host_partition_metric(
        host: impl Into<String>,
        partition: impl Into<String>,
        metric: impl Into<String>,
    ) -> Self {
        Self {
            host: Some(host.into()),
            metric: Some(metric.into()),
            partition: Some(partition.into()),
            ..Self::default()
        }
    }

    pub fn project_metric(project: impl Into<String>, metric: impl Into<String>) -> Self {
        Self {
            project: Some(project.into()),
            metric: Some(metric.into()),
            ..Self::default()
        }
    }

    fn conditions(&self) -> (Vec<&'static str>, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(project) = &self.project {
            clauses.push("project = ?");
            values.push(Value::Text(project.clone()));
        }
        if let Some(host) = &self.host {
            clauses.push("host = ?");
            values.push(Value::Text(host.clone()));
        }
        if let Some(metric) = &self.metric {
            clauses.push("metric = ?");
            values.push(Value::Text(metric.clone()));
        }
        if let Some(partition) = &self.partition {
            clauses.push("disk_partition IS ?");
            values.push(Value::Text(partition.clone()));
        }
        (clauses, values)
    }
}

/// Result of an unordered bulk insert. `max_timestamp` covers only the rows
/// that actually landed, so tracker advances never lead the store.
#[derive(Debug, Clone, Copy)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub max_timestamp: Option<DateTime<Utc>>,
}

pub struct MeasurementStore {
    conn: Mutex<Connection>,
}

impl MeasurementStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert all documents, unordered: a row that fails to insert is logged
    /// and skipped, the rest of the batch still lands.
    pub fn insert_unordered(&self, docs: &[StoredMeasurement]) -> Result<InsertOutcome> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO measurements (ts_ms, value, project, host, metric, disk_partition)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        let mut outcome = InsertOutcome {
            inserted: 0,
            max_timestamp: None,
        };
        for doc in docs {
            let result = stmt.execute(params![
                to_millis(doc.timestamp),
                doc.value,
                doc.metadata.project,
                doc.metadata.host,
                doc.metadata.metric,
                doc.metadata.partition,
            ]);
            match result {
                Ok(_) => {
                    outcome.inserted += 1;
                    outcome.max_timestamp = Some(match outcome.max_timestamp {
                        Some(current) => current.max(doc.timestamp),
                        None => doc.timestamp,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        host = %doc.metadata.host,
                        metric = %doc.metadata.metric,
                        %err,
                        "skipping measurement that failed to insert"
                    );
                }
            }
        }
        Ok(outcome)
    }

    /// Exact-match existence probe over timestamp, value, and all metadata
    /// fields. Covers tracker staleness on the ingestion path.
    pub fn exists_exact(&self, doc: &StoredMeasurement) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let found = conn
            .query_row(
                "SELECT 1 FROM measurements
                 WHERE ts_ms = ?1 AND value = ?2 AND project = ?3
                   AND host = ?4 AND metric = ?5 AND disk_partition IS ?6
                 LIMIT 1",
                params![
                    to_millis(doc.timestamp),
                    doc.value,
                    doc.metadata.project,
                    doc.metadata.host,
                    doc.metadata.metric,
                    doc.metadata.partition,
                ],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Latest stored timestamp matching the filter; epoch if none.
    pub fn latest_timestamp(&self, filter: &SeriesFilter) -> Result<DateTime<Utc>> {
        self.boundary_timestamp(filter, "MAX")
    }

    /// Earliest stored timestamp matching the filter; epoch if none.
    pub fn earliest_data_time(&self, filter: &SeriesFilter) -> Result<DateTime<Utc>> {
        self.boundary_timestamp(filter, "MIN")
    }

    /// Companion to [`Self::earliest_data_time`] for report ranges.
    pub fn latest_data_time(&self, filter: &SeriesFilter) -> Result<DateTime<Utc>> {
        self.boundary_timestamp(filter, "MAX")
    }

    fn boundary_timestamp(&self, filter: &SeriesFilter, func: &str) -> Result<DateTime<Utc>> {
        let (clauses, values) = filter.conditions();
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!("SELECT {func}(ts_ms) FROM measurements{where_sql}");
        let conn = self.conn.lock().unwrap();
        let ms: Option<i64> = conn.query_row(&sql, params_from_iter(values), |row| row.get(0))?;
        Ok(ms.map(from_millis).unwrap_or(DateTime::UNIX_EPOCH))
    }

    /// Measurements matching the filter within `[start, end]`, ascending by
    /// timestamp.
    pub fn range(
        &self,
        filter: &SeriesFilter,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredMeasurement>> {
        let (mut clauses, mut values) = filter.conditions();
        clauses.push("ts_ms >= ?");
        values.push(Value::Integer(to_millis(start)));
        clauses.push("ts_ms <= ?");
        values.push(Value::Integer(to_millis(end)));
        let sql = format!(
            "SELECT ts_ms, value, project, host, metric, disk_partition
             FROM measurements WHERE {} ORDER BY ts_ms ASC, id ASC",
            clauses.join(" AND ")
        );
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), row_to_measurement)?;
        let mut measurements = Vec::new();
        for row in rows {
            measurements.push(row?);
        }
        Ok(measurements)
    }

    /// One entry per stored series with its current max timestamp. Used to
    /// seed checkpoints on cold start.
    pub fn series_summaries(&self) -> Result<Vec<Checkpoint>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT host, metric, disk_partition, MAX(ts_ms)
             FROM measurements GROUP BY host, metric, disk_partition",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Checkpoint {
                key: SeriesKey {
                    host: row.get(0)?,
                    metric: row.get(1)?,
                    partition: row.get(2)?,
                },
                last_timestamp: from_millis(row.get(3)?),
            })
        })?;
        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }

    /// Distinct hosts with stored data; the slow discovery fallback walks
    /// these explicitly.
    pub fn distinct_hosts(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT host FROM measurements ORDER BY host")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut hosts = Vec::new();
        for row in rows {
            hosts.push(row?);
        }
        Ok(hosts)
    }

    /// Distinct (metric, partition) pairs stored for one host.
    pub fn metrics_for_host(&self, host: &str) -> Result<Vec<(String, Option<String>)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT metric, disk_partition FROM measurements
             WHERE host = ?1 ORDER BY metric",
        )?;
        let rows = stmt.query_map(params![host], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut metrics = Vec::new();
        for row in rows {
            metrics.push(row?);
        }
        Ok(metrics)
    }

    pub fn total_documents(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM measurements", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Duplicate groups (size > 1) ordered by descending size. `limit`
    /// restricts to the top-N largest groups.
    pub fn duplicate_groups(&self, limit: Option<usize>) -> Result<Vec<(DuplicateKey, u64)>> {
        let mut sql = String::from(
            "SELECT ts_ms, host, metric, project, value, disk_partition, COUNT(*) AS n
             FROM measurements
             GROUP BY ts_ms, host, metric, project, value, disk_partition
             HAVING COUNT(*) > 1
             ORDER BY n DESC, ts_ms ASC, host ASC, metric ASC",
        );
        let mut values: Vec<Value> = Vec::new();
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok((
                DuplicateKey {
                    timestamp: from_millis(row.get(0)?),
                    host: row.get(1)?,
                    metric: row.get(2)?,
                    project: row.get(3)?,
                    value: row.get(4)?,
                    partition: row.get(5)?,
                },
                row.get::<_, i64>(6)? as u64,
            ))
        })?;
        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    /// Members of one duplicate group, ascending by insertion-order id. The
    /// first entry is the survivor.
    pub fn group_members(&self, key: &DuplicateKey) -> Result<Vec<(i64, StoredMeasurement)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT id, ts_ms, value, project, host, metric, disk_partition
             FROM measurements
             WHERE ts_ms = ?1 AND host = ?2 AND metric = ?3 AND project = ?4
               AND value = ?5 AND disk_partition IS ?6
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(
            params![
                to_millis(key.timestamp),
                key.host,
                key.metric,
                key.project,
                key.value,
                key.partition,
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    StoredMeasurement {
                        timestamp: from_millis(row.get(1)?),
                        value: row.get(2)?,
                        metadata: MeasurementMetadata {
                            project: row.get(3)?,
                            host: row.get(4)?,
                            metric: row.get(5)?,
                            partition: row.get(6)?,
                        },
                    },
                ))
            },
        )?;
        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    /// Insertion-order ids of one duplicate group, ascending.
    pub fn group_member_ids(&self, key: &DuplicateKey) -> Result<Vec<i64>> {
        Ok(self
            .group_members(key)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    pub fn delete_by_ids(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("DELETE FROM measurements WHERE id IN ({placeholders})");
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(&sql, params_from_iter(ids.iter()))?;
        Ok(deleted)
    }

    pub fn load_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT host, metric, disk_partition, last_ts_ms FROM checkpoints")?;
        let rows = stmt.query_map([], |row| {
            Ok(Checkpoint {
                key: SeriesKey {
                    host: row.get(0)?,
                    metric: row.get(1)?,
                    partition: row.get(2)?,
                },
                last_timestamp: from_millis(row.get(3)?),
            })
        })?;
        let mut checkpoints = Vec::new();
        for row in rows {
            checkpoints.push(row?);
        }
        Ok(checkpoints)
    }

    /// Write a checkpoint, moving forward only: an existing row with a later
    /// timestamp is left untouched.
    pub fn upsert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO checkpoints (series_key, host, metric, disk_partition, last_ts_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(series_key) DO UPDATE SET last_ts_ms = excluded.last_ts_ms
             WHERE excluded.last_ts_ms > checkpoints.last_ts_ms",
            params![
                checkpoint.key.canonical(),
                checkpoint.key.host,
                checkpoint.key.metric,
                checkpoint.key.partition,
                to_millis(checkpoint.last_timestamp),
            ],
        )?;
        Ok(())
    }

    pub fn checkpoint_count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM checkpoints", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Checkpoints as a canonical-key map, the tracker's in-memory shape.
    pub fn checkpoint_map(&self) -> Result<HashMap<String, DateTime<Utc>>> {
        Ok(self
            .load_checkpoints()?
            .into_iter()
            .map(|cp| (cp.key.canonical(), cp.last_timestamp))
            .collect())
    }
}

fn to_millis(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

fn row_to_measurement(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMeasurement> {
    Ok(StoredMeasurement {
        timestamp: from_millis(row.get(0)?),
        value: row.get(1)?,
        metadata: MeasurementMetadata {
            project: row.get(2)?,
            host: row.get(3)?,
            metric: row.get(4)?,
            partition: row.get(5)?,
        },
    })
}
