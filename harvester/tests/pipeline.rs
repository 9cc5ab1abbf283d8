//! End-to-end pipeline tests over an in-memory store and a scripted
//! monitoring API double.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use metrics_harvester::api::{
    DiskPartition, MeasurementBatch, MonitoringApi, ProcessDescriptor, ProcessType, RawDataPoint,
};
use metrics_harvester::cleanup::DuplicateCleaner;
use metrics_harvester::collector::MetricsCollector;
use metrics_harvester::config::{HarvestConfig, ProjectRef};
use metrics_harvester::error::{HarvestError, Result};
use metrics_harvester::ingest::MetricsStorage;
use metrics_harvester::store::{
    MeasurementMetadata, MeasurementStore, SeriesFilter, SeriesKey, StoredMeasurement,
};
use metrics_harvester::tracker::{HeadlessBackfill, TimestampTracker};

/// Scripted monitoring API: fixed process/partition listings, canned
/// measurement batches per host, optional per-host failures, and a record of
/// every requested fetch window.
#[derive(Default)]
struct ScriptedApi {
    processes: HashMap<String, Vec<ProcessDescriptor>>,
    partitions: Vec<DiskPartition>,
    measurements: HashMap<String, Vec<MeasurementBatch>>,
    disk_measurements: HashMap<String, Vec<MeasurementBatch>>,
    fail_hosts: HashSet<String>,
    windows: Mutex<Vec<(String, DateTime<Utc>, DateTime<Utc>)>>,
    queried: Mutex<Vec<String>>,
}

impl ScriptedApi {
    fn windows(&self) -> Vec<(String, DateTime<Utc>, DateTime<Utc>)> {
        self.windows.lock().unwrap().clone()
    }

    fn queried(&self) -> Vec<String> {
        self.queried.lock().unwrap().clone()
    }
}

#[async_trait]
impl MonitoringApi for ScriptedApi {
    async fn list_processes(&self, project_id: &str) -> Result<Vec<ProcessDescriptor>> {
        Ok(self.processes.get(project_id).cloned().unwrap_or_default())
    }

    async fn list_disk_partitions(
        &self,
        _project_id: &str,
        _host: &str,
        _port: u16,
    ) -> Result<Vec<DiskPartition>> {
        Ok(self.partitions.clone())
    }

    async fn get_measurements(
        &self,
        _project_id: &str,
        host: &str,
        port: u16,
        _metrics: &[String],
        _granularity: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MeasurementBatch>> {
        let address = format!("{host}:{port}");
        if self.fail_hosts.contains(&address) {
            return Err(HarvestError::Fetch(format!("{address} is unreachable")));
        }
        self.windows.lock().unwrap().push((address.clone(), start, end));
        self.queried.lock().unwrap().push(address.clone());
        Ok(self.measurements.get(&address).cloned().unwrap_or_default())
    }

    async fn get_disk_measurements(
        &self,
        _project_id: &str,
        host: &str,
        port: u16,
        partition: &str,
        _metrics: &[String],
        _granularity: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MeasurementBatch>> {
        let key = format!("{host}:{port}|{partition}");
        self.windows.lock().unwrap().push((key.clone(), start, end));
        self.queried.lock().unwrap().push(key.clone());
        Ok(self.disk_measurements.get(&key).cloned().unwrap_or_default())
    }
}

fn process(host: &str, type_name: ProcessType) -> ProcessDescriptor {
    ProcessDescriptor {
        id: format!("{host}:27017"),
        hostname: host.to_string(),
        port: 27017,
        type_name,
    }
}

fn batch(metric: &str, points: &[(DateTime<Utc>, f64)]) -> MeasurementBatch {
    MeasurementBatch {
        metric_name: metric.to_string(),
        data_points: points
            .iter()
            .map(|(ts, value)| RawDataPoint {
                timestamp: ts.to_rfc3339(),
                value: Some(*value),
            })
            .collect(),
    }
}

fn config(metrics: &[&str]) -> HarvestConfig {
    HarvestConfig {
        projects: vec![ProjectRef {
            id: "p1".to_string(),
            name: "prod".to_string(),
        }],
        metrics: metrics.iter().map(|m| m.to_string()).collect(),
        ..HarvestConfig::default()
    }
}

fn storage() -> (Arc<MeasurementStore>, MetricsStorage) {
    let store = Arc::new(MeasurementStore::open_in_memory().unwrap());
    let tracker = TimestampTracker::bootstrap(Arc::clone(&store), &HeadlessBackfill).unwrap();
    (Arc::clone(&store), MetricsStorage::new(store, tracker))
}

#[tokio::test]
async fn collect_stores_once_and_resubmission_stores_nothing() {
    let now = Utc::now();
    let t1 = now - Duration::minutes(3);
    let t2 = now - Duration::minutes(2);
    let t3 = now - Duration::minutes(1);

    let mut api = ScriptedApi::default();
    api.processes.insert(
        "p1".to_string(),
        vec![process("h1", ProcessType::ReplicaPrimary)],
    );
    api.measurements.insert(
        "h1:27017".to_string(),
        vec![batch("CPU", &[(t1, 1.0), (t2, 2.0), (t3, 3.0)])],
    );

    let (store, metrics_storage) = storage();
    let mut collector =
        MetricsCollector::new(api, metrics_storage, config(&["CPU"])).unwrap();

    let report = collector.collect_metrics(None).await.unwrap();
    assert_eq!(report.stats.points_collected, 3);
    assert_eq!(report.stats.points_stored, 3);
    assert_eq!(report.stats.processes_scanned, 1);
    assert_eq!(report.stats.units_failed, 0);

    // the remote returns the same three points; the overlap window rejects
    // them all
    let report = collector.collect_metrics(None).await.unwrap();
    assert_eq!(report.stats.points_collected, 3);
    assert_eq!(report.stats.points_stored, 0);

    let key = SeriesKey::new("h1:27017", "CPU");
    assert_eq!(collector.storage().tracker().get(&key), t3);
    assert_eq!(store.total_documents().unwrap(), 3);
}

#[tokio::test]
async fn fetch_window_never_leads_now_and_covers_the_overlap() {
    let now = Utc::now();
    // millisecond precision, matching what the store persists
    let last_stored =
        DateTime::from_timestamp_millis((now - Duration::minutes(30)).timestamp_millis()).unwrap();

    let (store, metrics_storage) = storage();
    store
        .insert_unordered(&[StoredMeasurement {
            timestamp: last_stored,
            value: 1.0,
            metadata: MeasurementMetadata {
                project: "prod".to_string(),
                host: "h1:27017".to_string(),
                metric: "CPU".to_string(),
                partition: None,
            },
        }])
        .unwrap();

    let mut api = ScriptedApi::default();
    api.processes.insert(
        "p1".to_string(),
        vec![process("h1", ProcessType::ReplicaPrimary)],
    );

    let mut collector =
        MetricsCollector::new(api, metrics_storage, config(&["CPU"])).unwrap();
    collector.collect_metrics(None).await.unwrap();

    let windows = collector_api(&collector).windows();
    assert_eq!(windows.len(), 1);
    let (_, start, end) = windows[0];
    assert!(start <= last_stored, "window start must cover the last stored point");
    assert!(last_stored - start <= Duration::minutes(5), "overlap is five minutes");
    assert!(start < end);
    assert!(end <= Utc::now());
}

#[tokio::test]
async fn routers_and_config_servers_are_skipped() {
    let mut api = ScriptedApi::default();
    api.processes.insert(
        "p1".to_string(),
        vec![
            process("data0", ProcessType::ReplicaPrimary),
            process("router0", ProcessType::ShardMongos),
            process("config0", ProcessType::ShardConfigSecondary),
        ],
    );

    let (_store, metrics_storage) = storage();
    let mut collector =
        MetricsCollector::new(api, metrics_storage, config(&["CPU"])).unwrap();
    let report = collector.collect_metrics(None).await.unwrap();

    assert_eq!(report.stats.processes_scanned, 1);
    assert_eq!(collector_api(&collector).queried(), vec!["data0:27017".to_string()]);
}

#[tokio::test]
async fn one_unreachable_host_does_not_abort_the_run() {
    let now = Utc::now();
    let mut api = ScriptedApi::default();
    api.processes.insert(
        "p1".to_string(),
        vec![
            process("down0", ProcessType::ReplicaPrimary),
            process("up0", ProcessType::ReplicaSecondary),
        ],
    );
    api.fail_hosts.insert("down0:27017".to_string());
    api.measurements.insert(
        "up0:27017".to_string(),
        vec![batch("CPU", &[(now - Duration::minutes(1), 5.0)])],
    );

    let (_store, metrics_storage) = storage();
    let mut collector =
        MetricsCollector::new(api, metrics_storage, config(&["CPU"])).unwrap();
    let report = collector.collect_metrics(None).await.unwrap();

    assert_eq!(report.stats.processes_scanned, 2);
    assert_eq!(report.stats.units_failed, 1);
    assert_eq!(report.stats.points_stored, 1);
    assert!(report.results.contains_key("prod"));
}

#[tokio::test]
async fn disk_metrics_run_per_partition() {
    let now = Utc::now();
    let mut api = ScriptedApi::default();
    api.processes.insert(
        "p1".to_string(),
        vec![process("h1", ProcessType::ReplicaPrimary)],
    );
    api.partitions = vec![
        DiskPartition {
            partition_name: "data".to_string(),
        },
        DiskPartition {
            partition_name: "journal".to_string(),
        },
    ];
    for partition in ["data", "journal"] {
        api.disk_measurements.insert(
            format!("h1:27017|{partition}"),
            vec![batch(
                "DISK_PARTITION_IOPS_TOTAL",
                &[(now - Duration::minutes(1), 11.0)],
            )],
        );
    }

    let (store, metrics_storage) = storage();
    let mut collector = MetricsCollector::new(
        api,
        metrics_storage,
        config(&["DISK_PARTITION_IOPS_TOTAL"]),
    )
    .unwrap();
    let report = collector.collect_metrics(None).await.unwrap();

    assert_eq!(report.stats.partitions_scanned, 2);
    assert_eq!(report.stats.points_stored, 2);

    // same timestamp and value on two partitions stays two distinct series
    let latest = store
        .latest_timestamp(&SeriesFilter::host_metric(
            "h1:27017",
            "DISK_PARTITION_IOPS_TOTAL",
        ))
        .unwrap();
    assert!(latest > DateTime::UNIX_EPOCH);
    let result = &report.results["prod"];
    let aggregate = &result.metrics["DISK_PARTITION_IOPS_TOTAL"];
    assert!(aggregate.patterns.contains_key("h1:27017 (data)"));
    assert!(aggregate.patterns.contains_key("h1:27017 (journal)"));
}

#[tokio::test]
async fn collect_only_mode_returns_no_aggregates() {
    let now = Utc::now();
    let mut api = ScriptedApi::default();
    api.processes.insert(
        "p1".to_string(),
        vec![process("h1", ProcessType::ReplicaPrimary)],
    );
    api.measurements.insert(
        "h1:27017".to_string(),
        vec![batch("CPU", &[(now - Duration::minutes(1), 5.0)])],
    );

    let (_store, metrics_storage) = storage();
    let mut collect_only_config = config(&["CPU"]);
    collect_only_config.collect_only = true;
    let mut collector =
        MetricsCollector::new(api, metrics_storage, collect_only_config).unwrap();
    let report = collector.collect_metrics(None).await.unwrap();

    assert!(report.results.is_empty());
    assert_eq!(report.stats.points_stored, 1);
}

#[tokio::test]
async fn unknown_project_filter_fails_fast() {
    let (_store, metrics_storage) = storage();
    let mut collector = MetricsCollector::new(
        ScriptedApi::default(),
        metrics_storage,
        config(&["CPU"]),
    )
    .unwrap();
    let result = collector.collect_metrics(Some("nope")).await;
    assert!(matches!(result, Err(HarvestError::Configuration(_))));
}

#[test]
fn cleanup_scenario_keeps_first_of_five() {
    let store = Arc::new(MeasurementStore::open_in_memory().unwrap());
    let now = Utc::now();
    let doc = StoredMeasurement {
        timestamp: now - Duration::minutes(10),
        value: 3.5,
        metadata: MeasurementMetadata {
            project: "prod".to_string(),
            host: "h1:27017".to_string(),
            metric: "CPU".to_string(),
            partition: None,
        },
    };
    // five identical documents: ids A < B < C < D < E
    store
        .insert_unordered(&vec![doc.clone(); 5])
        .unwrap();

    let cleaner = DuplicateCleaner::new(Arc::clone(&store));
    let groups = store.duplicate_groups(None).unwrap();
    let ids = store.group_member_ids(&groups[0].0).unwrap();
    assert_eq!(ids.len(), 5);
    let survivor = ids[0];

    let result = cleaner.cleanup_duplicates(false).unwrap();
    assert_eq!(result.documents_removed, 4);

    let remaining = store.group_member_ids(&groups[0].0).unwrap();
    assert_eq!(remaining, vec![survivor]);

    let second = cleaner.cleanup_duplicates(false).unwrap();
    assert_eq!(second.duplicate_groups, 0);
}

#[test]
fn tracker_survives_restarts_through_checkpoints() {
    let store = Arc::new(MeasurementStore::open_in_memory().unwrap());
    let now = Utc::now();
    {
        let tracker = TimestampTracker::bootstrap(Arc::clone(&store), &HeadlessBackfill).unwrap();
        let mut storage = MetricsStorage::new(Arc::clone(&store), tracker);
        let stored = storage.store_metrics(
            "prod",
            "h1",
            27017,
            None,
            "CPU",
            &[RawDataPoint {
                timestamp: now.to_rfc3339(),
                value: Some(1.0),
            }],
        );
        assert_eq!(stored, 1);
    }

    // a fresh bootstrap sees the persisted checkpoint, not epoch
    let tracker = TimestampTracker::bootstrap(store, &HeadlessBackfill).unwrap();
    let tracked = tracker.get(&SeriesKey::new("h1:27017", "CPU"));
    assert!(tracked > DateTime::UNIX_EPOCH);
    assert!((tracked - now).num_seconds().abs() < 1);
}

/// The collector owns the API double; reach through for its recordings.
fn collector_api(collector: &MetricsCollector<ScriptedApi>) -> &ScriptedApi {
    collector.api()
}
