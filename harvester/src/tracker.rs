//! Last-seen timestamp tracking per metric series.
//!
//! The tracker is a read-through cache over the persisted `checkpoints`
//! table: the table is the source of truth, the in-memory map only saves a
//! query per batch. It may lag the store (ingestion falls back to exact-match
//! probes) but never leads it, because advances happen strictly after a
//! successful insert and only to timestamps that actually landed.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{HarvestError, Result};
use crate::store::{Checkpoint, MeasurementStore, SeriesFilter, SeriesKey};

/// Backfills above this many series consult the [`BackfillPolicy`] instead
/// of running inline.
pub const LARGE_BACKFILL_THRESHOLD: usize = 100;

/// Estimated cold-start work: one seed per series found in the store.
#[derive(Debug, Clone)]
pub struct BackfillPlan {
    pub series: Vec<Checkpoint>,
}

impl BackfillPlan {
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillDecision {
    /// Build inline with progress callbacks and cooperative cancellation.
    Foreground,
    /// Build on a worker thread; the current run accepts slower duplicate
    /// checks until the checkpoints land.
    Background,
    /// Do not build; duplicate checks rely on store probes until a later
    /// run seeds the tracker.
    Skip,
    /// Abort the whole operation.
    Abort,
}

/// How a large cold-start backfill should run. Interactive frontends prompt
/// the user here; library code never touches stdin.
pub trait BackfillPolicy: Send + Sync {
    fn decide(&self, plan: &BackfillPlan) -> BackfillDecision;

    fn on_progress(&self, _done: usize, _total: usize) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Default for non-interactive callers: always build in the background.
pub struct HeadlessBackfill;

impl BackfillPolicy for HeadlessBackfill {
    fn decide(&self, _plan: &BackfillPlan) -> BackfillDecision {
        BackfillDecision::Background
    }
}

pub struct TimestampTracker {
    store: Arc<MeasurementStore>,
    cache: HashMap<String, DateTime<Utc>>,
}

impl TimestampTracker {
    /// A tracker with an empty cache and no cold-start work. Useful when the
    /// caller knows the store is fresh.
    pub fn new(store: Arc<MeasurementStore>) -> Self {
        Self {
            store,
            cache: HashMap::new(),
        }
    }

    /// Load persisted checkpoints and reconcile them with the store: a full
    /// backfill when no checkpoints exist yet, otherwise a cheaper pass that
    /// only discovers series absent from the tracker.
    pub fn bootstrap(store: Arc<MeasurementStore>, policy: &dyn BackfillPolicy) -> Result<Self> {
        let cache = store.checkpoint_map()?;
        let mut tracker = Self { store, cache };
        if tracker.cache.is_empty() {
            tracker.full_backfill(policy)?;
        } else {
            tracker.discover_new_series();
        }
        Ok(tracker)
    }

    /// Last timestamp known to be stored for the series; epoch if unseen.
    pub fn get(&self, key: &SeriesKey) -> DateTime<Utc> {
        self.cache
            .get(&key.canonical())
            .copied()
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// Move the series forward. A no-op unless `timestamp` is strictly after
    /// the current value; the persisted checkpoint is written first and a
    /// write failure only costs re-deduplication on the next run.
    pub fn advance(&mut self, key: &SeriesKey, timestamp: DateTime<Utc>) {
        let canonical = key.canonical();
        let current = self
            .cache
            .get(&canonical)
            .copied()
            .unwrap_or(DateTime::UNIX_EPOCH);
        if timestamp <= current {
            return;
        }
        let checkpoint = Checkpoint {
            key: key.clone(),
            last_timestamp: timestamp,
        };
        if let Err(err) = self.store.upsert_checkpoint(&checkpoint) {
            tracing::warn!(key = %canonical, %err, "failed to persist checkpoint advance");
        }
        self.cache.insert(canonical, timestamp);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn full_backfill(&mut self, policy: &dyn BackfillPolicy) -> Result<()> {
        let plan = BackfillPlan {
            series: self.store.series_summaries()?,
        };
        if plan.is_empty() {
            return Ok(());
        }
        let decision = if plan.len() > LARGE_BACKFILL_THRESHOLD {
            policy.decide(&plan)
        } else {
            BackfillDecision::Foreground
        };
        match decision {
            BackfillDecision::Foreground => self.run_foreground(plan, policy),
            BackfillDecision::Background => {
                Self::run_background(Arc::clone(&self.store), plan);
                Ok(())
            }
            BackfillDecision::Skip => {
                tracing::info!(
                    series = plan.len(),
                    "skipping checkpoint backfill; duplicate checks fall back to store probes"
                );
                Ok(())
            }
            BackfillDecision::Abort => Err(HarvestError::Cancelled),
        }
    }

    fn run_foreground(&mut self, plan: BackfillPlan, policy: &dyn BackfillPolicy) -> Result<()> {
        let total = plan.len();
        for (done, seed) in plan.series.into_iter().enumerate() {
            if policy.is_cancelled() {
                tracing::warn!(
                    seeded = done,
                    total,
                    "checkpoint backfill cancelled; partial tracker state kept"
                );
                return Ok(());
            }
            if let Err(err) = self.store.upsert_checkpoint(&seed) {
                tracing::warn!(key = %seed.key, %err, "failed to persist checkpoint seed");
                continue;
            }
            self.cache.insert(seed.key.canonical(), seed.last_timestamp);
            policy.on_progress(done + 1, total);
        }
        tracing::info!(series = total, "checkpoint backfill complete");
        Ok(())
    }

    fn run_background(store: Arc<MeasurementStore>, plan: BackfillPlan) {
        std::thread::spawn(move || {
            let total = plan.len();
            let mut seeded = 0usize;
            for seed in plan.series {
                match store.upsert_checkpoint(&seed) {
                    Ok(()) => seeded += 1,
                    Err(err) => {
                        tracing::warn!(key = %seed.key, %err, "background checkpoint seed failed");
                    }
                }
            }
            tracing::info!(seeded, total, "background checkpoint backfill finished");
        });
    }

    /// Seed checkpoints for series that appeared since the tracker was last
    /// persisted. Aggregation failure falls back to an explicit per-host scan;
    /// neither path raises to the caller.
    fn discover_new_series(&mut self) {
        match self.store.series_summaries() {
            Ok(summaries) => {
                let mut discovered = 0usize;
                for seed in summaries {
                    let canonical = seed.key.canonical();
                    if self.cache.contains_key(&canonical) {
                        continue;
                    }
                    if let Err(err) = self.store.upsert_checkpoint(&seed) {
                        tracing::warn!(key = %canonical, %err, "failed to seed discovered series");
                        continue;
                    }
                    self.cache.insert(canonical, seed.last_timestamp);
                    discovered += 1;
                }
                if discovered > 0 {
                    tracing::info!(discovered, "seeded checkpoints for new series");
                }
            }
            Err(err) => {
                tracing::warn!(%err, "series aggregation failed; falling back to per-host scan");
                self.discover_by_scan();
            }
        }
    }

    fn discover_by_scan(&mut self) {
        let hosts = match self.store.distinct_hosts() {
            Ok(hosts) => hosts,
            Err(err) => {
                tracing::warn!(%err, "host scan failed; new series stay undiscovered this run");
                return;
            }
        };
        for host in hosts {
            let metrics = match self.store.metrics_for_host(&host) {
                Ok(metrics) => metrics,
                Err(err) => {
                    tracing::warn!(%host, %err, "metric scan failed for host; skipping");
                    continue;
                }
            };
            for (metric, partition) in metrics {
                let key = SeriesKey {
                    host: host.clone(),
                    metric,
                    partition,
                };
                let canonical = key.canonical();
                if self.cache.contains_key(&canonical) {
                    continue;
                }
                let filter = SeriesFilter {
                    host: Some(key.host.clone()),
                    metric: Some(key.metric.clone()),
                    partition: key.partition.clone(),
                    project: None,
                };
                match self.store.latest_timestamp(&filter) {
                    Ok(latest) if latest > DateTime::UNIX_EPOCH => {
                        let checkpoint = Checkpoint {
                            key,
                            last_timestamp: latest,
                        };
                        if self.store.upsert_checkpoint(&checkpoint).is_ok() {
                            self.cache.insert(canonical, latest);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(key = %canonical, %err, "latest-timestamp scan failed; skipping");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MeasurementMetadata, StoredMeasurement};
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 12, minute, 0).unwrap()
    }

    fn doc(minute: u32, metric: &str) -> StoredMeasurement {
        StoredMeasurement {
            timestamp: ts(minute),
            value: 1.0,
            metadata: MeasurementMetadata {
                project: "prod".to_string(),
                host: "h1:27017".to_string(),
                metric: metric.to_string(),
                partition: None,
            },
        }
    }

    struct AbortAll;

    impl BackfillPolicy for AbortAll {
        fn decide(&self, _plan: &BackfillPlan) -> BackfillDecision {
            BackfillDecision::Abort
        }
    }

    #[test]
    fn unseen_series_reads_epoch() {
        let store = Arc::new(MeasurementStore::open_in_memory().unwrap());
        let tracker = TimestampTracker::new(store);
        let key = SeriesKey::new("h1:27017", "CPU");
        assert_eq!(tracker.get(&key), DateTime::UNIX_EPOCH);
    }

    #[test]
    fn advance_is_monotonic() {
        let store = Arc::new(MeasurementStore::open_in_memory().unwrap());
        let mut tracker = TimestampTracker::new(Arc::clone(&store));
        let key = SeriesKey::new("h1:27017", "CPU");

        tracker.advance(&key, ts(5));
        assert_eq!(tracker.get(&key), ts(5));

        tracker.advance(&key, ts(3));
        assert_eq!(tracker.get(&key), ts(5));

        tracker.advance(&key, ts(9));
        assert_eq!(tracker.get(&key), ts(9));

        // persisted state matches
        let reloaded = TimestampTracker::bootstrap(store, &HeadlessBackfill).unwrap();
        assert_eq!(reloaded.get(&key), ts(9));
    }

    #[test]
    fn bootstrap_backfills_from_measurements() {
        let store = Arc::new(MeasurementStore::open_in_memory().unwrap());
        store
            .insert_unordered(&[doc(1, "CPU"), doc(7, "CPU"), doc(4, "MEMORY_RESIDENT")])
            .unwrap();

        let tracker = TimestampTracker::bootstrap(store, &HeadlessBackfill).unwrap();
        assert_eq!(tracker.get(&SeriesKey::new("h1:27017", "CPU")), ts(7));
        assert_eq!(
            tracker.get(&SeriesKey::new("h1:27017", "MEMORY_RESIDENT")),
            ts(4)
        );
    }

    #[test]
    fn bootstrap_discovers_series_missing_from_tracker() {
        let store = Arc::new(MeasurementStore::open_in_memory().unwrap());
        store.insert_unordered(&[doc(3, "CPU")]).unwrap();
        let tracker = TimestampTracker::bootstrap(Arc::clone(&store), &HeadlessBackfill).unwrap();
        assert_eq!(tracker.len(), 1);

        // a series stored after the first bootstrap
        store.insert_unordered(&[doc(6, "CONNECTIONS")]).unwrap();
        let tracker = TimestampTracker::bootstrap(store, &HeadlessBackfill).unwrap();
        assert_eq!(tracker.len(), 2);
        assert_eq!(
            tracker.get(&SeriesKey::new("h1:27017", "CONNECTIONS")),
            ts(6)
        );
    }

    #[test]
    fn small_backfills_never_consult_the_policy() {
        let store = Arc::new(MeasurementStore::open_in_memory().unwrap());
        store.insert_unordered(&[doc(2, "CPU")]).unwrap();
        // AbortAll would fail the bootstrap if it were asked
        let tracker = TimestampTracker::bootstrap(store, &AbortAll).unwrap();
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn abort_decision_cancels_large_backfills() {
        let store = Arc::new(MeasurementStore::open_in_memory().unwrap());
        let docs: Vec<StoredMeasurement> = (0..LARGE_BACKFILL_THRESHOLD + 1)
            .map(|i| {
                let mut d = doc(1, &format!("METRIC_{i}"));
                d.metadata.host = format!("h{i}:27017");
                d
            })
            .collect();
        store.insert_unordered(&docs).unwrap();

        let result = TimestampTracker::bootstrap(store, &AbortAll);
        assert!(matches!(result, Err(HarvestError::Cancelled)));
    }
}
