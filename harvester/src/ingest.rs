//! Idempotent batched ingestion.
//!
//! Each batch passes three duplicate filters before anything is written:
//! the tracker window (timestamps at or before the last stored one), an
//! intra-batch timestamp set, and a defensive exact-match probe against the
//! store that covers tracker staleness. Failures below the batch boundary
//! are logged and absorbed; a batch never raises to the collector.

use std::collections::HashSet;
use std::sync::Arc;

use crate::api::RawDataPoint;
use crate::store::{MeasurementMetadata, MeasurementStore, SeriesKey, StoredMeasurement};
use crate::tracker::TimestampTracker;

/// Ingestion facade pairing the measurement store with the timestamp
/// tracker.
pub struct MetricsStorage {
    store: Arc<MeasurementStore>,
    tracker: TimestampTracker,
}

impl MetricsStorage {
    pub fn new(store: Arc<MeasurementStore>, tracker: TimestampTracker) -> Self {
        Self { store, tracker }
    }

    pub fn store(&self) -> &Arc<MeasurementStore> {
        &self.store
    }

    pub fn tracker(&self) -> &TimestampTracker {
        &self.tracker
    }

    /// Store one fetched batch for a series, returning how many points were
    /// new. Unparseable points are skipped, already-seen points are counted
    /// but not treated as failures, and a storage-layer failure yields 0 for
    /// the batch without raising.
    pub fn store_metrics(
        &mut self,
        project: &str,
        host: &str,
        port: u16,
        partition: Option<&str>,
        metric: &str,
        points: &[RawDataPoint],
    ) -> usize {
        let address = format!("{host}:{port}");
        let key = match partition {
            Some(partition) => SeriesKey::with_partition(&address, metric, partition),
            None => SeriesKey::new(&address, metric),
        };
        let last_seen = self.tracker.get(&key);

        let mut seen_in_batch: HashSet<i64> = HashSet::new();
        let mut accepted: Vec<StoredMeasurement> = Vec::new();
        let mut batch_max = last_seen;
        let mut skipped_window = 0usize;
        let mut skipped_parse = 0usize;
        let mut skipped_existing = 0usize;

        for point in points {
            let parsed = match point.parse() {
                Ok(parsed) => parsed,
                Err(err) => {
                    tracing::debug!(metric, %err, "skipping unparseable data point");
                    skipped_parse += 1;
                    continue;
                }
            };
            if parsed.timestamp <= last_seen
                || !seen_in_batch.insert(parsed.timestamp.timestamp_millis())
            {
                skipped_window += 1;
                continue;
            }
            let doc = StoredMeasurement {
                timestamp: parsed.timestamp,
                value: parsed.value,
                metadata: MeasurementMetadata {
                    project: project.to_string(),
                    host: address.clone(),
                    metric: metric.to_string(),
                    partition: partition.map(str::to_string),
                },
            };
            match self.store.exists_exact(&doc) {
                Ok(true) => {
                    skipped_existing += 1;
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(key = %key, %err, "existence probe failed; batch yields no stored points");
                    return 0;
                }
            }
            if parsed.timestamp > batch_max {
                batch_max = parsed.timestamp;
            }
            accepted.push(doc);
        }

        if accepted.is_empty() {
            tracing::debug!(
                key = %key,
                window = skipped_window,
                parse = skipped_parse,
                existing = skipped_existing,
                "no new points in batch"
            );
            return 0;
        }

        let outcome = match self.store.insert_unordered(&accepted) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(key = %key, %err, "bulk insert failed; batch yields no stored points");
                return 0;
            }
        };
        if let Some(stored_max) = outcome.max_timestamp {
            self.tracker.advance(&key, stored_max);
        }
        tracing::debug!(
            key = %key,
            stored = outcome.inserted,
            window = skipped_window,
            parse = skipped_parse,
            existing = skipped_existing,
            "stored metric batch"
        );
        outcome.inserted
    }
}
