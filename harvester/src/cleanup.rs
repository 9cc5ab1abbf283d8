//! Retroactive duplicate cleanup.
//!
//! Operates directly on the store, independent of tracker and collector
//! state. Documents group under the duplicate-identity key (timestamp, host,
//! metric, project, value, partition); within a group the member with the
//! lowest insertion-order id survives and the rest are removed. Survivor
//! selection never looks at data fields, so repeated dry runs agree.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::error::Result;
use crate::store::{DuplicateKey, MeasurementStore, StoredMeasurement};

/// Progress is logged after every this many groups on large runs.
const PROGRESS_EVERY: usize = 500;

/// Store-wide duplicate census.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateStats {
    pub total_documents: u64,
    pub duplicate_groups: u64,
    pub total_duplicate_documents: u64,
    /// Everything in a duplicate group except its survivor.
    pub documents_that_would_be_removed: u64,
    pub worst_group_size: u64,
    pub avg_group_size: f64,
    pub duration_ms: u64,
}

/// Outcome of one cleanup pass. A dry run reports identical totals without
/// deleting anything.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupResult {
    pub duplicate_groups: u64,
    pub duplicate_documents: u64,
    pub documents_removed: u64,
    pub duration_ms: u64,
}

/// One duplicate group, identified by its key and size.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub key: DuplicateKey,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateMember {
    pub id: i64,
    pub document: StoredMeasurement,
}

/// One duplicate group with its full membership, ascending by insertion
/// order: the first member is kept, the rest are removal candidates.
#[derive(Debug, Clone, Serialize)]
pub struct DetailedDuplicateGroup {
    pub key: DuplicateKey,
    pub members: Vec<DuplicateMember>,
}

impl DetailedDuplicateGroup {
    pub fn kept(&self) -> Option<&DuplicateMember> {
        self.members.first()
    }

    pub fn removal_candidates(&self) -> &[DuplicateMember] {
        if self.members.is_empty() {
            &[]
        } else {
            &self.members[1..]
        }
    }
}

pub struct DuplicateCleaner {
    store: Arc<MeasurementStore>,
}

impl DuplicateCleaner {
    pub fn new(store: Arc<MeasurementStore>) -> Self {
        Self { store }
    }

    /// Census of duplicates without touching anything.
    pub fn duplicate_stats(&self) -> Result<DuplicateStats> {
        let started = Instant::now();
        let total_documents = self.store.total_documents()?;
        let groups = self.store.duplicate_groups(None)?;

        let duplicate_groups = groups.len() as u64;
        let total_duplicate_documents: u64 = groups.iter().map(|(_, size)| size).sum();
        let worst_group_size = groups.iter().map(|(_, size)| *size).max().unwrap_or(0);
        let avg_group_size = if duplicate_groups == 0 {
            0.0
        } else {
            total_duplicate_documents as f64 / duplicate_groups as f64
        };

        Ok(DuplicateStats {
            total_documents,
            duplicate_groups,
            total_duplicate_documents,
            documents_that_would_be_removed: total_duplicate_documents - duplicate_groups,
            worst_group_size,
            avg_group_size,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// The `limit` largest duplicate groups, descending by size.
    pub fn sample_duplicates(&self, limit: usize) -> Result<Vec<DuplicateGroup>> {
        Ok(self
            .store
            .duplicate_groups(Some(limit))?
            .into_iter()
            .map(|(key, size)| DuplicateGroup { key, size })
            .collect())
    }

    /// The `limit` largest duplicate groups with full member documents,
    /// exposing kept vs. to-remove.
    pub fn detailed_sample_duplicates(&self, limit: usize) -> Result<Vec<DetailedDuplicateGroup>> {
        let mut detailed = Vec::new();
        for (key, _) in self.store.duplicate_groups(Some(limit))? {
            let members = self
                .store
                .group_members(&key)?
                .into_iter()
                .map(|(id, document)| DuplicateMember { id, document })
                .collect();
            detailed.push(DetailedDuplicateGroup { key, members });
        }
        Ok(detailed)
    }

    /// Remove every duplicate group's non-survivors. With `dry_run` the same
    /// totals are computed and nothing is written. A failure in one group is
    /// logged and the remaining groups still run.
    pub fn cleanup_duplicates(&self, dry_run: bool) -> Result<CleanupResult> {
        let started = Instant::now();
        let groups = self.store.duplicate_groups(None)?;
        let total = groups.len();

        let mut result = CleanupResult {
            duplicate_groups: total as u64,
            duplicate_documents: 0,
            documents_removed: 0,
            duration_ms: 0,
        };

        for (processed, (key, size)) in groups.into_iter().enumerate() {
            result.duplicate_documents += size;
            match self.cleanup_group(&key, dry_run) {
                Ok(removed) => result.documents_removed += removed,
                Err(err) => {
                    tracing::warn!(
                        host = %key.host,
                        metric = %key.metric,
                        %err,
                        "failed to clean duplicate group; continuing with the rest"
                    );
                }
            }
            if (processed + 1) % PROGRESS_EVERY == 0 {
                tracing::info!(processed = processed + 1, total, "duplicate cleanup progress");
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            groups = result.duplicate_groups,
            documents = result.duplicate_documents,
            removed = result.documents_removed,
            dry_run,
            "duplicate cleanup finished"
        );
        Ok(result)
    }

    fn cleanup_group(&self, key: &DuplicateKey, dry_run: bool) -> Result<u64> {
        let ids = self.store.group_member_ids(key)?;
        if ids.len() < 2 {
            return Ok(0);
        }
        let extras = &ids[1..];
        if dry_run {
            return Ok(extras.len() as u64);
        }
        Ok(self.store.delete_by_ids(extras)? as u64)
    }
}
