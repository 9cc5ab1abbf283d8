//! Fleet telemetry harvesting pipeline.
//!
//! This crate pulls per-host and per-disk numeric telemetry from a remote
//! monitoring API on a recurring basis, stores it durably while avoiding
//! duplicate ingestion, classifies each time series into a behavioral
//! pattern, and ships a retroactive repair tool for duplicate records that
//! slipped past the live dedup path.
//!
//! ## Architecture
//!
//! The pipeline consists of five components, leaves first:
//!
//! 1. **Timestamp Tracker** (`tracker` module) - A checkpoint cache mapping a
//!    metric-series key to the last timestamp known to be stored, persisted
//!    alongside the measurements so runs pick up where the previous one
//!    stopped.
//!
//! 2. **Measurement Store** (`store` module) - SQLite-backed document store
//!    for measurement and checkpoint records, with the range/latest reads the
//!    collector and the cleanup tool build on.
//!
//! 3. **Idempotent Ingestion** (`ingest` module) - Batched writes with
//!    multi-layer duplicate detection: tracker window, intra-batch set, and a
//!    defensive exact-match probe against the store.
//!
//! 4. **Metrics Collector** (`collector` module) - Orchestrates, per
//!    project/host/partition, the minimal fetch window from the monitoring
//!    API and forwards results to storage and the in-memory aggregates.
//!
//! 5. **Pattern Analyzer** (`analyzer` module) - Pure classifier turning a
//!    numeric sequence into a behavioral category (flat, spiky, trending,
//!    sawtooth).
//!
//! The **Duplicate Cleanup** utility (`cleanup` module) runs independently,
//! directly against the store, with no dependency on collector or tracker
//! state.
//!
//! A run is sequential: projects, processes, then metrics and partitions are
//! processed one at a time. Running concurrent collector instances against
//! the same store is unsupported; per-series timestamp windowing is only
//! ordered within one process.

pub mod analyzer;
pub mod api;
pub mod cleanup;
pub mod collector;
pub mod config;
pub mod error;
pub mod ingest;
pub mod store;
pub mod tracker;

pub use error::{HarvestError, Result};
