//! Persistence port for event records.
//!
//! The drain worker writes through [`LogStore::insert`]; the stream registry
//! and the CLI read through the query operations. Implementations must be
//! safe to call from the drain thread and the poll workers concurrently.

#![allow(missing_docs)]

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::errors::Result;
use crate::ingest::record::{EventRecord, LogLevel};

pub use memory::MemoryLogStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLogStore;

/// Sort direction by record timestamp. Ties break on store id in the same direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

/// Number of records at one level for an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelCount {
    pub level: LogLevel,
    pub count: u64,
}

/// Durable record store.
///
/// Every query returns fully populated records (store id and persistence
/// time included). Unless stated otherwise results are newest first.
pub trait LogStore: Send + Sync {
    /// Persist one record and return its assigned id. The store stamps
    /// `persisted_at`; any id or persistence time on the input is ignored.
    fn insert(&self, record: &EventRecord) -> Result<i64>;

    fn query_by_execution_id(&self, execution_id: &str, order: SortOrder)
    -> Result<Vec<EventRecord>>;

    fn query_by_job_name(&self, job_name: &str) -> Result<Vec<EventRecord>>;

    fn query_by_level(&self, level: LogLevel) -> Result<Vec<EventRecord>>;

    /// Records with `start <= timestamp <= end`.
    fn query_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>>;

    fn query_recent(&self, limit: usize) -> Result<Vec<EventRecord>>;

    /// Records with `timestamp > after` (strict).
    fn query_by_time_after(&self, after: DateTime<Utc>) -> Result<Vec<EventRecord>>;

    /// WARN and ERROR records of one execution, oldest first.
    fn query_errors(&self, execution_id: &str) -> Result<Vec<EventRecord>>;

    /// Per-level counts for one execution, in level order. Levels with no records are omitted.
    fn level_counts(&self, execution_id: &str) -> Result<Vec<LevelCount>>;

    /// Delete records with `timestamp < cutoff`; returns the number removed.
    fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Shared handle type used across the subsystem.
pub type SharedStore = Arc<dyn LogStore>;

/// Sort by timestamp, breaking ties on id.
pub(crate) fn sort_records(records: &mut [EventRecord], order: SortOrder) {
    records.sort_by(|a, b| {
        let ord = a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id));
        match order {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        }
    });
}
