//! In-memory store for embedding and tests.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{LevelCount, LogStore, SortOrder, sort_records};
use crate::core::errors::Result;
use crate::ingest::record::{EventRecord, LogLevel, truncate_to_micros};

/// Vec-backed [`LogStore`]. Unbounded; pair with [`LogStore::prune_before`].
#[derive(Default)]
pub struct MemoryLogStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    rows: Vec<EventRecord>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select<F>(&self, order: SortOrder, predicate: F) -> Vec<EventRecord>
    where
        F: Fn(&EventRecord) -> bool,
    {
        let mut out: Vec<EventRecord> = self
            .inner
            .read()
            .rows
            .iter()
            .filter(|r| predicate(r))
            .cloned()
            .collect();
        sort_records(&mut out, order);
        out
    }
}

impl LogStore for MemoryLogStore {
    fn insert(&self, record: &EventRecord) -> Result<i64> {
        let mut inner = self.inner.write();
        inner.next_id += 1;
        let id = inner.next_id;
        let mut row = record.clone();
        row.id = Some(id);
        row.timestamp = truncate_to_micros(row.timestamp);
        row.persisted_at = Some(truncate_to_micros(Utc::now()));
        inner.rows.push(row);
        Ok(id)
    }

    fn query_by_execution_id(
        &self,
        execution_id: &str,
        order: SortOrder,
    ) -> Result<Vec<EventRecord>> {
        Ok(self.select(order, |r| r.execution_id == execution_id))
    }

    fn query_by_job_name(&self, job_name: &str) -> Result<Vec<EventRecord>> {
        Ok(self.select(SortOrder::Descending, |r| {
            r.job_name.as_deref() == Some(job_name)
        }))
    }

    fn query_by_level(&self, level: LogLevel) -> Result<Vec<EventRecord>> {
        Ok(self.select(SortOrder::Descending, |r| r.level == level))
    }

    fn query_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>> {
        Ok(self.select(SortOrder::Descending, |r| {
            r.timestamp >= start && r.timestamp <= end
        }))
    }

    fn query_recent(&self, limit: usize) -> Result<Vec<EventRecord>> {
        let mut out = self.select(SortOrder::Descending, |_| true);
        out.truncate(limit);
        Ok(out)
    }

    fn query_by_time_after(&self, after: DateTime<Utc>) -> Result<Vec<EventRecord>> {
        Ok(self.select(SortOrder::Descending, |r| r.timestamp > after))
    }

    fn query_errors(&self, execution_id: &str) -> Result<Vec<EventRecord>> {
        Ok(self.select(SortOrder::Ascending, |r| {
            r.execution_id == execution_id && r.level >= LogLevel::Warn
        }))
    }

    fn level_counts(&self, execution_id: &str) -> Result<Vec<LevelCount>> {
        let mut counts: BTreeMap<LogLevel, u64> = BTreeMap::new();
        for row in &self.inner.read().rows {
            if row.execution_id == execution_id {
                *counts.entry(row.level).or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|(level, count)| LevelCount { level, count })
            .collect())
    }

    fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.write();
        let before = inner.rows.len();
        inner.rows.retain(|r| r.timestamp >= cutoff);
        Ok(before - inner.rows.len())
    }
}
