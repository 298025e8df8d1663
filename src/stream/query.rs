//! Translating filters into store queries.

use chrono::{DateTime, Utc};

use crate::core::errors::Result;
use crate::ingest::record::EventRecord;
use crate::store::{LogStore, SortOrder};
use crate::stream::filter::{LogFilter, resolve_job_name};

/// One-shot snapshot for any filter, newest first.
///
/// A single primary predicate is chosen in priority order: execution id, job
/// name, level, time range, and otherwise the most recent `recent_limit`
/// records. The keyword is applied on top of whichever was chosen. A range
/// with only one bound is open on the other side.
pub fn one_shot(
    store: &dyn LogStore,
    filter: &LogFilter,
    recent_limit: usize,
) -> Result<Vec<EventRecord>> {
    let mut records = if let Some(execution_id) = filter.execution_id() {
        store.query_by_execution_id(execution_id, SortOrder::Descending)?
    } else if let Some(job_name) = filter.job_name() {
        store.query_by_job_name(job_name)?
    } else if let Some(level) = filter.level {
        store.query_by_level(level)?
    } else if filter.start_time.is_some() || filter.end_time.is_some() {
        store.query_by_time_range(
            filter.start_time.unwrap_or(DateTime::<Utc>::MIN_UTC),
            filter.end_time.unwrap_or(DateTime::<Utc>::MAX_UTC),
        )?
    } else {
        store.query_recent(recent_limit)?
    };
    filter.retain_keyword(&mut records);
    Ok(records)
}

/// Records newer than `watermark` for a simple filter, newest first.
///
/// An execution-only filter follows the whole job (every run sharing the job
/// name), not just the one execution; if the job name cannot be recovered it
/// falls back to the execution itself.
pub fn incremental(
    store: &dyn LogStore,
    filter: &LogFilter,
    watermark: DateTime<Utc>,
) -> Result<Vec<EventRecord>> {
    let Some(execution_id) = filter.execution_id() else {
        return store.query_by_time_after(watermark);
    };
    let candidates = match resolve_job_name(execution_id) {
        Some(job_name) => store.query_by_job_name(job_name)?,
        None => store.query_by_execution_id(execution_id, SortOrder::Descending)?,
    };
    Ok(candidates
        .into_iter()
        .filter(|r| r.timestamp > watermark)
        .collect())
}
