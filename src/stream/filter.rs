//! Viewer filters and their classification.
//!
//! A filter is *simple* when it is empty or names only an execution id. Simple
//! filters are served incrementally by the poll scheduler; anything else is
//! *complex* and served as one-shot snapshots.

#![allow(missing_docs)]

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ingest::record::{EXECUTION_ID_PREFIX_LEN, EventRecord, LogLevel};

/// Criteria a viewer attaches to a stream or a one-shot query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    pub execution_id: Option<String>,
    pub job_name: Option<String>,
    pub level: Option<LogLevel>,
    pub keyword: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// How a filter is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// No criteria: the live tail of everything.
    Empty,
    /// Only an execution id: the live tail of that job.
    ExecutionOnly,
    /// Any other combination: snapshots on demand.
    Complex,
}

impl LogFilter {
    pub fn for_execution(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: Some(execution_id.into()),
            ..Self::default()
        }
    }

    pub fn execution_id(&self) -> Option<&str> {
        non_blank(self.execution_id.as_deref())
    }

    pub fn job_name(&self) -> Option<&str> {
        non_blank(self.job_name.as_deref())
    }

    pub fn keyword(&self) -> Option<&str> {
        non_blank(self.keyword.as_deref())
    }

    pub fn kind(&self) -> FilterKind {
        let others = self.job_name().is_some()
            || self.level.is_some()
            || self.keyword().is_some()
            || self.start_time.is_some()
            || self.end_time.is_some();
        match (self.execution_id().is_some(), others) {
            (false, false) => FilterKind::Empty,
            (true, false) => FilterKind::ExecutionOnly,
            (_, true) => FilterKind::Complex,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind() == FilterKind::Empty
    }

    pub fn is_simple(&self) -> bool {
        self.kind() != FilterKind::Complex
    }

    /// Apply the keyword predicate, if any.
    pub(crate) fn retain_keyword(&self, records: &mut Vec<EventRecord>) {
        if let Some(keyword) = self.keyword() {
            records.retain(|r| r.matches_keyword(keyword));
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

// ──────────────────── job-name resolution ────────────────────

/// Recover the job name from an execution id of the form `yyyyMMddHHmm<job>`.
///
/// Counts the leading run of ASCII digits; the job name is everything after it
/// if that run is at least twelve long and something follows. A job name that
/// itself starts with a digit is indistinguishable from the prefix and gets
/// truncated.
pub fn resolve_job_name(execution_id: &str) -> Option<&str> {
    let digits = execution_id
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits < EXECUTION_ID_PREFIX_LEN || digits == execution_id.len() {
        return None;
    }
    Some(&execution_id[digits..])
}

// ──────────────────── raw request parameters ────────────────────

/// Filter as received from a request: every field an optional string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterParams {
    pub execution_id: Option<String>,
    pub job_name: Option<String>,
    #[serde(alias = "logLevel")]
    pub level: Option<String>,
    pub keyword: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

impl From<&FilterParams> for LogFilter {
    /// Blank values become absent. Unparseable levels or times are logged and dropped.
    fn from(params: &FilterParams) -> Self {
        let owned = |v: &Option<String>| non_blank(v.as_deref()).map(|s| s.trim().to_string());
        Self {
            execution_id: owned(&params.execution_id),
            job_name: owned(&params.job_name),
            level: non_blank(params.level.as_deref()).and_then(|raw| match raw.parse() {
                Ok(level) => Some(level),
                Err(e) => {
                    tracing::warn!(value = raw, error = %e, "ignoring unparseable level filter");
                    None
                }
            }),
            keyword: owned(&params.keyword),
            start_time: parse_param_time("startTime", params.start_time.as_deref()),
            end_time: parse_param_time("endTime", params.end_time.as_deref()),
        }
    }
}

fn parse_param_time(field: &'static str, raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = non_blank(raw)?;
    let parsed = parse_filter_time(raw);
    if parsed.is_none() {
        tracing::warn!(field, value = raw, "ignoring unparseable time filter");
    }
    parsed
}

/// Parse an ISO-8601 date-time. Values without an offset are taken as UTC.
pub fn parse_filter_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
