//! Event records: one captured log line plus the batch-execution context it
//! was emitted under.
//!
//! Producers never build an [`EventRecord`] directly. They describe the line
//! with a [`LogEvent`] and hand it to the sink together with an explicit
//! [`EventContext`]; the record is captured only if the context carries an
//! execution id.

#![allow(missing_docs)]

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Width of the `yyyyMMddHHmm` prefix of an execution id.
pub const EXECUTION_ID_PREFIX_LEN: usize = 12;

// ──────────────────── level ────────────────────

/// Severity of a captured line.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub const ALL: [Self; 4] = [Self::Debug, Self::Info, Self::Warn, Self::Error];

    /// Canonical upper-case name, as stored.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized level name.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown log level {0:?}")]
pub struct ParseLevelError(pub String);

impl FromStr for LogLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" | "TRACE" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warn),
            "ERROR" | "FATAL" => Ok(Self::Error),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

// ──────────────────── producer-side context ────────────────────

/// Batch-execution context supplied by the producer on every call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    pub execution_id: Option<String>,
    pub job_name: Option<String>,
    pub step_name: Option<String>,
}

impl EventContext {
    pub fn new(execution_id: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self {
            execution_id: Some(execution_id.into()),
            job_name: Some(job_name.into()),
            step_name: None,
        }
    }

    /// Context for a fresh run of `job_name` started at `started_at` (local wall time).
    pub fn for_job_run(job_name: &str, started_at: NaiveDateTime) -> Self {
        Self::new(execution_id_for(job_name, started_at), job_name)
    }

    #[must_use]
    pub fn with_step(mut self, step_name: impl Into<String>) -> Self {
        self.step_name = Some(step_name.into());
        self
    }

    /// The execution id, if present and non-blank.
    pub fn execution_id(&self) -> Option<&str> {
        self.execution_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
    }
}

/// Build an execution id: `yyyyMMddHHmm` of the start time followed by the job name.
pub fn execution_id_for(job_name: &str, started_at: NaiveDateTime) -> String {
    format!("{}{job_name}", started_at.format("%Y%m%d%H%M"))
}

/// One log line as described by a producer, before capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    pub logger_name: String,
    pub thread_name: String,
    pub error_trace: Option<String>,
}

impl LogEvent {
    /// Describe a line emitted by `logger_name` on the calling thread.
    pub fn new(level: LogLevel, logger_name: impl Into<String>, message: impl Into<String>) -> Self {
        let thread_name = std::thread::current()
            .name()
            .map_or_else(|| "unnamed".to_string(), str::to_string);
        Self {
            level,
            message: message.into(),
            logger_name: logger_name.into(),
            thread_name,
            error_trace: None,
        }
    }

    /// Attach the rendered source chain of `err`.
    #[must_use]
    pub fn with_error(mut self, err: &(dyn std::error::Error + 'static)) -> Self {
        self.error_trace = Some(render_error_trace(err));
        self
    }

    #[must_use]
    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }
}

/// Render an error and its `source()` chain, one cause per line.
pub fn render_error_trace(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = format!("{err}\n");
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str("\tcaused by: ");
        out.push_str(&cause.to_string());
        out.push('\n');
        source = cause.source();
    }
    out
}

// ──────────────────── record ────────────────────

/// A captured log line with its execution context.
///
/// `id` and `persisted_at` are assigned by the store; everything else is
/// fixed at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub execution_id: String,
    pub job_name: Option<String>,
    pub step_name: Option<String>,
    pub level: LogLevel,
    pub message: String,
    pub logger_name: String,
    pub thread_name: String,
    pub error_trace: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persisted_at: Option<DateTime<Utc>>,
}

impl EventRecord {
    /// Capture `event` under `ctx`. Returns `None` when the context has no execution id.
    pub fn capture(ctx: &EventContext, event: LogEvent) -> Option<Self> {
        let execution_id = ctx.execution_id()?.to_string();
        Some(Self {
            id: None,
            execution_id,
            job_name: ctx.job_name.clone(),
            step_name: ctx.step_name.clone(),
            level: event.level,
            message: event.message,
            logger_name: event.logger_name,
            thread_name: event.thread_name,
            error_trace: event.error_trace,
            timestamp: capture_timestamp(),
            persisted_at: None,
        })
    }

    /// Case-insensitive substring match over message and logger name.
    pub fn matches_keyword(&self, keyword: &str) -> bool {
        let needle = keyword.to_lowercase();
        self.message.to_lowercase().contains(&needle)
            || self.logger_name.to_lowercase().contains(&needle)
    }
}

static LAST_CAPTURE_MICROS: AtomicI64 = AtomicI64::new(i64::MIN);

/// Current UTC time at microsecond precision, never earlier than any
/// previously captured timestamp in this process.
pub fn capture_timestamp() -> DateTime<Utc> {
    let now = Utc::now().timestamp_micros();
    let previous = LAST_CAPTURE_MICROS.fetch_max(now, Ordering::AcqRel);
    DateTime::from_timestamp_micros(now.max(previous)).unwrap_or_else(Utc::now)
}

/// Truncate to the microsecond precision records are stored at.
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[derive(Debug, Error)]
    #[error("connection refused")]
    struct Root;

    #[derive(Debug, Error)]
    #[error("failed to fetch employees")]
    struct Outer(#[source] Root);

    #[test]
    fn level_parses_case_insensitively_with_aliases() {
        assert_eq!("warn".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!("WARNING".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!(" Error ".parse::<LogLevel>(), Ok(LogLevel::Error));
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Debug.to_string(), "DEBUG");
    }

    #[test]
    fn execution_id_uses_minute_prefix() {
        let at = NaiveDate::from_ymd_opt(2025, 5, 24)
            .unwrap()
            .and_hms_opt(20, 15, 42)
            .unwrap();
        assert_eq!(
            execution_id_for("GET_EMPLOYEE_JOB", at),
            "202505242015GET_EMPLOYEE_JOB"
        );
        let ctx = EventContext::for_job_run("GET_EMPLOYEE_JOB", at).with_step("fetch");
        assert_eq!(ctx.job_name.as_deref(), Some("GET_EMPLOYEE_JOB"));
        assert_eq!(ctx.step_name.as_deref(), Some("fetch"));
    }

    #[test]
    fn capture_requires_execution_id() {
        let event = LogEvent::new(LogLevel::Info, "job.Tasklet", "hello");
        assert!(EventRecord::capture(&EventContext::default(), event.clone()).is_none());

        let blank = EventContext {
            execution_id: Some("   ".to_string()),
            ..EventContext::default()
        };
        assert!(EventRecord::capture(&blank, event.clone()).is_none());

        let ctx = EventContext::new("202501011200JOBX", "JOBX");
        let record = EventRecord::capture(&ctx, event).expect("captured");
        assert_eq!(record.execution_id, "202501011200JOBX");
        assert_eq!(record.job_name.as_deref(), Some("JOBX"));
        assert!(record.id.is_none());
        assert!(record.persisted_at.is_none());
    }

    #[test]
    fn error_trace_renders_source_chain() {
        let event = LogEvent::new(LogLevel::Error, "job", "boom").with_error(&Outer(Root));
        let trace = event.error_trace.expect("trace present");
        assert_eq!(
            trace,
            "failed to fetch employees\n\tcaused by: connection refused\n"
        );
    }

    #[test]
    fn capture_timestamps_never_go_backwards() {
        let stamps: Vec<_> = (0..1_000).map(|_| capture_timestamp()).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
        for ts in stamps {
            assert_eq!(ts, truncate_to_micros(ts));
        }
    }

    #[test]
    fn keyword_matches_message_or_logger() {
        let ctx = EventContext::new("202501011200JOBX", "JOBX");
        let record = EventRecord::capture(
            &ctx,
            LogEvent::new(LogLevel::Info, "com.acme.EmployeeTasklet", "Fetched 42 rows"),
        )
        .unwrap();
        assert!(record.matches_keyword("fetched"));
        assert!(record.matches_keyword("employeetasklet"));
        assert!(!record.matches_keyword("payroll"));
    }

    #[test]
    fn record_serializes_camel_case_without_store_fields() {
        let ctx = EventContext::new("202501011200JOBX", "JOBX");
        let record =
            EventRecord::capture(&ctx, LogEvent::new(LogLevel::Warn, "l", "m")).unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["executionId"], "202501011200JOBX");
        assert_eq!(json["level"], "WARN");
        assert!(json.get("id").is_none());
        assert!(json.get("persistedAt").is_none());
    }
}
