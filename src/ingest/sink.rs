//! Ingestion sink: the producer-facing entry point.
//!
//! Producers on any thread call [`IngestionSink::submit`] with an explicit
//! [`EventContext`]. The record is captured and offered to a bounded crossbeam
//! channel with `try_send()`, so the caller never blocks on persistence. Every
//! event that is not admitted is counted, and the drain worker reports the
//! running drop count through `tracing`.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crossbeam_channel::{Sender, TrySendError, bounded};
use parking_lot::RwLock;
use serde::Serialize;

use crate::core::config::SinkConfig;
use crate::core::errors::Result;
use crate::ingest::drain::{self, DrainWorker, WorkerState};
use crate::ingest::record::{EventContext, EventRecord, LogEvent, LogLevel};
use crate::store::SharedStore;

// ──────────────────── admission ────────────────────

/// Outcome of offering one event to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Enqueued for persistence.
    Accepted,
    /// The context carried no execution id; nothing was captured.
    MissingExecutionId,
    /// The queue was at capacity; the event was dropped.
    QueueFull,
    /// The drain worker is shutting down or gone.
    Closed,
}

impl Admission {
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted)
    }
}

// ──────────────────── shared state ────────────────────

/// Counters and lifecycle flags shared by every sink clone and the drain worker.
#[derive(Debug, Default)]
pub(crate) struct SinkShared {
    pub(crate) state: AtomicU8,
    /// Producers hold the read side from state check to send.
    pub(crate) admission: RwLock<()>,
    pub(crate) accepted: AtomicU64,
    pub(crate) dropped_missing_context: AtomicU64,
    pub(crate) dropped_queue_full: AtomicU64,
    pub(crate) dropped_closed: AtomicU64,
    /// Drops not yet reported by the worker.
    pub(crate) unreported_drops: AtomicU64,
    pub(crate) persisted: AtomicU64,
    pub(crate) persist_failures: AtomicU64,
}

impl SinkShared {
    pub(crate) fn worker_state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_worker_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move `Running` to `Draining`. Returns once no producer is mid-admission.
    pub(crate) fn close_admission(&self) {
        let _gate = self.admission.write();
        let _ = self.state.compare_exchange(
            WorkerState::Running as u8,
            WorkerState::Draining as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn record_drop(&self, admission: Admission) {
        let counter = match admission {
            Admission::Accepted => return,
            Admission::MissingExecutionId => &self.dropped_missing_context,
            Admission::QueueFull => &self.dropped_queue_full,
            Admission::Closed => &self.dropped_closed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.unreported_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dropped_total(&self) -> u64 {
        self.dropped_missing_context.load(Ordering::Relaxed)
            + self.dropped_queue_full.load(Ordering::Relaxed)
            + self.dropped_closed.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of sink and drain counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkStats {
    pub accepted: u64,
    pub dropped_missing_context: u64,
    pub dropped_queue_full: u64,
    pub dropped_closed: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub worker_state: WorkerState,
}

impl SinkStats {
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped_missing_context + self.dropped_queue_full + self.dropped_closed
    }
}

// ──────────────────── public handle ────────────────────

/// Thread-safe, cheaply-cloneable producer handle.
#[derive(Clone)]
pub struct IngestionSink {
    tx: Sender<EventRecord>,
    shared: Arc<SinkShared>,
}

impl IngestionSink {
    /// Capture `event` under `ctx` and enqueue it. Never blocks.
    pub fn submit(&self, ctx: &EventContext, event: LogEvent) -> Admission {
        match EventRecord::capture(ctx, event) {
            Some(record) => self.submit_record(record),
            None => {
                self.shared.record_drop(Admission::MissingExecutionId);
                Admission::MissingExecutionId
            }
        }
    }

    /// Enqueue an already captured record. Never waits on the queue.
    pub fn submit_record(&self, record: EventRecord) -> Admission {
        let admission = if record.execution_id.trim().is_empty() {
            Admission::MissingExecutionId
        } else {
            self.offer(record)
        };
        if admission.is_accepted() {
            self.shared.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.shared.record_drop(admission);
        }
        admission
    }

    fn offer(&self, record: EventRecord) -> Admission {
        // Shutdown flips the state under the write side, so an accepted
        // record is always in the queue before the final drain starts.
        let _gate = self.shared.admission.read();
        if self.shared.worker_state() != WorkerState::Running {
            return Admission::Closed;
        }
        match self.tx.try_send(record) {
            Ok(()) => Admission::Accepted,
            Err(TrySendError::Full(_)) => Admission::QueueFull,
            Err(TrySendError::Disconnected(_)) => Admission::Closed,
        }
    }

    /// A logger bound to one execution context.
    pub fn scoped(&self, ctx: EventContext) -> ContextLogger {
        ContextLogger {
            sink: self.clone(),
            ctx,
        }
    }

    /// Total events not admitted, for any reason.
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped_total()
    }

    pub fn queue_depth(&self) -> usize {
        self.tx.len()
    }

    pub fn stats(&self) -> SinkStats {
        let s = &self.shared;
        SinkStats {
            accepted: s.accepted.load(Ordering::Relaxed),
            dropped_missing_context: s.dropped_missing_context.load(Ordering::Relaxed),
            dropped_queue_full: s.dropped_queue_full.load(Ordering::Relaxed),
            dropped_closed: s.dropped_closed.load(Ordering::Relaxed),
            persisted: s.persisted.load(Ordering::Relaxed),
            persist_failures: s.persist_failures.load(Ordering::Relaxed),
            queue_depth: self.tx.len(),
            queue_capacity: self.tx.capacity().unwrap_or(0),
            worker_state: s.worker_state(),
        }
    }
}

// ──────────────────── scoped logger ────────────────────

/// Convenience front for code running inside one batch execution.
#[derive(Clone)]
pub struct ContextLogger {
    sink: IngestionSink,
    ctx: EventContext,
}

impl ContextLogger {
    pub fn context(&self) -> &EventContext {
        &self.ctx
    }

    /// Same sink, different step.
    #[must_use]
    pub fn for_step(&self, step_name: impl Into<String>) -> Self {
        Self {
            sink: self.sink.clone(),
            ctx: self.ctx.clone().with_step(step_name),
        }
    }

    pub fn log(&self, event: LogEvent) -> Admission {
        self.sink.submit(&self.ctx, event)
    }

    pub fn debug(&self, logger_name: &str, message: impl Into<String>) -> Admission {
        self.log(LogEvent::new(LogLevel::Debug, logger_name, message))
    }

    pub fn info(&self, logger_name: &str, message: impl Into<String>) -> Admission {
        self.log(LogEvent::new(LogLevel::Info, logger_name, message))
    }

    pub fn warn(&self, logger_name: &str, message: impl Into<String>) -> Admission {
        self.log(LogEvent::new(LogLevel::Warn, logger_name, message))
    }

    pub fn error(&self, logger_name: &str, message: impl Into<String>) -> Admission {
        self.log(LogEvent::new(LogLevel::Error, logger_name, message))
    }

    /// ERROR line carrying the rendered source chain of `err`.
    pub fn error_with(
        &self,
        logger_name: &str,
        message: impl Into<String>,
        err: &(dyn std::error::Error + 'static),
    ) -> Admission {
        self.log(LogEvent::new(LogLevel::Error, logger_name, message).with_error(err))
    }
}

// ──────────────────── spawn ────────────────────

/// Create the bounded queue, spawn the drain worker, and return the producer handle.
///
/// The sink is `Clone + Send` and can be shared across threads. The worker
/// runs until [`DrainWorker::shutdown`] is called.
pub fn spawn_ingestion(config: &SinkConfig, store: SharedStore) -> Result<(IngestionSink, DrainWorker)> {
    let (tx, rx) = bounded::<EventRecord>(config.queue_capacity);
    let shared = Arc::new(SinkShared::default());
    shared.set_worker_state(WorkerState::Running);

    let worker = drain::spawn_drain_worker(rx, store, Arc::clone(&shared), config)?;
    Ok((IngestionSink { tx, shared }, worker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LogStore, MemoryLogStore, SortOrder};

    fn small_config(capacity: usize) -> SinkConfig {
        SinkConfig {
            queue_capacity: capacity,
            drain_poll_timeout_ms: 20,
            shutdown_join_timeout_ms: 2_000,
        }
    }

    #[test]
    fn submitted_events_are_persisted_on_shutdown() {
        let store = Arc::new(MemoryLogStore::new());
        let (sink, worker) = spawn_ingestion(&small_config(64), store.clone()).unwrap();
        let log = sink.scoped(EventContext::new("202501011200JOBX", "JOBX"));
        for i in 0..10 {
            assert_eq!(log.info("test.Logger", format!("line {i}")), Admission::Accepted);
        }
        let outcome = worker.shutdown();
        assert!(outcome.clean);

        let rows = store
            .query_by_execution_id("202501011200JOBX", SortOrder::Ascending)
            .unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0].message, "line 0");
        assert_eq!(sink.stats().persisted, 10);
    }

    #[test]
    fn missing_execution_id_is_counted_not_queued() {
        let store = Arc::new(MemoryLogStore::new());
        let (sink, worker) = spawn_ingestion(&small_config(8), store.clone()).unwrap();
        let admission = sink.submit(
            &EventContext::default(),
            LogEvent::new(LogLevel::Info, "x", "no context"),
        );
        assert_eq!(admission, Admission::MissingExecutionId);
        assert_eq!(sink.dropped_events(), 1);
        assert_eq!(sink.stats().dropped_missing_context, 1);
        worker.shutdown();
        assert!(store.is_empty());
    }

    #[test]
    fn submit_after_shutdown_is_closed() {
        let store = Arc::new(MemoryLogStore::new());
        let (sink, worker) = spawn_ingestion(&small_config(8), store).unwrap();
        worker.shutdown();
        let ctx = EventContext::new("202501011200JOBX", "JOBX");
        assert_eq!(
            sink.submit(&ctx, LogEvent::new(LogLevel::Info, "x", "late")),
            Admission::Closed
        );
        assert_eq!(sink.stats().dropped_closed, 1);
    }

    #[test]
    fn step_scoped_logger_carries_step() {
        let store = Arc::new(MemoryLogStore::new());
        let (sink, worker) = spawn_ingestion(&small_config(8), store.clone()).unwrap();
        let log = sink
            .scoped(EventContext::new("202501011200JOBX", "JOBX"))
            .for_step("fetchEmployees");
        log.error_with(
            "test.Step",
            "fetch failed",
            &std::io::Error::other("connection reset"),
        );
        worker.shutdown();
        let rows = store.query_errors("202501011200JOBX").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].step_name.as_deref(), Some("fetchEmployees"));
        assert!(rows[0].error_trace.as_deref().unwrap().contains("connection reset"));
    }
}
