//! Drain worker: the single consumer of the ingestion queue.
//!
//! A dedicated thread takes records off the queue and writes them through the
//! [`LogStore`](crate::store::LogStore) one at a time. A failed write is logged
//! and counted, never retried. Shutdown is a bounded handshake: the worker
//! drains whatever is still queued and signals completion; if that does not
//! happen within the join timeout the remainder is abandoned and the thread is
//! left to finish on its own.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, select};
use serde::Serialize;

use crate::core::config::SinkConfig;
use crate::core::errors::{BlsError, Result};
use crate::ingest::record::EventRecord;
use crate::ingest::sink::SinkShared;
use crate::store::{LogStore, SharedStore};

/// Lifecycle of the drain worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum WorkerState {
    Running = 0,
    Draining = 1,
    Stopped = 2,
}

impl WorkerState {
    pub(crate) const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// What happened during [`DrainWorker::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainOutcome {
    /// Records persisted after shutdown was requested, including on an abandoned shutdown.
    pub drained: u64,
    /// Records still queued when the join timeout expired.
    pub abandoned: u64,
    /// The worker finished inside the join timeout.
    pub clean: bool,
}

/// Owner handle for the drain thread.
pub struct DrainWorker {
    shared: Arc<SinkShared>,
    abandon: Arc<AtomicBool>,
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    /// Kept only to measure what is left behind on an abandoned shutdown.
    queue: Receiver<EventRecord>,
    join: Option<thread::JoinHandle<()>>,
    join_timeout: Duration,
}

impl DrainWorker {
    pub fn state(&self) -> WorkerState {
        self.shared.worker_state()
    }

    /// Stop admitting events, drain the queue, and wait up to the join timeout.
    pub fn shutdown(mut self) -> DrainOutcome {
        let persisted_before = self.shared.persisted.load(Ordering::Acquire);
        self.shared.close_admission();
        let _ = self.stop_tx.try_send(());

        let clean = self.done_rx.recv_timeout(self.join_timeout).is_ok();
        let abandoned = if clean {
            if let Some(join) = self.join.take() {
                let _ = join.join();
            }
            0
        } else {
            self.abandon.store(true, Ordering::Release);
            self.queue.len() as u64
        };
        let drained = self
            .shared
            .persisted
            .load(Ordering::Acquire)
            .saturating_sub(persisted_before);

        if !clean {
            tracing::warn!(
                drained,
                abandoned,
                timeout_ms = u64::try_from(self.join_timeout.as_millis()).unwrap_or(u64::MAX),
                "drain worker did not finish in time; abandoning queued records"
            );
            // Detach: the thread exits at its next abandon check.
            drop(self.join.take());
        }
        DrainOutcome {
            drained,
            abandoned,
            clean,
        }
    }
}

pub(crate) fn spawn_drain_worker(
    rx: Receiver<EventRecord>,
    store: SharedStore,
    shared: Arc<SinkShared>,
    config: &SinkConfig,
) -> Result<DrainWorker> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let (done_tx, done_rx) = bounded::<()>(1);
    let abandon = Arc::new(AtomicBool::new(false));

    let thread_rx = rx.clone();
    let thread_shared = Arc::clone(&shared);
    let thread_abandon = Arc::clone(&abandon);
    let poll_timeout = config.drain_poll_timeout();

    let join = thread::Builder::new()
        .name("bls-drain".to_string())
        .spawn(move || {
            drain_thread_main(
                &thread_rx,
                &stop_rx,
                store.as_ref(),
                &thread_shared,
                &thread_abandon,
                poll_timeout,
                &done_tx,
            );
        })
        .map_err(|e| BlsError::Runtime {
            details: format!("failed to spawn drain thread: {e}"),
        })?;

    Ok(DrainWorker {
        shared,
        abandon,
        stop_tx,
        done_rx,
        queue: rx,
        join: Some(join),
        join_timeout: config.shutdown_join_timeout(),
    })
}

// ──────────────────── worker thread ────────────────────

enum Wake {
    Record(EventRecord),
    Stop,
    Idle,
}

fn drain_thread_main(
    rx: &Receiver<EventRecord>,
    stop_rx: &Receiver<()>,
    store: &dyn LogStore,
    shared: &SinkShared,
    abandon: &AtomicBool,
    poll_timeout: Duration,
    done_tx: &Sender<()>,
) {
    let mut last_report = Instant::now();

    loop {
        let wake = select! {
            recv(rx) -> msg => msg.map_or(Wake::Stop, Wake::Record),
            // A dropped owner handle disconnects this channel, which also stops the loop.
            recv(stop_rx) -> _ => Wake::Stop,
            default(poll_timeout) => Wake::Idle,
        };
        match wake {
            Wake::Record(record) => {
                if abandon.load(Ordering::Acquire) {
                    break;
                }
                persist(store, shared, &record);
            }
            Wake::Stop => break,
            Wake::Idle => {}
        }
        if last_report.elapsed() >= poll_timeout {
            report_drops(shared);
            last_report = Instant::now();
        }
    }

    shared.close_admission();
    let mut drained = 0_u64;
    while !abandon.load(Ordering::Acquire) {
        match rx.recv_timeout(Duration::ZERO) {
            Ok(record) => {
                persist(store, shared, &record);
                drained += 1;
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
        }
    }

    report_drops(shared);
    shared.set_worker_state(WorkerState::Stopped);
    tracing::debug!(drained, "drain worker stopped");
    let _ = done_tx.send(());
}

fn persist(store: &dyn LogStore, shared: &SinkShared, record: &EventRecord) {
    match store.insert(record) {
        Ok(_) => {
            shared.persisted.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            shared.persist_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                execution_id = %record.execution_id,
                error_code = e.code(),
                error = %e,
                "failed to persist batch log record; dropping it"
            );
        }
    }
}

fn report_drops(shared: &SinkShared) {
    let dropped = shared.unreported_drops.swap(0, Ordering::Relaxed);
    if dropped > 0 {
        tracing::warn!(
            dropped,
            dropped_total = shared.dropped_total(),
            "batch log events dropped before persistence"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::record::{EventContext, LogEvent, LogLevel};
    use crate::ingest::sink::{Admission, spawn_ingestion};
    use crate::store::{LevelCount, MemoryLogStore, SortOrder};
    use chrono::{DateTime, Utc};

    /// Store whose inserts always fail.
    struct FailingStore;

    impl LogStore for FailingStore {
        fn insert(&self, _record: &EventRecord) -> Result<i64> {
            Err(BlsError::Sql {
                context: "insert",
                details: "disk I/O error".to_string(),
            })
        }
        fn query_by_execution_id(&self, _: &str, _: SortOrder) -> Result<Vec<EventRecord>> {
            Ok(Vec::new())
        }
        fn query_by_job_name(&self, _: &str) -> Result<Vec<EventRecord>> {
            Ok(Vec::new())
        }
        fn query_by_level(&self, _: LogLevel) -> Result<Vec<EventRecord>> {
            Ok(Vec::new())
        }
        fn query_by_time_range(
            &self,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<Vec<EventRecord>> {
            Ok(Vec::new())
        }
        fn query_recent(&self, _: usize) -> Result<Vec<EventRecord>> {
            Ok(Vec::new())
        }
        fn query_by_time_after(&self, _: DateTime<Utc>) -> Result<Vec<EventRecord>> {
            Ok(Vec::new())
        }
        fn query_errors(&self, _: &str) -> Result<Vec<EventRecord>> {
            Ok(Vec::new())
        }
        fn level_counts(&self, _: &str) -> Result<Vec<LevelCount>> {
            Ok(Vec::new())
        }
        fn prune_before(&self, _: DateTime<Utc>) -> Result<usize> {
            Ok(0)
        }
    }

    fn config(capacity: usize, join_timeout_ms: u64) -> SinkConfig {
        SinkConfig {
            queue_capacity: capacity,
            drain_poll_timeout_ms: 20,
            shutdown_join_timeout_ms: join_timeout_ms,
        }
    }

    fn ctx() -> EventContext {
        EventContext::new("202501011200JOBX", "JOBX")
    }

    #[test]
    fn persist_failures_are_counted_and_skipped() {
        let (sink, worker) = spawn_ingestion(&config(16, 2_000), Arc::new(FailingStore)).unwrap();
        for _ in 0..4 {
            sink.submit(&ctx(), LogEvent::new(LogLevel::Warn, "t", "lost"));
        }
        let outcome = worker.shutdown();
        assert!(outcome.clean);
        let stats = sink.stats();
        assert_eq!(stats.accepted, 4);
        assert_eq!(stats.persist_failures, 4);
        assert_eq!(stats.persisted, 0);
    }

    #[test]
    fn shutdown_racing_producers_loses_nothing_accepted() {
        for _ in 0..20 {
            let store = Arc::new(MemoryLogStore::new());
            let (sink, worker) = spawn_ingestion(&config(64, 5_000), store.clone()).unwrap();
            thread::scope(|s| {
                for _ in 0..4 {
                    let sink = sink.clone();
                    s.spawn(move || {
                        let log = sink.scoped(ctx());
                        while log.info("t", "spin") != Admission::Closed {}
                    });
                }
                thread::sleep(Duration::from_millis(2));
                let outcome = worker.shutdown();
                assert!(outcome.clean);
                assert_eq!(outcome.abandoned, 0);
            });
            let stats = sink.stats();
            assert_eq!(stats.accepted, stats.persisted);
            assert_eq!(store.len() as u64, stats.persisted);
            assert_eq!(stats.worker_state, WorkerState::Stopped);
        }
    }

    #[test]
    fn worker_state_transitions() {
        let (_sink, worker) =
            spawn_ingestion(&config(8, 2_000), Arc::new(MemoryLogStore::new())).unwrap();
        assert_eq!(worker.state(), WorkerState::Running);
        let shared = Arc::clone(&worker.shared);
        let outcome = worker.shutdown();
        assert!(outcome.clean);
        assert_eq!(shared.worker_state(), WorkerState::Stopped);
    }
}
