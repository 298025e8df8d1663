//! Shared fixtures: a CLI harness over a private SQLite file and a store
//! that can hold a worker or poller at a chosen call.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use batchlog::core::errors::Result;
use batchlog::ingest::record::{EventRecord, LogLevel};
use batchlog::store::{LevelCount, LogStore, MemoryLogStore, SortOrder};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde_json::Value;
use tempfile::TempDir;

// ──────────────────── CLI ────────────────────

/// One `batchlog` binary bound to a throwaway database.
pub struct CliHarness {
    dir: TempDir,
    db_path: PathBuf,
}

pub struct CliOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CliHarness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("logs").join("batch_log.sqlite3");
        Self { dir, db_path }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Scratch path next to the database.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn run(&self, args: &[&str]) -> CliOutput {
        let output = Command::new(env!("CARGO_BIN_EXE_batchlog"))
            .args(args)
            .env("BLS_SQLITE_DB", &self.db_path)
            .env("BLS_OUTPUT_FORMAT", "json")
            .env("BLS_LOG_LEVEL", "warn")
            .env_remove("RUST_LOG")
            .output()
            .unwrap();
        CliOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }

    /// Seed one record through `batchlog emit`.
    pub fn emit(&self, job: &str, execution_id: &str, level: &str, message: &str) {
        let out = self.run(&[
            "emit",
            "--job",
            job,
            "--execution-id",
            execution_id,
            "--level",
            level,
            message,
        ]);
        out.assert_success();
    }
}

impl CliOutput {
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }

    pub fn assert_success(&self) {
        assert!(
            self.status.success(),
            "exit {:?}\nstdout:\n{}\nstderr:\n{}",
            self.status.code(),
            self.stdout,
            self.stderr
        );
    }

    /// Every JSON document on stdout, one per line.
    pub fn json_lines(&self) -> Vec<Value> {
        self.stdout
            .lines()
            .filter(|line| line.trim_start().starts_with('{'))
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    pub fn last_json(&self) -> Value {
        self.json_lines()
            .pop()
            .unwrap_or_else(|| panic!("no json on stdout; stderr:\n{}", self.stderr))
    }
}

// ──────────────────── gated store ────────────────────

/// Which store call blocks while the gate is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Before the row is written.
    Insert,
    /// After `query_by_time_after` has read its rows, before it returns.
    TimeAfterQuery,
}

/// Test side of a [`GatedStore`].
pub struct GateHandle {
    entered: Receiver<()>,
    release: Sender<()>,
}

impl GateHandle {
    /// Wait until a call is parked at the gate.
    pub fn wait_entered(&self) {
        self.entered.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    /// Let `n` parked or future calls through.
    pub fn release(&self, n: usize) {
        for _ in 0..n {
            self.release.send(()).unwrap();
        }
    }
}

/// Memory store whose gated call parks until the test releases it.
pub struct GatedStore {
    pub inner: MemoryLogStore,
    gate: Gate,
    armed: AtomicBool,
    entered: Sender<()>,
    release: Receiver<()>,
}

impl GatedStore {
    pub fn new(gate: Gate, armed: bool) -> (Arc<Self>, GateHandle) {
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        let store = Arc::new(Self {
            inner: MemoryLogStore::new(),
            gate,
            armed: AtomicBool::new(armed),
            entered: entered_tx,
            release: release_rx,
        });
        let handle = GateHandle {
            entered: entered_rx,
            release: release_tx,
        };
        (store, handle)
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    fn hold(&self, at: Gate) {
        if at == self.gate && self.armed.load(Ordering::Acquire) {
            let _ = self.entered.send(());
            let _ = self.release.recv();
        }
    }
}

impl LogStore for GatedStore {
    fn insert(&self, record: &EventRecord) -> Result<i64> {
        self.hold(Gate::Insert);
        self.inner.insert(record)
    }
    fn query_by_execution_id(&self, id: &str, order: SortOrder) -> Result<Vec<EventRecord>> {
        self.inner.query_by_execution_id(id, order)
    }
    fn query_by_job_name(&self, job: &str) -> Result<Vec<EventRecord>> {
        self.inner.query_by_job_name(job)
    }
    fn query_by_level(&self, level: LogLevel) -> Result<Vec<EventRecord>> {
        self.inner.query_by_level(level)
    }
    fn query_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>> {
        self.inner.query_by_time_range(start, end)
    }
    fn query_recent(&self, limit: usize) -> Result<Vec<EventRecord>> {
        self.inner.query_recent(limit)
    }
    fn query_by_time_after(&self, after: DateTime<Utc>) -> Result<Vec<EventRecord>> {
        let rows = self.inner.query_by_time_after(after);
        self.hold(Gate::TimeAfterQuery);
        rows
    }
    fn query_errors(&self, id: &str) -> Result<Vec<EventRecord>> {
        self.inner.query_errors(id)
    }
    fn level_counts(&self, id: &str) -> Result<Vec<LevelCount>> {
        self.inner.level_counts(id)
    }
    fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.inner.prune_before(cutoff)
    }
}
