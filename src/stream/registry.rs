//! Stream registry: the set of live viewer connections, their filters, and
//! their delivery watermarks.
//!
//! The three pieces of per-connection state live in separate concurrent maps
//! keyed by connection id, so opening, closing, re-filtering and polling
//! different connections never contend on one lock. No map guard is held
//! across a store query or a push.
//!
//! Delivery rules:
//! - Opening a connection sends `connected`, then catches up immediately.
//! - Simple filters are polled each tick for records strictly newer than the
//!   watermark; the watermark advances to the newest delivered timestamp only
//!   after the push succeeds.
//! - Complex filters get one snapshot per open or filter update and are
//!   skipped by the poller.
//! - A failed push closes the connection. A failed query is logged and the
//!   connection is kept.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::core::config::StreamConfig;
use crate::core::errors::{BlsError, Result};
use crate::ingest::record::EventRecord;
use crate::store::SharedStore;
use crate::stream::connection::{CloseReason, Connection};
use crate::stream::filter::{FilterKind, LogFilter};
use crate::stream::query;
use crate::stream::transport::{StreamEvent, StreamSubscription, StreamTransport, channel_transport};

/// Snapshot of registry health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub active_connections: usize,
    pub timestamp: DateTime<Utc>,
}

/// Result of polling one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// This many records were pushed.
    Delivered(usize),
    /// Nothing newer than the watermark.
    Idle,
    /// Complex filter; served by snapshots only.
    SnapshotOnly,
    /// Another poll of the same connection is in flight.
    Busy,
    /// The connection is no longer registered.
    Gone,
    /// The store query failed; the connection was kept.
    QueryFailed,
    /// The push failed; the connection was closed.
    Closed(CloseReason),
}

/// Aggregate of one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickSummary {
    pub polled: usize,
    pub delivered_records: usize,
    pub idle: usize,
    pub skipped: usize,
    pub query_failures: usize,
    pub closed: usize,
}

impl TickSummary {
    fn record(&mut self, outcome: PollOutcome) {
        self.polled += 1;
        match outcome {
            PollOutcome::Delivered(n) => self.delivered_records += n,
            PollOutcome::Idle => self.idle += 1,
            PollOutcome::SnapshotOnly | PollOutcome::Busy | PollOutcome::Gone => self.skipped += 1,
            PollOutcome::QueryFailed => self.query_failures += 1,
            PollOutcome::Closed(_) => self.closed += 1,
        }
    }
}

/// Live viewer connections and their delivery state.
pub struct StreamRegistry {
    connections: DashMap<String, Arc<Connection>>,
    watermarks: DashMap<String, DateTime<Utc>>,
    filters: DashMap<String, LogFilter>,
    store: SharedStore,
    config: StreamConfig,
}

impl StreamRegistry {
    pub fn new(store: SharedStore, config: StreamConfig) -> Self {
        Self {
            connections: DashMap::new(),
            watermarks: DashMap::new(),
            filters: DashMap::new(),
            store,
            config,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    // ──────────────────── lifecycle ────────────────────

    /// Register a viewer and deliver the acknowledgement plus an initial catch-up.
    ///
    /// A missing or blank id gets a random one. Returns the id in use.
    pub fn open(
        &self,
        connection_id: Option<String>,
        filter: LogFilter,
        transport: Box<dyn StreamTransport>,
    ) -> Result<String> {
        let id = connection_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection = Arc::new(Connection::new(id.clone(), transport));
        let kind = filter.kind();
        let watermark = Utc::now()
            .checked_sub_signed(self.config.lookback())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        // Held from before registration so no poll tick can push ahead of `connected`.
        let guard = connection.begin();
        match self.connections.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(BlsError::DuplicateConnection { connection_id: id });
            }
            Entry::Vacant(slot) => {
                self.filters.insert(id.clone(), filter.clone());
                self.watermarks.insert(id.clone(), watermark);
                slot.insert(Arc::clone(&connection));
            }
        }
        tracing::info!(connection_id = %id, filter_kind = ?kind, "stream connection opened");

        let delivered = self
            .push_or_close(&connection, StreamEvent::connected(&id))
            .and_then(|()| match kind {
                FilterKind::Complex => self.push_snapshot(&connection, &filter),
                FilterKind::Empty | FilterKind::ExecutionOnly => {
                    self.deliver_new(&connection).map(|_| ())
                }
            });
        drop(guard);
        delivered.map(|()| id)
    }

    /// [`open`](Self::open) over an in-process channel; returns the viewer end.
    pub fn open_channel(
        &self,
        connection_id: Option<String>,
        filter: LogFilter,
    ) -> Result<StreamSubscription> {
        let id = connection_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (transport, subscription) = channel_transport(
            id.clone(),
            self.config.channel_capacity,
            self.config.push_timeout(),
        );
        self.open(Some(id), filter, Box::new(transport))?;
        Ok(subscription)
    }

    /// Replace a connection's filter.
    ///
    /// A complex filter gets one fresh snapshot right away (even an empty
    /// one). A simple filter is picked up by the next poll tick against the
    /// existing watermark.
    pub fn update_filter(&self, connection_id: &str, filter: LogFilter) -> Result<()> {
        let unknown = || BlsError::UnknownConnection {
            connection_id: connection_id.to_string(),
        };
        let connection = self
            .connections
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(unknown)?;

        let guard = connection.begin();
        match self.filters.get_mut(connection_id) {
            Some(mut current) => *current = filter.clone(),
            None => return Err(unknown()),
        }
        let kind = filter.kind();
        tracing::debug!(connection_id, filter_kind = ?kind, "stream filter updated");
        let pushed = if kind == FilterKind::Complex {
            self.push_snapshot(&connection, &filter)
        } else {
            Ok(())
        };
        drop(guard);
        pushed
    }

    /// Close and forget a connection. Returns `false` if it was not registered.
    pub fn close(&self, connection_id: &str) -> bool {
        self.close_with(connection_id, CloseReason::Explicit)
    }

    /// Idempotent close. Removes all per-connection state and completes the transport.
    pub fn close_with(&self, connection_id: &str, reason: CloseReason) -> bool {
        let removed = self.connections.remove(connection_id);
        self.watermarks.remove(connection_id);
        self.filters.remove(connection_id);

        let Some((_, connection)) = removed else {
            return false;
        };
        if connection.shut() {
            tracing::info!(connection_id, reason = %reason, "stream connection closed");
        }
        true
    }

    /// Close every connection; returns how many were open.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter(|id| self.close_with(id, reason))
            .count()
    }

    // ──────────────────── introspection ────────────────────

    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            active_connections: self.connections.len(),
            timestamp: Utc::now(),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    pub fn watermark(&self, connection_id: &str) -> Option<DateTime<Utc>> {
        self.watermarks.get(connection_id).map(|w| *w)
    }

    pub fn filter(&self, connection_id: &str) -> Option<LogFilter> {
        self.filters.get(connection_id).map(|f| f.clone())
    }

    /// One-shot query outside any connection.
    pub fn query(&self, filter: &LogFilter) -> Result<Vec<EventRecord>> {
        query::one_shot(self.store.as_ref(), filter, self.config.recent_limit)
    }

    // ──────────────────── polling ────────────────────

    /// Poll one connection for new records. Skips if a poll of it is already running.
    pub fn poll_connection(&self, connection_id: &str) -> PollOutcome {
        let Some(connection) = self
            .connections
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return PollOutcome::Gone;
        };
        self.poll_guarded(&connection)
    }

    /// Poll every registered connection once, up to `poll_parallelism` at a time.
    pub fn tick(&self) -> TickSummary {
        let live: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let summary = Mutex::new(TickSummary::default());
        if live.is_empty() {
            return summary.into_inner();
        }

        let workers = self.config.poll_parallelism.clamp(1, live.len());
        if workers == 1 {
            for connection in &live {
                summary.lock().record(self.poll_guarded(connection));
            }
        } else {
            let next = AtomicUsize::new(0);
            std::thread::scope(|scope| {
                for _ in 0..workers {
                    scope.spawn(|| {
                        loop {
                            let idx = next.fetch_add(1, Ordering::Relaxed);
                            let Some(connection) = live.get(idx) else {
                                break;
                            };
                            let outcome = self.poll_guarded(connection);
                            summary.lock().record(outcome);
                        }
                    });
                }
            });
        }

        let summary = summary.into_inner();
        if summary.delivered_records > 0 || summary.closed > 0 || summary.query_failures > 0 {
            tracing::debug!(
                polled = summary.polled,
                delivered = summary.delivered_records,
                closed = summary.closed,
                query_failures = summary.query_failures,
                "stream poll tick"
            );
        }
        summary
    }

    fn poll_guarded(&self, connection: &Connection) -> PollOutcome {
        let Some(_guard) = connection.try_begin() else {
            return PollOutcome::Busy;
        };
        self.poll_locked(connection)
    }

    /// Incremental delivery for a simple filter. Caller holds the connection's busy guard.
    fn poll_locked(&self, connection: &Connection) -> PollOutcome {
        match self.deliver_new(connection) {
            Ok(outcome) => outcome,
            Err(e) => PollOutcome::Closed(CloseReason::from_push_error(&e)),
        }
    }

    /// Query past the watermark and push what is new. `Err` means the push
    /// failed and the connection is already closed.
    fn deliver_new(&self, connection: &Connection) -> Result<PollOutcome> {
        let id = connection.id();
        if !connection.is_alive() {
            return Ok(PollOutcome::Gone);
        }
        let Some(filter) = self.filter(id) else {
            return Ok(PollOutcome::Gone);
        };
        if !filter.is_simple() {
            return Ok(PollOutcome::SnapshotOnly);
        }
        let Some(watermark) = self.watermark(id) else {
            return Ok(PollOutcome::Gone);
        };

        let records = match query::incremental(self.store.as_ref(), &filter, watermark) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(
                    connection_id = %id,
                    error_code = e.code(),
                    error = %e,
                    "incremental stream query failed"
                );
                return Ok(PollOutcome::QueryFailed);
            }
        };
        // Closed while the query ran.
        if !connection.is_alive() {
            return Ok(PollOutcome::Gone);
        }
        let Some(newest) = records.iter().map(|r| r.timestamp).max() else {
            return Ok(PollOutcome::Idle);
        };
        let count = records.len();

        self.push_or_close(connection, StreamEvent::Logs(records))?;
        if let Some(mut current) = self.watermarks.get_mut(id) {
            if newest > *current {
                *current = newest;
            }
        }
        Ok(PollOutcome::Delivered(count))
    }

    /// Snapshot delivery for a complex filter. Does not touch the watermark.
    ///
    /// A failed query is logged and leaves the connection open.
    fn push_snapshot(&self, connection: &Connection, filter: &LogFilter) -> Result<()> {
        match query::one_shot(self.store.as_ref(), filter, self.config.recent_limit) {
            Ok(records) => self.push_or_close(connection, StreamEvent::Logs(records)),
            Err(e) => {
                tracing::warn!(
                    connection_id = %connection.id(),
                    error_code = e.code(),
                    error = %e,
                    "stream snapshot query failed"
                );
                Ok(())
            }
        }
    }

    /// Push one event. A failed push on a live connection closes it.
    fn push_or_close(&self, connection: &Connection, event: StreamEvent) -> Result<()> {
        connection.push(event).map_err(|e| {
            if connection.is_alive() {
                tracing::warn!(
                    connection_id = %connection.id(),
                    error_code = e.code(),
                    error = %e,
                    "stream push failed; dropping connection"
                );
                self.close_with(connection.id(), CloseReason::from_push_error(&e));
            }
            e
        })
    }
}
