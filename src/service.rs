//! Wiring for the whole subsystem: sink, drain worker, registry, and poller
//! over one shared store, with an ordered shutdown.

#![allow(missing_docs)]

use std::sync::Arc;

use serde::Serialize;

use crate::core::config::Config;
use crate::core::errors::Result;
use crate::ingest::drain::{DrainOutcome, DrainWorker};
use crate::ingest::sink::{IngestionSink, SinkStats, spawn_ingestion};
use crate::store::SharedStore;
use crate::stream::connection::CloseReason;
use crate::stream::registry::StreamRegistry;
use crate::stream::scheduler::PollScheduler;

/// What [`LogSubsystem::shutdown`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    pub connections_closed: usize,
    pub drain: DrainOutcome,
    pub sink: SinkStats,
}

/// A running ingestion and streaming subsystem.
pub struct LogSubsystem {
    sink: IngestionSink,
    drain: DrainWorker,
    registry: Arc<StreamRegistry>,
    scheduler: PollScheduler,
    store: SharedStore,
}

impl LogSubsystem {
    /// Validate `config`, spawn the drain worker and the poller.
    pub fn start(config: &Config, store: SharedStore) -> Result<Self> {
        config.validate()?;
        let config_hash = config.stable_hash()?;
        let (sink, drain) = spawn_ingestion(&config.sink, Arc::clone(&store))?;
        let registry = Arc::new(StreamRegistry::new(
            Arc::clone(&store),
            config.stream.clone(),
        ));
        let scheduler = PollScheduler::spawn(Arc::clone(&registry), &config.stream)?;
        tracing::info!(
            queue_capacity = config.sink.queue_capacity,
            poll_interval_ms = config.stream.poll_interval_ms,
            config_hash = %config_hash,
            "log subsystem started"
        );
        Ok(Self {
            sink,
            drain,
            registry,
            scheduler,
            store,
        })
    }

    pub fn sink(&self) -> &IngestionSink {
        &self.sink
    }

    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Stop polling, close every viewer, then drain the ingestion queue.
    pub fn shutdown(self) -> ShutdownReport {
        self.scheduler.stop();
        let connections_closed = self.registry.close_all(CloseReason::Shutdown);
        let drain = self.drain.shutdown();
        let report = ShutdownReport {
            connections_closed,
            drain,
            sink: self.sink.stats(),
        };
        tracing::info!(
            connections_closed,
            drained = drain.drained,
            abandoned = drain.abandoned,
            dropped = report.sink.dropped(),
            "log subsystem stopped"
        );
        report
    }
}
