//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use batchlog::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{BlsError, Result};

// Ingestion
pub use crate::ingest::drain::{DrainOutcome, WorkerState};
pub use crate::ingest::record::{EventContext, EventRecord, LogEvent, LogLevel};
pub use crate::ingest::sink::{Admission, ContextLogger, IngestionSink, SinkStats};

// Storage
#[cfg(feature = "sqlite")]
pub use crate::store::SqliteLogStore;
pub use crate::store::{LogStore, MemoryLogStore, SharedStore, SortOrder};

// Streaming
pub use crate::stream::connection::CloseReason;
pub use crate::stream::filter::{FilterParams, LogFilter};
pub use crate::stream::registry::{StreamRegistry, StreamStatus};
pub use crate::stream::transport::{StreamEvent, StreamSubscription, StreamTransport};

// Wiring
pub use crate::service::{LogSubsystem, ShutdownReport};
