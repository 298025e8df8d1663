#![forbid(unsafe_code)]

//! batchlog: ingestion and live streaming of batch-job execution logs.
//!
//! Two halves share one [`store::LogStore`]:
//! 1. **Ingestion**: a bounded, non-blocking sink admits records tagged with an
//!    execution context; a single drain worker persists them.
//! 2. **Streaming**: viewers register a filter and receive new records on each
//!    poll tick, tracked by a per-connection timestamp watermark.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use batchlog::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> batchlog::core::errors::Result<()> {
//! let subsystem = LogSubsystem::start(&Config::default(), Arc::new(MemoryLogStore::new()))?;
//! let log = subsystem.sink().scoped(EventContext::new("202501011200NIGHTLY", "NIGHTLY"));
//! log.info("nightly.reader", "read 1200 rows");
//! let report = subsystem.shutdown();
//! assert!(report.drain.clean);
//! # Ok(())
//! # }
//! ```

pub mod prelude;

pub mod core;
pub mod ingest;
pub mod service;
pub mod store;
pub mod stream;
