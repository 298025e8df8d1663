//! Viewer-side delivery: filters, transports, the connection registry, and the poll scheduler.

pub mod connection;
pub mod filter;
pub mod query;
pub mod registry;
pub mod scheduler;
pub mod transport;
