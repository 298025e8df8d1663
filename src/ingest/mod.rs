//! Producer-side capture: event records, the non-blocking sink, and the drain worker.

pub mod drain;
pub mod record;
pub mod sink;
