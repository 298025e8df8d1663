//! Core types: errors, configuration, diagnostics setup.

pub mod config;
pub mod errors;
pub mod logging;
