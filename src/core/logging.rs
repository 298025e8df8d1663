//! Diagnostics for the subsystem itself, via `tracing`.
//!
//! Ingested batch records never flow through here; this is the local log the
//! drain worker and stream registry write to when something goes wrong
//! (persistence failures, dropped viewers, admission drops).
//!
//! Field names used consistently across the crate:
//! - `connection_id`: viewer connection
//! - `execution_id`, `job_name`: batch execution context
//! - `error_code`: `BLS-NNNN` code of the underlying error

use std::sync::OnceLock;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::core::config::{LogFormat, LoggingConfig};
use crate::core::errors::{BlsError, Result};

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber. `RUST_LOG` overrides `config.level`.
///
/// A second call returns [`BlsError::LogInit`].
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(BlsError::LogInit {
            details: "logging already initialized".to_string(),
        });
    }

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| BlsError::LogInit {
            details: format!("invalid log level {:?}: {e}", config.level),
        })?;

    let installed = match config.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_names(true)
                    .with_ansi(true),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(false)
                    .with_thread_names(true),
            )
            .try_init(),
    };

    installed.map_err(|e| BlsError::LogInit {
        details: e.to_string(),
    })?;
    let _ = LOGGING_INITIALIZED.set(());
    Ok(())
}
