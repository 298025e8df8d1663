//! BLS-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, BlsError>;

/// Top-level error type for the log ingestion and streaming subsystem.
#[derive(Debug, Error)]
pub enum BlsError {
    #[error("[BLS-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[BLS-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[BLS-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[BLS-1004] logging initialization failed: {details}")]
    LogInit { details: String },

    #[error("[BLS-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[BLS-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[BLS-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[BLS-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[BLS-4001] transport failure on connection {connection_id}: {details}")]
    Transport {
        connection_id: String,
        details: String,
    },

    #[error("[BLS-4002] transport timed out on connection {connection_id} after {waited_ms}ms")]
    TransportTimeout {
        connection_id: String,
        waited_ms: u64,
    },

    #[error("[BLS-4003] unknown stream connection: {connection_id}")]
    UnknownConnection { connection_id: String },

    #[error("[BLS-4004] stream connection already registered: {connection_id}")]
    DuplicateConnection { connection_id: String },

    #[error("[BLS-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl BlsError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "BLS-1001",
            Self::MissingConfig { .. } => "BLS-1002",
            Self::ConfigParse { .. } => "BLS-1003",
            Self::LogInit { .. } => "BLS-1004",
            Self::Serialization { .. } => "BLS-2101",
            Self::Sql { .. } => "BLS-2102",
            Self::Io { .. } => "BLS-3002",
            Self::ChannelClosed { .. } => "BLS-3003",
            Self::Transport { .. } => "BLS-4001",
            Self::TransportTimeout { .. } => "BLS-4002",
            Self::UnknownConnection { .. } => "BLS-4003",
            Self::DuplicateConnection { .. } => "BLS-4004",
            Self::Runtime { .. } => "BLS-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    ///
    /// Nothing in the subsystem retries on its own; this is for callers at the
    /// edge (CLI, request handlers) deciding what to report.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::ChannelClosed { .. } | Self::Sql { .. } | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for BlsError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for BlsError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for BlsError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
