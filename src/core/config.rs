//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{BlsError, Result};

/// Full configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub sink: SinkConfig,
    pub stream: StreamConfig,
    pub retention: RetentionConfig,
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
}

/// Ingestion sink and drain worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SinkConfig {
    /// Bounded queue capacity between producers and the drain worker.
    pub queue_capacity: usize,
    /// How long the drain worker waits for the next event before re-checking shutdown.
    pub drain_poll_timeout_ms: u64,
    /// Upper bound on the final drain at shutdown; remaining events are abandoned.
    pub shutdown_join_timeout_ms: u64,
}

/// Viewer stream and poll scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamConfig {
    pub poll_interval_ms: u64,
    pub initial_delay_ms: u64,
    /// Fresh connections start their watermark this far in the past.
    pub lookback_secs: u64,
    /// Size of the default "most recent" window for filterless one-shot queries.
    pub recent_limit: usize,
    /// Maximum number of connections polled concurrently within one tick.
    pub poll_parallelism: usize,
    /// How long a push may wait on a full viewer channel before the connection is dropped.
    pub push_timeout_ms: u64,
    /// Capacity of the per-viewer channel transport.
    pub channel_capacity: usize,
}

/// Retention of persisted records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    pub retention_days: u32,
}

/// Output format for the subsystem's own diagnostics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Diagnostics configuration (the subsystem's own tracing output, not ingested records).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level filter (trace, debug, info, warn, error). `RUST_LOG` overrides it.
    pub level: String,
    pub format: LogFormat,
}

/// Filesystem paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub sqlite_db: PathBuf,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            drain_poll_timeout_ms: 1_000,
            shutdown_join_timeout_ms: 5_000,
        }
    }
}

impl SinkConfig {
    #[must_use]
    pub fn drain_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_poll_timeout_ms)
    }

    #[must_use]
    pub fn shutdown_join_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_join_timeout_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            initial_delay_ms: 1_000,
            lookback_secs: 60,
            recent_limit: 100,
            poll_parallelism: 4,
            push_timeout_ms: 5_000,
            channel_capacity: 256,
        }
    }
}

impl StreamConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    #[must_use]
    pub fn lookback(&self) -> chrono::Duration {
        i64::try_from(self.lookback_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    #[must_use]
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[BLS-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("batchlog").join("config.toml");
        let data = home_dir.join(".local").join("share").join("batchlog");
        Self {
            config_file: cfg,
            sqlite_db: data.join("batch_log.sqlite3"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| BlsError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(BlsError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a over the canonical JSON form, stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // sink
        set_usize(&mut lookup, "BLS_SINK_QUEUE_CAPACITY", &mut self.sink.queue_capacity)?;
        set_u64(
            &mut lookup,
            "BLS_SINK_DRAIN_POLL_TIMEOUT_MS",
            &mut self.sink.drain_poll_timeout_ms,
        )?;
        set_u64(
            &mut lookup,
            "BLS_SINK_SHUTDOWN_JOIN_TIMEOUT_MS",
            &mut self.sink.shutdown_join_timeout_ms,
        )?;

        // stream
        set_u64(
            &mut lookup,
            "BLS_STREAM_POLL_INTERVAL_MS",
            &mut self.stream.poll_interval_ms,
        )?;
        set_u64(
            &mut lookup,
            "BLS_STREAM_INITIAL_DELAY_MS",
            &mut self.stream.initial_delay_ms,
        )?;
        set_u64(&mut lookup, "BLS_STREAM_LOOKBACK_SECS", &mut self.stream.lookback_secs)?;
        set_usize(&mut lookup, "BLS_STREAM_RECENT_LIMIT", &mut self.stream.recent_limit)?;
        set_usize(
            &mut lookup,
            "BLS_STREAM_POLL_PARALLELISM",
            &mut self.stream.poll_parallelism,
        )?;
        set_u64(
            &mut lookup,
            "BLS_STREAM_PUSH_TIMEOUT_MS",
            &mut self.stream.push_timeout_ms,
        )?;
        set_usize(
            &mut lookup,
            "BLS_STREAM_CHANNEL_CAPACITY",
            &mut self.stream.channel_capacity,
        )?;

        // retention
        if let Some(raw) = lookup("BLS_RETENTION_DAYS") {
            self.retention.retention_days = raw.parse::<u32>().map_err(|error| {
                BlsError::ConfigParse {
                    context: "env",
                    details: format!("BLS_RETENTION_DAYS={raw:?}: {error}"),
                }
            })?;
        }

        // logging
        if let Some(raw) = lookup("BLS_LOG_LEVEL") {
            self.logging.level = raw;
        }
        if let Some(raw) = lookup("BLS_LOG_FORMAT") {
            self.logging.format = match raw.to_ascii_lowercase().as_str() {
                "pretty" => LogFormat::Pretty,
                "json" => LogFormat::Json,
                _ => {
                    return Err(BlsError::ConfigParse {
                        context: "env",
                        details: format!("BLS_LOG_FORMAT={raw:?}: expected pretty or json"),
                    });
                }
            };
        }

        // paths
        if let Some(raw) = lookup("BLS_SQLITE_DB") {
            self.paths.sqlite_db = PathBuf::from(raw);
        }

        Ok(())
    }

    /// Reject values the subsystem cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (name, val) in [
            ("sink.queue_capacity", self.sink.queue_capacity),
            ("stream.recent_limit", self.stream.recent_limit),
            ("stream.poll_parallelism", self.stream.poll_parallelism),
            ("stream.channel_capacity", self.stream.channel_capacity),
        ] {
            if val == 0 {
                return Err(BlsError::InvalidConfig {
                    details: format!("{name} must be >= 1"),
                });
            }
        }

        for (name, val) in [
            ("sink.drain_poll_timeout_ms", self.sink.drain_poll_timeout_ms),
            ("stream.poll_interval_ms", self.stream.poll_interval_ms),
            ("stream.push_timeout_ms", self.stream.push_timeout_ms),
        ] {
            if val == 0 {
                return Err(BlsError::InvalidConfig {
                    details: format!("{name} must be > 0"),
                });
            }
        }

        if self.retention.retention_days == 0 {
            return Err(BlsError::InvalidConfig {
                details: "retention.retention_days must be > 0".to_string(),
            });
        }

        if self.logging.level.trim().is_empty() {
            return Err(BlsError::InvalidConfig {
                details: "logging.level must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn set_u64<F>(lookup: &mut F, name: &str, slot: &mut u64) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = raw.trim().parse::<u64>().map_err(|error| BlsError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}

fn set_usize<F>(lookup: &mut F, name: &str, slot: &mut usize) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = raw.trim().parse::<usize>().map_err(|error| BlsError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}
