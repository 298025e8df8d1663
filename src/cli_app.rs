//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use clap::{Args, Parser, Subcommand};
use colored::{Colorize, control};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use batchlog::core::config::Config;
use batchlog::core::errors::BlsError;
use batchlog::core::logging::init_logging;
use batchlog::ingest::record::{
    EventContext, EventRecord, LogEvent, LogLevel, ParseLevelError, execution_id_for,
};
use batchlog::service::LogSubsystem;
use batchlog::store::{SharedStore, SqliteLogStore};
use batchlog::stream::filter::{FilterParams, LogFilter};
use batchlog::stream::query;
use batchlog::stream::registry::StreamRegistry;
use batchlog::stream::scheduler::PollScheduler;
use batchlog::stream::transport::StreamEvent;

/// Batch log store: query, tail, and emit batch-job execution logs.
#[derive(Debug, Parser)]
#[command(
    name = "batchlog",
    author,
    version,
    about = "Batch job execution log ingestion and streaming",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// One-shot query of stored records.
    Query(QueryArgs),
    /// Follow new records live until interrupted.
    Tail(TailArgs),
    /// Write one record through the ingestion sink.
    Emit(EmitArgs),
    /// WARN and ERROR records of one execution, oldest first.
    Errors(ExecutionArgs),
    /// Per-level record counts for one execution.
    Stats(ExecutionArgs),
    /// Delete records older than the retention window.
    Prune(PruneArgs),
    /// Show or validate configuration.
    Config(ConfigArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct FilterArgs {
    /// Execution id (yyyyMMddHHmm + job name).
    #[arg(long, value_name = "ID")]
    execution_id: Option<String>,
    /// Job name.
    #[arg(long, value_name = "NAME")]
    job: Option<String>,
    /// Level (DEBUG, INFO, WARN, ERROR).
    #[arg(long, value_name = "LEVEL")]
    level: Option<String>,
    /// Case-insensitive substring of message or logger name.
    #[arg(long, value_name = "TEXT")]
    keyword: Option<String>,
    /// Range start (ISO-8601; UTC if no offset).
    #[arg(long, value_name = "TIME")]
    since: Option<String>,
    /// Range end (ISO-8601; UTC if no offset).
    #[arg(long, value_name = "TIME")]
    until: Option<String>,
}

impl FilterArgs {
    fn to_filter(&self) -> LogFilter {
        LogFilter::from(&FilterParams {
            execution_id: self.execution_id.clone(),
            job_name: self.job.clone(),
            level: self.level.clone(),
            keyword: self.keyword.clone(),
            start_time: self.since.clone(),
            end_time: self.until.clone(),
        })
    }
}

#[derive(Debug, Clone, Args)]
struct QueryArgs {
    #[command(flatten)]
    filter: FilterArgs,
    /// Size of the most-recent window when no other criteria are given.
    #[arg(long, value_name = "N")]
    limit: Option<usize>,
}

#[derive(Debug, Clone, Args)]
struct TailArgs {
    /// Execution id to follow (follows every run of its job).
    #[arg(long, value_name = "ID")]
    execution_id: Option<String>,
    /// Print raw Server-Sent Events frames.
    #[arg(long)]
    sse: bool,
}

#[derive(Debug, Clone, Args)]
struct EmitArgs {
    /// Job name.
    #[arg(long, value_name = "NAME")]
    job: String,
    /// Execution id; derived from the job name and current minute if omitted.
    #[arg(long, value_name = "ID")]
    execution_id: Option<String>,
    /// Step name.
    #[arg(long, value_name = "NAME")]
    step: Option<String>,
    /// Level.
    #[arg(long, default_value = "INFO", value_name = "LEVEL")]
    level: String,
    /// Logger name recorded with the line.
    #[arg(long, default_value = "batchlog.cli", value_name = "NAME")]
    logger: String,
    /// Message text.
    #[arg(value_name = "MESSAGE")]
    message: String,
}

#[derive(Debug, Clone, Args)]
struct ExecutionArgs {
    /// Execution id.
    #[arg(value_name = "ID")]
    execution_id: String,
}

#[derive(Debug, Clone, Args)]
struct PruneArgs {
    /// Retention in days; defaults to `retention.retention_days`.
    #[arg(long, value_name = "DAYS")]
    days: Option<u32>,
    /// Report what would be removed without deleting.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print the config file path.
    Path,
    /// Print the effective configuration.
    Show,
    /// Validate the configuration.
    Validate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
        }
    }
}

impl From<BlsError> for CliError {
    fn from(value: BlsError) -> Self {
        match value {
            BlsError::InvalidConfig { .. }
            | BlsError::MissingConfig { .. }
            | BlsError::ConfigParse { .. }
            | BlsError::UnknownConnection { .. }
            | BlsError::DuplicateConnection { .. } => Self::User(value.to_string()),
            _ if value.is_retryable() => {
                Self::Runtime(format!("{value} (transient; retrying may succeed)"))
            }
            _ => Self::Runtime(value.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Config(args) => run_config(cli, args),
        command => {
            let config = load_config(cli)?;
            match command {
                Command::Query(args) => run_query(cli, &config, args),
                Command::Tail(args) => run_tail(cli, &config, args),
                Command::Emit(args) => run_emit(cli, &config, args),
                Command::Errors(args) => run_errors(cli, &config, args),
                Command::Stats(args) => run_stats(cli, &config, args),
                Command::Prune(args) => run_prune(cli, &config, args),
                Command::Config(_) => Ok(()),
            }
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if cli.verbose {
        config.logging.level = "debug".to_string();
    } else if cli.quiet {
        config.logging.level = "error".to_string();
    }
    if let Err(e) = init_logging(&config.logging) {
        eprintln!("[BLS-LOG] {e}");
    }
    Ok(config)
}

fn open_store(config: &Config) -> Result<SharedStore, CliError> {
    Ok(Arc::new(SqliteLogStore::open(&config.paths.sqlite_db)?))
}

// ──────────────────── query ────────────────────

fn run_query(cli: &Cli, config: &Config, args: &QueryArgs) -> Result<(), CliError> {
    let store = open_store(config)?;
    let filter = args.filter.to_filter();
    let limit = args.limit.unwrap_or(config.stream.recent_limit);
    let records = query::one_shot(store.as_ref(), &filter, limit)?;

    match output_mode(cli) {
        OutputMode::Human => {
            if records.is_empty() {
                println!("No matching records.");
            }
            for record in records.iter().rev() {
                print_record(record);
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "query",
                "filter": serde_json::to_value(&filter)?,
                "count": records.len(),
                "records": serde_json::to_value(&records)?,
            }))?;
        }
    }
    Ok(())
}

// ──────────────────── tail ────────────────────

fn run_tail(cli: &Cli, config: &Config, args: &TailArgs) -> Result<(), CliError> {
    let shutdown = Arc::new(AtomicBool::new(false));
    register_shutdown_signals(&shutdown);

    let store = open_store(config)?;
    let registry = Arc::new(StreamRegistry::new(store, config.stream.clone()));
    let scheduler = PollScheduler::spawn(Arc::clone(&registry), &config.stream)?;
    let filter = args
        .execution_id
        .clone()
        .map(LogFilter::for_execution)
        .unwrap_or_default();
    let subscription = registry.open_channel(None, filter)?;
    let mode = output_mode(cli);

    let mut result = Ok(());
    while !shutdown.load(Ordering::Relaxed) {
        match subscription.recv_timeout(Duration::from_millis(250)) {
            Ok(Some(event)) => {
                if let Err(e) = print_stream_event(mode, args.sse, &event) {
                    result = Err(e);
                    break;
                }
            }
            Ok(None) => {}
            Err(_) => break,
        }
    }

    let _ = registry.close(subscription.connection_id());
    scheduler.stop();
    result
}

fn register_shutdown_signals(flag: &Arc<AtomicBool>) {
    use signal_hook::consts::{SIGINT, SIGTERM};

    for signal in [SIGINT, SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(flag)) {
            eprintln!("[BLS-SIGNAL] failed to register signal {signal}: {e}");
        }
    }
}

fn print_stream_event(mode: OutputMode, sse: bool, event: &StreamEvent) -> Result<(), CliError> {
    if sse {
        let frame = event.to_sse_frame()?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(frame.as_bytes())?;
        stdout.flush()?;
        return Ok(());
    }
    match (mode, event) {
        (OutputMode::Human, StreamEvent::Connected { connection_id, .. }) => {
            println!("{} {connection_id}", "connected".dimmed());
        }
        (OutputMode::Human, StreamEvent::Logs(records)) => {
            for record in records.iter().rev() {
                print_record(record);
            }
        }
        (OutputMode::Json, StreamEvent::Connected { connection_id, message }) => {
            write_json_line(&json!({
                "event": "connected",
                "connectionId": connection_id,
                "message": message,
            }))?;
        }
        (OutputMode::Json, StreamEvent::Logs(records)) => {
            for record in records.iter().rev() {
                write_json_line(&serde_json::to_value(record)?)?;
            }
        }
    }
    Ok(())
}

// ──────────────────── emit ────────────────────

fn run_emit(cli: &Cli, config: &Config, args: &EmitArgs) -> Result<(), CliError> {
    let level: LogLevel = args
        .level
        .parse()
        .map_err(|e: ParseLevelError| CliError::User(e.to_string()))?;
    let execution_id = args
        .execution_id
        .clone()
        .unwrap_or_else(|| execution_id_for(&args.job, Local::now().naive_local()));
    let mut ctx = EventContext::new(execution_id.clone(), args.job.clone());
    ctx.step_name.clone_from(&args.step);

    let subsystem = LogSubsystem::start(config, open_store(config)?)?;
    let admission = subsystem
        .sink()
        .submit(&ctx, LogEvent::new(level, args.logger.clone(), args.message.clone()));
    let report = subsystem.shutdown();

    if !admission.is_accepted() || report.sink.persisted == 0 {
        return Err(CliError::Runtime(format!(
            "record not persisted ({admission:?}, {} persist failures)",
            report.sink.persist_failures
        )));
    }

    match output_mode(cli) {
        OutputMode::Human => {
            println!("{} {execution_id}", "emitted".green());
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "emit",
                "executionId": execution_id,
                "report": serde_json::to_value(report)?,
            }))?;
        }
    }
    Ok(())
}

// ──────────────────── errors / stats ────────────────────

fn run_errors(cli: &Cli, config: &Config, args: &ExecutionArgs) -> Result<(), CliError> {
    let store = open_store(config)?;
    let records = store.query_errors(&args.execution_id)?;
    match output_mode(cli) {
        OutputMode::Human => {
            if records.is_empty() {
                println!("No warnings or errors for {}.", args.execution_id);
            }
            for record in &records {
                print_record(record);
                if let Some(trace) = &record.error_trace {
                    for line in trace.lines() {
                        println!("    {}", line.dimmed());
                    }
                }
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "errors",
                "executionId": args.execution_id,
                "records": serde_json::to_value(&records)?,
            }))?;
        }
    }
    Ok(())
}

fn run_stats(cli: &Cli, config: &Config, args: &ExecutionArgs) -> Result<(), CliError> {
    let store = open_store(config)?;
    let counts = store.level_counts(&args.execution_id)?;
    match output_mode(cli) {
        OutputMode::Human => {
            println!("Execution {}", args.execution_id.bold());
            if counts.is_empty() {
                println!("  (no records)");
            }
            for count in &counts {
                println!("  {:<5} {:>8}", paint_level(count.level), count.count);
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "stats",
                "executionId": args.execution_id,
                "levels": serde_json::to_value(&counts)?,
            }))?;
        }
    }
    Ok(())
}

// ──────────────────── prune ────────────────────

fn run_prune(cli: &Cli, config: &Config, args: &PruneArgs) -> Result<(), CliError> {
    let days = args.days.unwrap_or(config.retention.retention_days);
    if days == 0 {
        return Err(CliError::User("--days must be > 0".to_string()));
    }
    let cutoff = Utc::now()
        .checked_sub_signed(chrono::Duration::days(i64::from(days)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let store = open_store(config)?;
    let removed = if args.dry_run {
        store
            .query_by_time_range(DateTime::<Utc>::MIN_UTC, cutoff)?
            .into_iter()
            .filter(|r| r.timestamp < cutoff)
            .count()
    } else {
        store.prune_before(cutoff)?
    };

    match output_mode(cli) {
        OutputMode::Human => {
            let verb = if args.dry_run { "Would remove" } else { "Removed" };
            println!("{verb} {removed} record(s) older than {days} day(s).");
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "prune",
                "dryRun": args.dry_run,
                "cutoff": cutoff.to_rfc3339(),
                "removed": removed,
            }))?;
        }
    }
    Ok(())
}

// ──────────────────── config ────────────────────

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();
            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    }))?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = Config::load(cli.config.as_deref())?;
            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    }))?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;
                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        write_json_line(&json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        }))?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => eprintln!("Configuration is INVALID: {e}"),
                    OutputMode::Json => {
                        write_json_line(&json!({
                            "command": "config validate",
                            "valid": false,
                            "error": e.to_string(),
                        }))?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ──────────────────── output helpers ────────────────────

fn print_record(record: &EventRecord) {
    let ts = record.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ");
    let step = record
        .step_name
        .as_deref()
        .map_or_else(String::new, |s| format!("/{s}"));
    println!(
        "{} {:<5} [{}{}] {} - {}",
        ts.to_string().dimmed(),
        paint_level(record.level),
        record.execution_id,
        step,
        record.logger_name.cyan(),
        record.message
    );
}

fn paint_level(level: LogLevel) -> colored::ColoredString {
    let label = level.as_str();
    match level {
        LogLevel::Error => label.red().bold(),
        LogLevel::Warn => label.yellow(),
        LogLevel::Info => label.green(),
        LogLevel::Debug => label.dimmed(),
    }
}

fn write_json_line<T: Serialize>(payload: &T) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("BLS_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_before_and_after_subcommand() {
        let before = Cli::try_parse_from([
            "batchlog",
            "--config",
            "/tmp/batchlog.toml",
            "--json",
            "--no-color",
            "-v",
            "query",
        ]);
        assert!(before.is_ok());

        let after = Cli::try_parse_from(["batchlog", "query", "--json", "--no-color", "-q"]);
        assert!(after.is_ok());
    }

    #[test]
    fn parses_all_subcommands() {
        let cases = [
            vec!["batchlog", "query", "--job", "JOBX", "--level", "ERROR"],
            vec![
                "batchlog",
                "query",
                "--since",
                "2025-01-01T00:00",
                "--until",
                "2025-01-02T00:00",
                "--keyword",
                "timeout",
            ],
            vec!["batchlog", "tail", "--execution-id", "202501011200JOBX", "--sse"],
            vec!["batchlog", "emit", "--job", "JOBX", "--level", "WARN", "slow fetch"],
            vec!["batchlog", "errors", "202501011200JOBX"],
            vec!["batchlog", "stats", "202501011200JOBX"],
            vec!["batchlog", "prune", "--days", "7", "--dry-run"],
            vec!["batchlog", "config", "validate"],
        ];
        for case in cases {
            let parsed = Cli::try_parse_from(case.clone());
            assert!(parsed.is_ok(), "failed to parse case: {case:?}");
        }
    }

    #[test]
    fn emit_requires_job_and_message() {
        assert!(Cli::try_parse_from(["batchlog", "emit", "hello"]).is_err());
        assert!(Cli::try_parse_from(["batchlog", "emit", "--job", "JOBX"]).is_err());
    }

    #[test]
    fn filter_args_map_to_filter() {
        let args = FilterArgs {
            job: Some("JOBX".to_string()),
            level: Some("warn".to_string()),
            since: Some("2025-01-01T00:00:00Z".to_string()),
            ..FilterArgs::default()
        };
        let filter = args.to_filter();
        assert_eq!(filter.job_name(), Some("JOBX"));
        assert_eq!(filter.level, Some(LogLevel::Warn));
        assert!(filter.start_time.is_some());
        assert!(!filter.is_simple());
    }

    #[test]
    fn output_mode_resolution_honors_precedence() {
        assert_eq!(resolve_output_mode(true, Some("human"), true), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some("json"), true), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some("human"), false), OutputMode::Human);
        assert_eq!(resolve_output_mode(false, None, true), OutputMode::Human);
        assert_eq!(resolve_output_mode(false, None, false), OutputMode::Json);
    }

    #[test]
    fn bls_errors_map_to_exit_codes() {
        let user: CliError = BlsError::InvalidConfig {
            details: "x".to_string(),
        }
        .into();
        assert_eq!(user.exit_code(), 1);
        let runtime: CliError = BlsError::Sql {
            context: "insert",
            details: "locked".to_string(),
        }
        .into();
        assert_eq!(runtime.exit_code(), 2);
    }

    #[test]
    fn transient_failures_carry_a_retry_hint() {
        let transient: CliError = BlsError::Sql {
            context: "insert",
            details: "database is locked".to_string(),
        }
        .into();
        let message = transient.to_string();
        assert!(message.contains("database is locked"), "{message}");
        assert!(message.contains("retrying may succeed"), "{message}");

        let permanent: CliError = BlsError::Serialization {
            context: "json",
            details: "bad".to_string(),
        }
        .into();
        assert_eq!(permanent.exit_code(), 2);
        assert!(!permanent.to_string().contains("retrying"));
    }
}
