//! CLI smoke tests against a throwaway SQLite database.

mod common;

use common::CliHarness;

#[test]
fn help_command_prints_usage() {
    let cli = CliHarness::new();
    let out = cli.run(&["--help"]);
    out.assert_success();
    assert!(out.stdout.contains("Usage: batchlog [OPTIONS] <COMMAND>"), "{}", out.stdout);
}

#[test]
fn version_command_prints_version() {
    let cli = CliHarness::new();
    let out = cli.run(&["--version"]);
    out.assert_success();
    assert!(out.stdout.contains(env!("CARGO_PKG_VERSION")), "{}", out.stdout);
}

#[test]
fn emit_then_query_and_stats() {
    let cli = CliHarness::new();
    let exec = "202501011200NIGHTLY";
    cli.emit("NIGHTLY", exec, "INFO", "started");
    cli.emit("NIGHTLY", exec, "ERROR", "failed to fetch");
    assert!(cli.db_path().exists());

    let query = cli.run(&["query", "--execution-id", exec]);
    query.assert_success();
    let payload = query.last_json();
    assert_eq!(payload["command"], "query");
    assert_eq!(payload["count"], 2);
    assert_eq!(payload["records"][0]["message"], "failed to fetch");

    let stats = cli.run(&["stats", exec]);
    stats.assert_success();
    let levels = stats.last_json()["levels"].as_array().cloned().unwrap();
    assert_eq!(levels.len(), 2);

    let errors = cli.run(&["errors", exec]);
    errors.assert_success();
    assert_eq!(errors.last_json()["records"].as_array().map(Vec::len), Some(1));
}

#[test]
fn query_by_job_sees_every_run() {
    let cli = CliHarness::new();
    cli.emit("NIGHTLY", "202501011200NIGHTLY", "INFO", "run one");
    cli.emit("NIGHTLY", "202501021200NIGHTLY", "INFO", "run two");
    cli.emit("WEEKLY", "202501011200WEEKLY", "INFO", "unrelated");

    let out = cli.run(&["query", "--job", "NIGHTLY"]);
    out.assert_success();
    assert_eq!(out.last_json()["count"], 2);
}

#[test]
fn emit_rejects_unknown_level() {
    let cli = CliHarness::new();
    let out = cli.run(&["emit", "--job", "JOBX", "--level", "LOUD", "hi"]);
    assert_eq!(out.code(), Some(1), "{}", out.stderr);
}

#[test]
fn prune_dry_run_reports_without_deleting() {
    let cli = CliHarness::new();
    let emit = cli.run(&["emit", "--job", "JOBX", "recent line"]);
    emit.assert_success();

    let prune = cli.run(&["prune", "--days", "1", "--dry-run"]);
    prune.assert_success();
    let payload = prune.last_json();
    assert_eq!(payload["removed"], 0);
    assert_eq!(payload["dryRun"], true);
}

#[test]
fn config_validate_with_missing_explicit_file_fails() {
    let cli = CliHarness::new();
    let missing = cli.path("nope.toml");
    let out = cli.run(&["--config", missing.to_str().unwrap(), "config", "validate"]);
    assert_eq!(out.code(), Some(1), "{}", out.stderr);
    assert_eq!(out.last_json()["valid"], false);
}
