use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

fn run_tv<I, S>(data_dir: &Path, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_tv"))
        .arg("--data-dir")
        .arg(data_dir)
        .args(args)
        .env_remove("TASKVAULT_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute tv binary: {err}"))
}

fn stdout_json(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json<I, S>(data_dir: &Path, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_tv(data_dir, args);
    if !output.status.success() {
        panic!(
            "tv command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    stdout_json(&output)
}

fn seeded_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"));
    let write = |name: &str, body: &str| {
        fs::write(dir.path().join(name), body)
            .unwrap_or_else(|err| panic!("failed to write {name}: {err}"));
    };
    write(
        "todo.json",
        r#"{"tasks":[{"id":"T002","parentId":"T001"},{"id":"T001","title":"root"}]}"#,
    );
    write("sessions.json", r#"{"sessions":[{"id":"S1","focus":"T001"}]}"#);
    dir
}

#[test]
fn count_reports_source_records_without_a_store() {
    let dir = seeded_dir();
    let payload = run_json(dir.path(), ["count"]);
    assert_eq!(payload["contract_version"], "cli.v1");
    assert_eq!(payload["counts"]["tasks"], 2);
    assert_eq!(payload["counts"]["sessions"], 1);
    assert_eq!(payload["counts"]["archived"], 0);
    assert!(!dir.path().join("tasks.db").exists());
}

#[test]
fn migrate_then_status_verify_and_log() {
    let dir = seeded_dir();

    let preview = run_json(dir.path(), ["migrate", "--dry-run"]);
    assert_eq!(preview["dryRun"], true);
    assert_eq!(preview["sourceCounts"]["tasks"], 2);
    assert!(!dir.path().join("tasks.db").exists());

    let migrated = run_json(dir.path(), ["migrate"]);
    assert_eq!(migrated["success"], true);
    assert_eq!(migrated["phase"], "complete");
    assert_eq!(migrated["tasksImported"], 2);
    assert_eq!(migrated["sessionsImported"], 1);

    let status = run_json(dir.path(), ["status"]);
    assert_eq!(status["state"]["phase"], "complete");
    assert_eq!(status["resume"]["canResume"], false);

    let verify = run_json(dir.path(), ["verify"]);
    assert_eq!(verify["healthy"], true);
    assert_eq!(verify["target"]["counts"]["tasks"], 2);
    assert_eq!(verify["sources"]["ok"], true);

    let log = run_json(dir.path(), ["log"]);
    let entries = log["entries"].as_array().map_or(0, Vec::len);
    assert!(entries > 0, "log had no entries: {log}");
}

#[test]
fn failed_migration_exits_non_zero_with_json_errors() {
    let dir = seeded_dir();
    fs::write(dir.path().join("todo.json"), "not json")
        .unwrap_or_else(|err| panic!("failed to write todo.json: {err}"));

    let output = run_tv(dir.path(), ["migrate"]);
    assert_eq!(output.status.code(), Some(1));
    let payload = stdout_json(&output);
    assert_eq!(payload["success"], false);
    assert_eq!(payload["errorKind"], "parse");
    assert!(payload["errors"][0].as_str().is_some_and(|error| error.contains("todo.json")));
}

#[test]
fn migrate_atomic_uses_separate_source_directory() {
    let sources = seeded_dir();
    let data = tempfile::tempdir().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"));
    let staging = data.path().join("tasks.db.next");

    let source_arg = sources.path().to_string_lossy().to_string();
    let staging_arg = staging.to_string_lossy().to_string();
    let payload = run_json(
        data.path(),
        ["migrate-atomic", "--source", source_arg.as_str(), "--staging", staging_arg.as_str()],
    );
    assert_eq!(payload["success"], true);
    assert_eq!(payload["tasksImported"], 2);
    assert!(data.path().join("tasks.db").exists());
    assert!(!staging.exists());
}

#[test]
fn held_lock_is_reported_and_retries_flag_is_accepted() {
    let dir = seeded_dir();
    let marker = dir.path().join("tasks.db.lock");
    fs::write(
        &marker,
        r#"{"token":"someone-else","pid":1,"operation":"migrate","acquiredAt":"2030-01-01T00:00:00Z"}"#,
    )
    .unwrap_or_else(|err| panic!("failed to write lock marker: {err}"));

    let output = run_tv(dir.path(), ["--lock-retries", "1", "migrate"]);
    assert_eq!(output.status.code(), Some(1));
    let payload = stdout_json(&output);
    assert_eq!(payload["errorKind"], "lock");
    assert!(marker.exists());
}
