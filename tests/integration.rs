//! Integration tests for the visionpool CLI.
//!
//! These run the real binary, including the hidden helper command that the
//! process backend re-executes.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::tempdir;

/// Get a command for the visionpool binary.
fn visionpool() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("visionpool").unwrap()
}

/// Run a small inspection and parse the `--json` report.
fn run_json(extra: &[&str]) -> Value {
    let output = visionpool()
        .args([
            "run", "--json", "-n", "3", "--cameras", "2", "--width", "4", "--height", "2",
            "--poll-ms", "10",
        ])
        .args(extra)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "run failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_help() {
    visionpool()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Run the inspection loop"))
        .stdout(predicate::str::contains("--verbose"));
}

#[test]
fn test_run_help_lists_pool_options() {
    visionpool()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--helper-timeout"))
        .stdout(predicate::str::contains("--backend"))
        .stdout(predicate::str::contains("--deadline"));
}

#[test]
fn test_version() {
    visionpool()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("visionpool"));
}

#[test]
fn test_run_thread_backend_json() {
    let report = run_json(&["--backend", "thread"]);
    assert_eq!(report["cycles_completed"], 3);
    assert_eq!(report["frames_analyzed"], 6);
    // 4x2 RGB frames, reversed in place.
    assert_eq!(report["bytes_out"], 6 * 24);
    assert_eq!(report["cancelled"], false);
    assert_eq!(report["items_lost"], 0);
    assert_eq!(report["shutdown"], "graceful");
    assert!(report["helpers"].as_str().unwrap().starts_with("thread"));
}

#[test]
fn test_run_process_backend_json() {
    let report = run_json(&["--backend", "process", "--analyzer", "grayscale"]);
    assert_eq!(report["cycles_completed"], 3);
    assert_eq!(report["frames_analyzed"], 6);
    assert_eq!(report["bytes_out"], 6 * 8);
    assert!(report["workers_spawned"].as_u64().unwrap() >= 2);
    assert!(report["helpers"].as_str().unwrap().starts_with("process"));
}

#[test]
fn test_run_skips_failed_acquisitions() {
    let report = run_json(&["--backend", "thread", "--fail-every", "3"]);
    assert_eq!(report["cycles_completed"], 2);
    assert_eq!(report["cycles_skipped"], 1);
}

#[test]
fn test_run_text_summary() {
    visionpool()
        .args([
            "run", "-n", "2", "--cameras", "1", "--width", "2", "--height", "2", "--backend",
            "thread",
        ])
        .assert()
        .success()
        .stderr(predicate::str::contains("Inspection complete!"))
        .stderr(predicate::str::contains("Cycles completed: 2"));
}

#[test]
fn test_run_quiet_prints_nothing() {
    visionpool()
        .args([
            "-q", "run", "-n", "1", "--cameras", "1", "--width", "2", "--height", "2",
            "--backend", "thread",
        ])
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::is_empty());
}

#[test]
fn test_invalid_helper_timeout() {
    visionpool()
        .args(["run", "--helper-timeout=-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"))
        .stderr(predicate::str::contains("helper timeout"));
}

#[test]
fn test_deadline_shorter_than_poll_rejected() {
    visionpool()
        .args(["run", "--deadline", "0.001", "--poll-ms", "50"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("collect deadline"));
}

#[test]
fn test_unknown_analyzer_rejected() {
    visionpool()
        .args(["run", "--analyzer", "sharpen"])
        .assert()
        .failure();
}

#[test]
fn test_helper_speaks_protocol() {
    let request = concat!(
        r#"{"type":"analyze","batch":1,"sequence_id":0,"frame":{"width":1,"height":1,"channels":3,"data":[1,2,3]}}"#,
        "\n",
        r#"{"type":"exit"}"#,
        "\n",
    );
    let output = visionpool()
        .args(["helper", "--analyzer", "reverse", "--worker-id", "3"])
        .write_stdin(request)
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["type"], "ready");
    assert_eq!(lines[1]["type"], "result");
    assert_eq!(lines[1]["sequence_id"], 0);
    assert_eq!(lines[1]["frame"]["data"], serde_json::json!([3, 2, 1]));
}

#[test]
fn test_helper_rejects_garbage() {
    visionpool()
        .arg("helper")
        .write_stdin("not json\n")
        .assert()
        .failure();
}

#[test]
fn test_log_file_written() {
    let tmp = tempdir().unwrap();
    let log_path = tmp.path().join("run.log");
    visionpool()
        .args(["-v", "--log-file"])
        .arg(&log_path)
        .args([
            "run", "-n", "1", "--cameras", "1", "--width", "2", "--height", "2", "--backend",
            "thread",
        ])
        .assert()
        .success();

    let contents = std::fs::read_to_string(&log_path).unwrap();
    assert!(contents.contains("Helper pool stopped"));
}
