use serde_json::Value;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn run_ctl(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_guidance-ctl"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to run guidance-ctl")
}

fn audit_entries(path: &Path) -> Vec<Value> {
    let content = std::fs::read_to_string(path).expect("audit log written");
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("audit line is JSON"))
        .collect()
}

fn event_types(entries: &[Value]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| entry["event_type"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[test]
fn taper_burn_completes_and_is_audited() {
    let dir = tempdir().unwrap();
    let audit = dir.path().join("audit.jsonl");

    let output = run_ctl(&[
        "--start",
        "1400",
        "--target",
        "1000",
        "--audit-log",
        audit.to_str().unwrap(),
    ]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let entries = audit_entries(&audit);
    assert_eq!(
        event_types(&entries),
        ["system_start", "session_start", "session_completed", "system_shutdown"]
    );
    let completed = &entries[2]["details"];
    assert_eq!(completed["mode"], "taper");
    assert_eq!(completed["outcome"], "reached");
    assert_eq!(completed["last_command"], 0.0);
}

#[test]
fn pid_burn_completes() {
    let dir = tempdir().unwrap();
    let audit = dir.path().join("audit.jsonl");

    let output = run_ctl(&[
        "--mode",
        "pid",
        "--start",
        "1300",
        "--target",
        "1000",
        "--audit-log",
        audit.to_str().unwrap(),
    ]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let entries = audit_entries(&audit);
    let completed = entries
        .iter()
        .find(|e| e["event_type"] == "session_completed")
        .expect("session completed");
    assert_eq!(completed["details"]["mode"], "pid");
    assert_eq!(completed["details"]["outcome"], "reached");
}

#[test]
fn abort_floor_preempts_the_burn() {
    let dir = tempdir().unwrap();
    let audit = dir.path().join("audit.jsonl");

    let output = run_ctl(&[
        "--start",
        "2000",
        "--target",
        "500",
        "--abort-below",
        "1500",
        "--audit-log",
        audit.to_str().unwrap(),
    ]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let entries = audit_entries(&audit);
    let types = event_types(&entries);
    assert!(types.contains(&"session_aborted".to_string()), "events: {types:?}");
    assert!(!types.contains(&"session_completed".to_string()));

    let aborted = entries
        .iter()
        .find(|e| e["event_type"] == "session_aborted")
        .unwrap();
    let last_value = aborted["details"]["last_value"].as_f64().unwrap();
    assert!(last_value < 1500.0 && last_value > 500.0, "last_value = {last_value}");
}

#[test]
fn run_deadline_cancels_a_stalled_burn() {
    let dir = tempdir().unwrap();
    let audit = dir.path().join("audit.jsonl");

    let output = run_ctl(&[
        "--descent-rate",
        "0",
        "--throttle-gain",
        "0",
        "--target",
        "0",
        "--run-seconds",
        "1",
        "--audit-log",
        audit.to_str().unwrap(),
    ]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let entries = audit_entries(&audit);
    let completed = entries
        .iter()
        .find(|e| e["event_type"] == "session_completed")
        .expect("session completed");
    assert_eq!(completed["details"]["outcome"], "cancelled");
    assert_eq!(completed["details"]["last_command"], 0.0);
}

#[test]
fn invalid_throttle_bounds_fail_fast() {
    let output = run_ctl(&["--throttle-min", "0.9", "--throttle-max", "0.1"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("throttle bounds"), "stderr: {stderr}");
}

#[test]
fn unrecognised_flag_values_fail_fast() {
    let output = run_ctl(&["--mode", "bogus", "--run-seconds", "soon"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--mode bogus"), "stderr: {stderr}");
    assert!(stderr.contains("--run-seconds soon"), "stderr: {stderr}");
}

#[test]
fn zero_sample_period_fails_fast() {
    let output = run_ctl(&["--sample-period-ms", "0"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("sample period"), "stderr: {stderr}");
}

#[test]
fn help_prints_usage() {
    let output = run_ctl(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("USAGE:"));
    assert!(stdout.contains("--abort-below"));
}
