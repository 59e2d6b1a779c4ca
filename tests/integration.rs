//! Black-box tests for the `treekill` runner binary.
//!
//! Each test runs the compiled `treekill` binary with its configuration
//! passed through environment variables, parses the single JSON document
//! printed after the `=== METRICS ===` banner, and checks it against the
//! expected end-to-end scenario.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Output};

fn binary() -> PathBuf {
    let mut p = std::env::current_exe().expect("current exe");
    p.pop();
    if p.ends_with("deps") {
        p.pop();
    }
    p.push("treekill");
    if cfg!(windows) {
        p.set_extension("exe");
    }
    p
}

fn payload_binary() -> PathBuf {
    let mut p = binary();
    p.pop();
    p.push(if cfg!(windows) {
        "treekill-payload.exe"
    } else {
        "treekill-payload"
    });
    p
}

fn run_runner(env: &HashMap<&str, String>) -> (Output, serde_json::Value) {
    let mut cmd = Command::new(binary());
    cmd.env("PAYLOAD_BIN", payload_binary());
    for (key, value) in env {
        cmd.env(key, value);
    }
    let output = cmd.output().expect("run treekill binary");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let banner = "=== METRICS ===";
    let json_start = stdout
        .find(banner)
        .map(|idx| idx + banner.len())
        .unwrap_or_else(|| panic!("missing metrics banner\nstdout: {stdout}"));
    let metrics: serde_json::Value = serde_json::from_str(stdout[json_start..].trim())
        .unwrap_or_else(|e| panic!("metrics document is not valid JSON: {e}\nstdout: {stdout}"));
    (output, metrics)
}

fn env_map(pairs: &[(&'static str, &str)]) -> HashMap<&'static str, String> {
    pairs
        .iter()
        .map(|(k, v)| (*k, v.to_string()))
        .collect()
}

/// S1: a shallow, fast-exiting tree finishes naturally, no kill needed.
#[test]
fn natural_exit_reports_no_timeout_and_confirms_empty() {
    let env = env_map(&[
        ("DEPTH", "0"),
        ("BREADTH", "0"),
        ("SLEEP_MS", "100"),
        ("TIMEOUT_MS", "5000"),
        ("GRACEFUL_MS", "200"),
        ("VERIFY_DELAY_MS", "100"),
        ("TAG", "IT_NATURAL"),
    ]);
    let (output, metrics) = run_runner(&env);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(metrics["killed_tree_confirmed"], true);
    assert_eq!(metrics["processes_seen_after_verify"], 0);
}

/// S4 (scaled down for test runtime): a multi-level tree is fully reaped
/// after a forceful kill, and the opened-by-level accounting matches
/// `breadth^level`.
#[test]
fn deep_tree_is_fully_reaped_and_counts_match() {
    let env = env_map(&[
        ("DEPTH", "2"),
        ("BREADTH", "3"),
        ("SLEEP_MS", "300000"),
        ("TIMEOUT_MS", "500"),
        ("GRACEFUL_MS", "200"),
        ("VERIFY_DELAY_MS", "500"),
        ("TAG", "IT_DEEP_TREE"),
    ]);
    let (output, metrics) = run_runner(&env);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(metrics["killed_tree_confirmed"], true);
    // 1 (root) + 3 (level 1) + 9 (level 2) = 13
    assert_eq!(metrics["opened_total"], 13);
    assert_eq!(metrics["closed_total"], 13);
}

/// S3: a tree that outlives its graceful window is escalated to a forceful
/// kill and still ends up fully reaped.
#[test]
fn slow_tree_escalates_to_forceful_kill() {
    let env = env_map(&[
        ("DEPTH", "1"),
        ("BREADTH", "2"),
        ("SLEEP_MS", "300000"),
        ("TIMEOUT_MS", "300"),
        ("GRACEFUL_MS", "100"),
        ("VERIFY_DELAY_MS", "300"),
        ("TAG", "IT_FORCE_ESCALATION"),
    ]);
    let (output, metrics) = run_runner(&env);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(metrics["killed_tree_confirmed"], true);
}

/// S2: a payload that traps SIGTERM and exits promptly never needs a
/// forceful kill — the graceful signal alone is enough.
#[test]
fn graceful_signal_alone_is_enough_when_the_payload_traps_it() {
    let env = env_map(&[
        ("DEPTH", "0"),
        ("BREADTH", "0"),
        ("SLEEP_MS", "300000"),
        ("TIMEOUT_MS", "150"),
        ("GRACEFUL_MS", "800"),
        ("VERIFY_DELAY_MS", "200"),
        ("TAG", "IT_GRACEFUL_ONLY"),
        ("TRAP_TERM", "true"),
    ]);
    let (output, metrics) = run_runner(&env);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(metrics["killed_tree_confirmed"], true);
    // The payload trapped SIGTERM and exited 0 itself; a forceful kill
    // would have left it killed by signal, with no exit code, on Unix.
    assert_eq!(metrics["runner_exit_code"], 0);
}

/// The metrics document always reports the platform and the requested
/// config back verbatim, regardless of outcome.
#[test]
fn metrics_echo_the_requested_configuration() {
    let env = env_map(&[
        ("DEPTH", "0"),
        ("BREADTH", "0"),
        ("SLEEP_MS", "50"),
        ("TIMEOUT_MS", "2000"),
        ("GRACEFUL_MS", "250"),
        ("VERIFY_DELAY_MS", "50"),
        ("TAG", "IT_ECHO"),
    ]);
    let (_output, metrics) = run_runner(&env);
    assert_eq!(metrics["depth"], 0);
    assert_eq!(metrics["breadth"], 0);
    assert_eq!(metrics["timeout_ms"], 2000);
    assert_eq!(metrics["graceful_ms"], 250);
    assert_eq!(metrics["tag"], "IT_ECHO");
    assert!(metrics["os"].is_string());
    assert!(metrics["started_at"].is_string());
}
