//! treekill runner — entry point.
//!
//! All stdout after the `=== METRICS ===` banner is a single JSON document;
//! tracing logs go to stderr, so the two never interleave.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use treekill::{SpawnRequest, Supervisor, SupervisorOptions, VerifierProbe};

#[derive(Debug, Parser)]
#[command(name = "treekill")]
#[command(about = "Supervise a process tree and verify it is fully terminated", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

struct Config {
    depth: u32,
    breadth: u32,
    sleep_ms: u64,
    timeout_ms: u64,
    graceful_ms: u64,
    verify_delay_ms: u64,
    tag: String,
    payload_bin: PathBuf,
    /// When set, the payload traps SIGTERM and exits cleanly instead of
    /// riding out `sleep_ms`, exercising the graceful-kill-only path.
    trap_term: bool,
}

impl Config {
    fn from_env() -> Result<Self> {
        let tag = env_or("TAG", || format!("TEST_{:08x}", std::process::id()));
        Ok(Self {
            depth: env_parse_or("DEPTH", 3)?,
            breadth: env_parse_or("BREADTH", 5)?,
            sleep_ms: env_parse_or("SLEEP_MS", 300_000)?,
            timeout_ms: env_parse_or("TIMEOUT_MS", 5_000)?,
            graceful_ms: env_parse_or("GRACEFUL_MS", 500)?,
            verify_delay_ms: env_parse_or("VERIFY_DELAY_MS", 1_200)?,
            tag,
            payload_bin: resolve_payload_bin()?,
            trap_term: env_parse_or("TRAP_TERM", false)?,
        })
    }
}

/// Resolves the payload binary from an explicit env var, falling back to a
/// binary of the same name sitting next to this executable.
fn resolve_payload_bin() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("PAYLOAD_BIN") {
        return Ok(PathBuf::from(path));
    }
    let exe = std::env::current_exe().context("resolve current executable path")?;
    let dir = exe
        .parent()
        .context("current executable has no parent directory")?;
    let name = if cfg!(windows) {
        "treekill-payload.exe"
    } else {
        "treekill-payload"
    };
    Ok(dir.join(name))
}

fn env_or(key: &str, default: impl FnOnce() -> String) -> String {
    std::env::var(key).unwrap_or_else(|_| default())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={value}: {e}")),
        Err(_) => Ok(default),
    }
}

#[derive(Serialize)]
struct Metrics {
    started_at: String,
    os: &'static str,
    depth: u32,
    breadth: u32,
    timeout_ms: u64,
    graceful_ms: u64,
    tag: String,
    runner_exit_code: Option<i32>,
    total_elapsed_ms: u128,
    processes_seen_before_verify: usize,
    processes_seen_after_verify: usize,
    killed_tree_confirmed: bool,
    opened_total: u64,
    opened_by_level: HashMap<String, u64>,
    closed_total: Option<u64>,
    closed_by_level: Option<HashMap<String, u64>>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let config = Config::from_env()?;
    let started_at = rfc3339_now();
    let wall_start = Instant::now();

    let mut request = SpawnRequest::new(config.payload_bin.clone())
        .arg("--depth")
        .arg(config.depth.to_string())
        .arg("--breadth")
        .arg(config.breadth.to_string())
        .arg("--sleep-ms")
        .arg(config.sleep_ms.to_string())
        .arg("--tag")
        .arg(config.tag.clone());
    if config.trap_term {
        request = request.arg("--trap-term");
    }

    let supervisor = Supervisor::new(SupervisorOptions {
        graceful_wait: Duration::from_millis(config.graceful_ms),
    });

    let outcome = supervisor.run_with_timeout(&request, Duration::from_millis(config.timeout_ms));
    let runner_exit_code = match &outcome {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            tracing::warn!(%err, "supervision did not complete cleanly");
            None
        }
    };

    let processes_seen_before_verify = VerifierProbe::count_by_tag(&config.tag);
    std::thread::sleep(Duration::from_millis(config.verify_delay_ms));
    let processes_seen_after_verify = VerifierProbe::count_by_tag(&config.tag);
    let killed_tree_confirmed = processes_seen_after_verify == 0;

    let opened_by_level = level_counts(config.depth, config.breadth);
    let opened_total: u64 = opened_by_level.values().sum();
    let (closed_total, closed_by_level) = if killed_tree_confirmed {
        (Some(opened_total), Some(opened_by_level.clone()))
    } else {
        (None, None)
    };

    let metrics = Metrics {
        started_at,
        os: std::env::consts::OS,
        depth: config.depth,
        breadth: config.breadth,
        timeout_ms: config.timeout_ms,
        graceful_ms: config.graceful_ms,
        tag: config.tag,
        runner_exit_code,
        total_elapsed_ms: wall_start.elapsed().as_millis(),
        processes_seen_before_verify,
        processes_seen_after_verify,
        killed_tree_confirmed,
        opened_total,
        opened_by_level: opened_by_level
            .into_iter()
            .map(|(level, count)| (level.to_string(), count))
            .collect(),
        closed_total,
        closed_by_level: closed_by_level.map(|map| {
            map.into_iter()
                .map(|(level, count)| (level.to_string(), count))
                .collect()
        }),
    };

    println!("=== METRICS ===");
    println!("{}", serde_json::to_string_pretty(&metrics)?);

    std::process::exit(if killed_tree_confirmed { 0 } else { 2 });
}

/// `breadth^level` processes open at each level 0..=depth.
fn level_counts(depth: u32, breadth: u32) -> HashMap<u32, u64> {
    let mut counts = HashMap::new();
    let mut at_level: u64 = 1;
    for level in 0..=depth {
        counts.insert(level, at_level);
        at_level = at_level.saturating_mul(breadth as u64);
    }
    counts
}

/// Hand-rolled RFC3339 UTC formatting — not worth a `chrono` dependency for
/// a single timestamp field.
fn rfc3339_now() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_rfc3339(now.as_secs(), now.subsec_millis())
}

fn format_rfc3339(epoch_secs: u64, millis: u32) -> String {
    const DAYS_IN_MONTH: [u64; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

    let days_total = epoch_secs / 86_400;
    let secs_of_day = epoch_secs % 86_400;
    let hour = secs_of_day / 3600;
    let minute = (secs_of_day % 3600) / 60;
    let second = secs_of_day % 60;

    let mut year = 1970u64;
    let mut remaining_days = days_total;
    loop {
        let days_in_year = if is_leap(year) { 366 } else { 365 };
        if remaining_days < days_in_year {
            break;
        }
        remaining_days -= days_in_year;
        year += 1;
    }

    let mut month = 0usize;
    for (i, &days) in DAYS_IN_MONTH.iter().enumerate() {
        let days = if i == 1 && is_leap(year) { 29 } else { days };
        if remaining_days < days {
            month = i;
            break;
        }
        remaining_days -= days;
    }
    let day = remaining_days + 1;

    format!(
        "{year:04}-{:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millis:03}Z",
        month + 1
    )
}

fn is_leap(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_counts_match_depth_three_breadth_five() {
        let counts = level_counts(3, 5);
        let total: u64 = counts.values().sum();
        assert_eq!(total, 1 + 5 + 25 + 125);
    }

    #[test]
    fn rfc3339_formats_epoch() {
        assert_eq!(format_rfc3339(0, 0), "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn rfc3339_formats_a_known_date() {
        // 2024-03-01T00:00:00Z, chosen to straddle a leap-year February.
        assert_eq!(format_rfc3339(1_709_251_200, 0), "2024-03-01T00:00:00.000Z");
    }
}
