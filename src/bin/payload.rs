//! Test fixture: forks a `--breadth`-wide, `--depth`-deep tree of copies of
//! itself, each sleeping for `--sleep-ms`, all carrying `--tag` on their
//! command line so callers can find them by process-table scan.

use std::process::Command;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "treekill-payload")]
struct Args {
    #[arg(long, default_value_t = 0)]
    depth: u32,

    #[arg(long, default_value_t = 0)]
    breadth: u32,

    #[arg(long = "sleep-ms", default_value_t = 0)]
    sleep_ms: u64,

    #[arg(long, default_value = "")]
    tag: String,

    /// Install a SIGTERM handler and exit cleanly as soon as one arrives,
    /// instead of riding out `--sleep-ms`. Unix only; ignored elsewhere
    /// since there is nothing to trap against a Job Object kill.
    #[arg(long, default_value_t = false)]
    trap_term: bool,
}

#[cfg(unix)]
mod term_trap {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TERMINATED: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_sigterm(_signum: libc::c_int) {
        TERMINATED.store(true, Ordering::SeqCst);
    }

    /// Replaces the default SIGTERM disposition with one that only flips a
    /// flag; async-signal-safe, no allocation or locking in the handler.
    pub fn install() {
        unsafe {
            libc::signal(libc::SIGTERM, on_sigterm as libc::sighandler_t);
        }
    }

    pub fn requested() -> bool {
        TERMINATED.load(Ordering::SeqCst)
    }
}

#[cfg(not(unix))]
mod term_trap {
    pub fn install() {}
    pub fn requested() -> bool {
        false
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn main() {
    let args = Args::parse();
    let pid = std::process::id();
    println!(
        "PID={pid} depth={} breadth={} tag={}",
        args.depth, args.breadth, args.tag
    );

    if args.trap_term {
        term_trap::install();
    }

    let mut children = Vec::new();
    if args.depth > 0 {
        let exe = std::env::current_exe().expect("resolve our own executable path");
        for _ in 0..args.breadth {
            let mut child_cmd = Command::new(&exe);
            child_cmd
                .arg("--depth")
                .arg((args.depth - 1).to_string())
                .arg("--breadth")
                .arg(args.breadth.to_string())
                .arg("--sleep-ms")
                .arg(args.sleep_ms.to_string())
                .arg("--tag")
                .arg(&args.tag);
            if args.trap_term {
                child_cmd.arg("--trap-term");
            }
            if let Ok(child) = child_cmd.spawn() {
                children.push(child);
            }
        }
    }

    sleep_or_until_signalled(args.sleep_ms, args.trap_term);

    for mut child in children {
        let _ = child.wait();
    }

    println!(
        "PID={pid} depth={} breadth={} tag={} exiting",
        args.depth, args.breadth, args.tag
    );
}

/// Sleeps out `sleep_ms`, but when `trap_term` is set, wakes early and
/// returns as soon as a SIGTERM has been observed rather than riding out the
/// full duration.
fn sleep_or_until_signalled(sleep_ms: u64, trap_term: bool) {
    if !trap_term {
        std::thread::sleep(Duration::from_millis(sleep_ms));
        return;
    }

    let total = Duration::from_millis(sleep_ms);
    let mut waited = Duration::ZERO;
    while waited < total {
        if term_trap::requested() {
            return;
        }
        let step = POLL_INTERVAL.min(total - waited);
        std::thread::sleep(step);
        waited += step;
    }
}
