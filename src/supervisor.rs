//! The deadline-driven lifecycle: spawn, wait, escalate, release.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::SupervisionError;
use crate::kill_domain::{KillDomain, PlatformKillDomain};
use crate::options::{SpawnRequest, SupervisionOutcome, SupervisorOptions};

/// A single tick of the state machine's poll loop. Short enough that the
/// deadline and any cancellation request are noticed promptly without
/// spinning the CPU.
const TICK: Duration = Duration::from_millis(10);

/// Bounded join budget after a forceful kill before giving up and
/// surfacing [`SupervisionError::TerminationIncomplete`].
const FORCE_JOIN_BUDGET: Duration = Duration::from_secs(2);

/// Cooperative cancellation handle. Clone and hand one half to another
/// thread; call [`CancellationToken::cancel`] to request early termination
/// of an in-flight [`Supervisor::run_with_timeout_cancellable`] call.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs one process tree to completion, guaranteeing its termination.
///
/// A `Supervisor` is reusable across multiple sequential calls, but a
/// single instance rejects overlapping `run_with_timeout` calls with
/// [`SupervisionError::Busy`] rather than interleaving two kill domains.
pub struct Supervisor {
    options: SupervisorOptions,
    busy: AtomicBool,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions) -> Self {
        Self {
            options,
            busy: AtomicBool::new(false),
        }
    }

    /// Spawn `request`, wait up to `timeout`, and guarantee that the whole
    /// tree is gone before returning.
    pub fn run_with_timeout(
        &self,
        request: &SpawnRequest,
        timeout: Duration,
    ) -> Result<SupervisionOutcome, SupervisionError> {
        self.run(request, timeout, None)
    }

    /// Same as [`Supervisor::run_with_timeout`], but `cancel` can cut the
    /// wait or grace window short from another thread.
    pub fn run_with_timeout_cancellable(
        &self,
        request: &SpawnRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SupervisionOutcome, SupervisionError> {
        self.run(request, timeout, Some(cancel))
    }

    fn run(
        &self,
        request: &SpawnRequest,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<SupervisionOutcome, SupervisionError> {
        if timeout.is_zero() {
            return Err(SupervisionError::InvalidArgument(
                "timeout must be strictly positive".into(),
            ));
        }
        if request.executable.as_os_str().is_empty() {
            return Err(SupervisionError::InvalidArgument(
                "executable must not be empty".into(),
            ));
        }

        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(SupervisionError::Busy);
        }
        let _busy_guard = BusyGuard(&self.busy);

        let mut domain = PlatformKillDomain::new();
        let mut release_guard = ReleaseGuard(Some(&mut domain));

        let start = Instant::now();
        let handle = release_guard.domain().spawn_and_attach(request)?;
        info!(pid = handle.pid, "spawned supervised process");

        // WAITING
        let cancelled = |c: Option<&CancellationToken>| c.map(|c| c.is_cancelled()).unwrap_or(false);
        let mut timed_out = false;
        loop {
            if cancelled(cancel) {
                timed_out = true;
                break;
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                timed_out = true;
                break;
            }
            let remaining = timeout - elapsed;
            match release_guard.domain().wait_root(Some(remaining.min(TICK))) {
                Ok(Some(status)) => {
                    log_exit(release_guard.domain(), status);
                    return Ok(finish(
                        status.code(),
                        start.elapsed(),
                        Duration::ZERO,
                        false,
                        false,
                    ));
                }
                Ok(None) => continue,
                Err(err) => {
                    warn!(%err, "wait failed while waiting for natural exit, escalating early");
                    timed_out = true;
                    break;
                }
            }
        }

        // KILLING_GRACEFUL
        if let Err(err) = release_guard.domain().signal_terminate() {
            warn!(%err, "graceful signal failed, proceeding to forceful kill");
        }

        let graceful_wait = if cancelled(cancel) {
            Duration::ZERO
        } else {
            self.options.graceful_wait
        };
        let grace_start = Instant::now();
        let mut graceful_window_used = Duration::ZERO;
        loop {
            let grace_elapsed = grace_start.elapsed();
            if grace_elapsed >= graceful_wait || cancelled(cancel) {
                graceful_window_used = grace_elapsed.min(graceful_wait);
                break;
            }
            let remaining = graceful_wait - grace_elapsed;
            match release_guard.domain().wait_root(Some(remaining.min(TICK))) {
                Ok(Some(status)) => {
                    log_exit(release_guard.domain(), status);
                    return Ok(finish(
                        status.code(),
                        start.elapsed(),
                        grace_start.elapsed(),
                        true,
                        false,
                    ));
                }
                Ok(None) => continue,
                Err(err) => {
                    warn!(%err, "wait failed during grace window, escalating to forceful kill");
                    break;
                }
            }
        }

        // KILLING_FORCE
        if let Err(err) = release_guard.domain().terminate_now() {
            warn!(%err, "forceful kill reported an error, still awaiting exit");
        }
        match release_guard.domain().wait_root(Some(FORCE_JOIN_BUDGET)) {
            Ok(Some(status)) => {
                log_exit(release_guard.domain(), status);
                Ok(finish(
                    status.code(),
                    start.elapsed(),
                    graceful_window_used,
                    true,
                    true,
                ))
            }
            Ok(None) | Err(_) => Err(SupervisionError::TerminationIncomplete),
        }
    }
}

/// Confirms the domain's own [`crate::options::ChildHandle`] observed the
/// exit before anything else is done with `status`, and logs it. This is
/// the one place the handle's exit status is actually consumed, rather than
/// `wait_root`'s `ExitStatus` bypassing it.
fn log_exit(domain: &PlatformKillDomain, status: std::process::ExitStatus) {
    match domain.root_handle() {
        Some(handle) if handle.has_exited() => {
            info!(pid = handle.pid, exit_code = ?status.code(), "child process exited");
        }
        _ => warn!("child process exited but its handle was not updated"),
    }
}

fn finish(
    exit_code: Option<i32>,
    elapsed: Duration,
    graceful_window_used: Duration,
    timed_out: bool,
    kill_escalated_to_force: bool,
) -> SupervisionOutcome {
    SupervisionOutcome {
        exit_code,
        elapsed,
        graceful_window_used,
        timed_out,
        kill_escalated_to_force,
    }
}

/// Resets the reentrancy guard on every exit path, including panics.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Guarantees `KillDomain::release()` runs exactly once per call to `run`,
/// on every exit path — normal return, error return, or panic unwind.
struct ReleaseGuard<'a>(Option<&'a mut PlatformKillDomain>);

impl<'a> ReleaseGuard<'a> {
    fn domain(&mut self) -> &mut PlatformKillDomain {
        self.0.as_mut().expect("domain taken before release")
    }
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        if let Some(domain) = self.0.take() {
            domain.release();
        }
    }
}

// These exercise real child processes via `true`/`sleep`/`sh`, which keeps
// them honest about actual OS behavior; gated to Unix where those binaries
// are guaranteed to exist. Cross-platform coverage lives in
// tests/integration.rs against the `treekill-payload` fixture instead.
#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn supervisor() -> Supervisor {
        Supervisor::new(SupervisorOptions {
            graceful_wait: Duration::from_millis(200),
        })
    }

    #[test]
    fn rejects_nonpositive_timeout() {
        let sup = supervisor();
        let request = SpawnRequest::new("true");
        let err = sup.run_with_timeout(&request, Duration::ZERO).unwrap_err();
        assert!(matches!(err, SupervisionError::InvalidArgument(_)));
    }

    #[test]
    fn honors_working_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("marker");
        std::fs::write(&marker, b"present").unwrap();

        let sup = supervisor();
        let request = SpawnRequest::new("test")
            .args(["-f", "marker"])
            .working_dir(tmp.path());
        let outcome = sup
            .run_with_timeout(&request, Duration::from_secs(5))
            .unwrap();
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[test]
    fn natural_exit_is_not_treated_as_timeout() {
        let sup = supervisor();
        let request = SpawnRequest::new("true");
        let outcome = sup
            .run_with_timeout(&request, Duration::from_secs(5))
            .unwrap();
        assert!(!outcome.timed_out);
        assert!(!outcome.kill_escalated_to_force);
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[test]
    fn slow_child_is_forcefully_killed() {
        let sup = Supervisor::new(SupervisorOptions {
            graceful_wait: Duration::from_millis(100),
        });
        let request = SpawnRequest::new("sleep").arg("30");
        let outcome = sup
            .run_with_timeout(&request, Duration::from_millis(200))
            .unwrap();
        assert!(outcome.timed_out);
        assert!(outcome.kill_escalated_to_force);
    }

    #[test]
    fn graceful_signal_alone_is_enough_when_the_child_traps_it() {
        // `sh` here traps SIGTERM and exits 0 itself; the supervisor should
        // observe that inside the grace window and never need to escalate.
        let sup = Supervisor::new(SupervisorOptions {
            graceful_wait: Duration::from_millis(800),
        });
        let request =
            SpawnRequest::new("sh").args(["-c", "trap 'exit 0' TERM; sleep 30"]);
        let outcome = sup
            .run_with_timeout(&request, Duration::from_millis(150))
            .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.kill_escalated_to_force);
        assert_eq!(outcome.exit_code, Some(0));
    }

    /// Resolves the `treekill-payload` binary built alongside this test
    /// binary, the same way the payload process discovers itself for
    /// re-exec when spawning descendants.
    fn payload_bin() -> std::path::PathBuf {
        let mut p = std::env::current_exe().expect("current exe");
        p.pop();
        if p.ends_with("deps") {
            p.pop();
        }
        p.push("treekill-payload");
        p
    }

    /// Two `Supervisor`s killing distinct tagged trees concurrently must not
    /// interfere with each other's verification: each only ever sees its own
    /// tag disappear, never the other's.
    #[test]
    fn two_concurrent_supervisors_with_distinct_tags_do_not_cross_kill() {
        use crate::verifier::VerifierProbe;

        fn run_one(tag: &'static str) -> bool {
            let sup = Supervisor::new(SupervisorOptions {
                graceful_wait: Duration::from_millis(100),
            });
            let request = SpawnRequest::new(payload_bin())
                .args(["--sleep-ms", "300000", "--tag", tag]);
            let _outcome = sup
                .run_with_timeout(&request, Duration::from_millis(200))
                .unwrap();
            std::thread::sleep(Duration::from_millis(150));
            VerifierProbe::any_left(tag)
        }

        let handle_a = std::thread::spawn(|| run_one("IT_CONCURRENT_A"));
        let handle_b = std::thread::spawn(|| run_one("IT_CONCURRENT_B"));
        let left_a = handle_a.join().unwrap();
        let left_b = handle_b.join().unwrap();

        assert!(!left_a, "tag A survivors should be fully reaped");
        assert!(!left_b, "tag B survivors should be fully reaped");
    }

    #[test]
    fn one_supervisor_can_run_twice_in_sequence() {
        let sup = supervisor();
        let first = sup
            .run_with_timeout(&SpawnRequest::new("true"), Duration::from_secs(5))
            .unwrap();
        let second = sup
            .run_with_timeout(&SpawnRequest::new("sleep").arg("30"), Duration::from_millis(150))
            .unwrap();
        assert!(!first.timed_out);
        assert!(second.timed_out);
    }
}
