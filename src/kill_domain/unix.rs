//! POSIX kill domain: session-leader model with a descendant-walk fallback.

use std::collections::HashSet;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::descendants::DescendantEnumerator;
use crate::error::SupervisionError;
use crate::options::{ChildHandle, SpawnRequest};

use super::KillDomain;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const FALLBACK_KILL_PASSES: u32 = 5;
const FALLBACK_KILL_INTERVAL: Duration = Duration::from_millis(150);

pub struct UnixKillDomain {
    child: Option<Child>,
    handle: Option<ChildHandle>,
    /// `true` once we've confirmed the child is its own process-group
    /// leader (pgid == pid). `false` means we fall back to walking and
    /// signalling descendants individually.
    session_leader: bool,
}

impl Default for UnixKillDomain {
    fn default() -> Self {
        Self {
            child: None,
            handle: None,
            session_leader: false,
        }
    }
}

impl UnixKillDomain {
    pub fn new() -> Self {
        Self::default()
    }

    fn pid(&self) -> Option<i32> {
        self.handle.as_ref().map(|h| h.pid as i32)
    }

    fn pgid_of(pid: i32) -> io::Result<i32> {
        // SAFETY: getpgid with a valid, live pid is always safe; a failure
        // is reported through errno and turned into an io::Error.
        let pgid = unsafe { libc::getpgid(pid) };
        if pgid < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(pgid)
        }
    }

    fn signal_group_or_fallback(&mut self, signal: libc::c_int) -> io::Result<()> {
        let pid = self.pid().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no child attached to this domain")
        })?;

        if self.session_leader {
            // SAFETY: kill with a negative pid targets the whole process
            // group; pid is a pgid we created via setsid/setpgid. ESRCH
            // (already gone) is not an error for our purposes.
            let rc = unsafe { libc::kill(-pid, signal) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(err);
                }
            }
            return Ok(());
        }

        // Fallback: no session leader, so reach every descendant
        // individually, leaves first, root last.
        let descendants = DescendantEnumerator::descendants(pid as u32);
        let mut ordered: Vec<u32> = descendants.into_iter().collect();
        ordered.sort_unstable();
        for desc_pid in ordered.into_iter().rev() {
            signal_pid(desc_pid as i32, signal);
        }
        signal_pid(pid, signal);
        Ok(())
    }
}

fn signal_pid(pid: i32, signal: libc::c_int) {
    // SAFETY: kill with a valid pid and signal; ESRCH (already exited) is
    // expected and harmless here, we only log anything else.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, %err, "failed to signal descendant");
        }
    }
}

impl KillDomain for UnixKillDomain {
    fn spawn_and_attach(
        &mut self,
        request: &SpawnRequest,
    ) -> Result<ChildHandle, SupervisionError> {
        let mut cmd = Command::new(&request.executable);
        cmd.args(&request.argv);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        // SAFETY: setsid() is async-signal-safe and is the only call made
        // in this pre_exec hook before exec takes over; a failure here is
        // reported as an io::Error and causes the fallback (non-session)
        // mode, not a spawn failure.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|os_error| SupervisionError::SpawnFailed { os_error })?;

        let pid = child.id() as i32;
        self.session_leader = Self::pgid_of(pid).map(|pgid| pgid == pid).unwrap_or(false);
        if !self.session_leader {
            warn!(pid, "session leader setup unconfirmed, falling back to descendant walk");
        }

        let handle = ChildHandle {
            pid: pid as u32,
            exit_status: None,
        };
        self.handle = Some(handle.clone());
        self.child = Some(child);
        Ok(handle)
    }

    fn signal_terminate(&mut self) -> io::Result<()> {
        self.signal_group_or_fallback(libc::SIGTERM)
    }

    fn terminate_now(&mut self) -> io::Result<()> {
        if self.session_leader {
            self.signal_group_or_fallback(libc::SIGKILL)
        } else {
            // Descendants may spawn between passes, so repeat rather than
            // trusting one sweep to be complete.
            for _ in 0..FALLBACK_KILL_PASSES {
                self.signal_group_or_fallback(libc::SIGKILL)?;
                std::thread::sleep(FALLBACK_KILL_INTERVAL);
            }
            Ok(())
        }
    }

    fn wait_root(
        &mut self,
        deadline: Option<Duration>,
    ) -> io::Result<Option<std::process::ExitStatus>> {
        let child = match &mut self.child {
            Some(c) => c,
            None => return Ok(None),
        };

        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                if let Some(handle) = self.handle.as_mut() {
                    handle.mark_exited(status);
                }
                return Ok(Some(status));
            }
            if let Some(deadline) = deadline {
                if start.elapsed() >= deadline {
                    return Ok(None);
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn release(&mut self) {
        // Reap the zombie if it hasn't been reaped yet; ignore errors, this
        // must never panic or surface a failure.
        if let Some(child) = self.child.as_mut() {
            let _ = child.try_wait();
        }
        self.child = None;
        self.handle = None;
    }

    fn root_pid(&self) -> Option<u32> {
        self.handle.as_ref().map(|h| h.pid)
    }

    fn root_handle(&self) -> Option<&ChildHandle> {
        self.handle.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawns_and_reaps_fast_command() {
        let mut domain = UnixKillDomain::new();
        let request = SpawnRequest::new("true");
        let handle = domain.spawn_and_attach(&request).unwrap();
        assert!(handle.pid > 0);
        let status = domain
            .wait_root(Some(Duration::from_secs(5)))
            .unwrap()
            .expect("child should have exited");
        assert!(status.success());
        assert!(domain.root_handle().unwrap().has_exited());
        domain.release();
        domain.release(); // idempotent
    }

    #[test]
    fn kills_group_on_timeout() {
        let mut domain = UnixKillDomain::new();
        let request = SpawnRequest::new("sleep").arg("30");
        domain.spawn_and_attach(&request).unwrap();
        assert!(domain.wait_root(Some(Duration::from_millis(50))).unwrap().is_none());
        assert!(!domain.root_handle().unwrap().has_exited());
        domain.signal_terminate().unwrap();
        let status = domain.wait_root(Some(Duration::from_secs(2)));
        if status.as_ref().ok().and_then(|s| *s).is_none() {
            domain.terminate_now().unwrap();
            domain
                .wait_root(Some(Duration::from_secs(2)))
                .unwrap()
                .expect("child should be dead after forceful kill");
        }
        assert!(domain.root_handle().unwrap().has_exited());
        domain.release();
    }
}
