use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`crate::Supervisor`], fixed for its whole lifetime.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Time to wait after the graceful signal before escalating to a
    /// forceful kill.
    pub graceful_wait: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            graceful_wait: Duration::from_millis(500),
        }
    }
}

/// What to spawn. Argv is already tokenized — no shell is ever invoked.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub executable: PathBuf,
    pub argv: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl SpawnRequest {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            argv: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Reference to the root of a supervised process tree.
///
/// `exit_status` is set exactly once, after the OS reports the process as
/// exited, and is observable before the owning [`crate::kill_domain::KillDomain`]
/// releases its handles.
#[derive(Debug, Clone)]
pub struct ChildHandle {
    pub pid: u32,
    pub exit_status: Option<std::process::ExitStatus>,
}

impl ChildHandle {
    pub fn has_exited(&self) -> bool {
        self.exit_status.is_some()
    }

    /// Records the OS-reported exit status. No-op if already set, since
    /// the status transitions at most once.
    pub fn mark_exited(&mut self, status: std::process::ExitStatus) {
        if self.exit_status.is_none() {
            self.exit_status = Some(status);
        }
    }
}

/// Result of one `run_with_timeout` call.
#[derive(Debug, Clone)]
pub struct SupervisionOutcome {
    /// Exit code of the root process. `None` if it was killed by a signal
    /// rather than exiting on its own (Unix only).
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    pub graceful_window_used: Duration,
    pub timed_out: bool,
    pub kill_escalated_to_force: bool,
}
