//! Platform abstraction for the process-tree kill group.
//!
//! A [`KillDomain`] groups one spawned root process together with every
//! process it (transitively) spawns, so that a single `signal_terminate` /
//! `terminate_now` call reaches the whole tree. Each platform picks its
//! strongest available primitive at construction time; [`Supervisor`] never
//! probes for capabilities itself.
//!
//! [`Supervisor`]: crate::supervisor::Supervisor

use std::io;

use crate::error::SupervisionError;
use crate::options::{ChildHandle, SpawnRequest};

#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub use unix::UnixKillDomain as PlatformKillDomain;
#[cfg(windows)]
pub use windows::WindowsKillDomain as PlatformKillDomain;

/// Capability every platform's kill-group primitive must provide.
///
/// Implementations own exactly one [`ChildHandle`] for their lifetime and
/// must make `release` idempotent and panic-free.
pub trait KillDomain {
    /// Spawn `request` as the root of a new kill domain, returning a handle
    /// to the root process. On success the domain owns the root (and, once
    /// it exists, every descendant) until `release` is called.
    fn spawn_and_attach(&mut self, request: &SpawnRequest) -> Result<ChildHandle, SupervisionError>;

    /// Deliver the "soft" termination signal to the whole group: `SIGTERM`
    /// to the negative PGID on Unix, dropping the Job handle (or a
    /// `taskkill /T` fallback) on Windows.
    fn signal_terminate(&mut self) -> io::Result<()>;

    /// Deliver the unconditional, unblockable termination: `SIGKILL` to the
    /// group on Unix, `TerminateJobObject` (or `taskkill /T /F`) on Windows.
    fn terminate_now(&mut self) -> io::Result<()>;

    /// Block until the root has exited, returning its reported status.
    /// Returns `Ok(None)` if `deadline` elapses first. On `Ok(Some(_))` the
    /// domain's own [`ChildHandle::exit_status`] is updated before this
    /// call returns, so `root_handle` reflects it immediately.
    fn wait_root(
        &mut self,
        deadline: Option<std::time::Duration>,
    ) -> io::Result<Option<std::process::ExitStatus>>;

    /// Release every OS handle the domain owns. Must be safe to call more
    /// than once and must never panic.
    fn release(&mut self);

    /// Root PID, once spawned. Used by the diagnostic descendant walk and
    /// the verifier.
    fn root_pid(&self) -> Option<u32>;

    /// The domain's own record of the root process, including its
    /// exit status once `wait_root` has observed one. `None` before
    /// `spawn_and_attach` succeeds.
    fn root_handle(&self) -> Option<&ChildHandle>;
}
