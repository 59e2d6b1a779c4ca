use std::io;

/// Failure modes surfaced to callers of [`crate::Supervisor::run_with_timeout`].
///
/// Errors that the supervisor can recover from on its own (a failed session
/// setup, a transient wait failure) are logged via `tracing` and never reach
/// this enum — only the handful of outcomes a caller must branch on do.
#[derive(Debug, thiserror::Error)]
pub enum SupervisionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to spawn child process: {os_error}")]
    SpawnFailed { os_error: io::Error },

    #[error(
        "termination incomplete: process tree not confirmed dead after forceful kill and bounded join"
    )]
    TerminationIncomplete,

    #[error("supervisor is already running a supervision; run_with_timeout is not reentrant")]
    Busy,
}
