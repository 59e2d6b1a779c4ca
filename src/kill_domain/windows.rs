//! Windows kill domain: a Job Object with `KILL_ON_JOB_CLOSE`, falling back
//! to `taskkill` when Job setup fails.

use std::ffi::c_void;
use std::io;
use std::os::windows::io::AsRawHandle;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use tracing::warn;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
    JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
    SetInformationJobObject, TerminateJobObject,
};

use crate::error::SupervisionError;
use crate::options::{ChildHandle, SpawnRequest};

use super::KillDomain;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Default)]
pub struct WindowsKillDomain {
    child: Option<Child>,
    handle: Option<ChildHandle>,
    job: Option<HANDLE>,
    /// `true` once a termination step (graceful or forceful) has actually
    /// run, so `release`/`terminate_now` stay idempotent.
    terminated: bool,
}

impl WindowsKillDomain {
    pub fn new() -> Self {
        Self::default()
    }

    fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(|h| h.pid)
    }

    fn create_job_for(pid: u32) -> io::Result<HANDLE> {
        // SAFETY: CreateJobObjectW with no name/attributes is a plain
        // resource-creation call; the returned handle is owned by us.
        let job = unsafe { CreateJobObjectW(None, None) }
            .map_err(|e| io::Error::from_raw_os_error(e.code().0))?;

        let mut info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
        info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;

        // SAFETY: job is a valid, just-created job handle; info and its size
        // match the expected struct for this information class.
        let set_result = unsafe {
            SetInformationJobObject(
                job,
                JobObjectExtendedLimitInformation,
                &info as *const _ as *const c_void,
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            )
        };
        if let Err(e) = set_result {
            // SAFETY: job is a valid handle we own.
            unsafe { let _ = CloseHandle(job); };
            return Err(io::Error::from_raw_os_error(e.code().0));
        }

        warn!(pid, "created job object with KILL_ON_JOB_CLOSE");
        Ok(job)
    }

    fn taskkill(pid: u32, force: bool) {
        let mut cmd = Command::new("taskkill");
        cmd.args(["/PID", &pid.to_string(), "/T"]);
        if force {
            cmd.arg("/F");
        }
        match cmd.output() {
            Ok(output) if !output.status.success() => {
                warn!(pid, force, status = ?output.status, "taskkill fallback reported failure");
            }
            Err(err) => warn!(pid, force, %err, "failed to invoke taskkill fallback"),
            _ => {}
        }
    }
}

impl KillDomain for WindowsKillDomain {
    fn spawn_and_attach(
        &mut self,
        request: &SpawnRequest,
    ) -> Result<ChildHandle, SupervisionError> {
        let mut cmd = Command::new(&request.executable);
        cmd.args(&request.argv);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|os_error| SupervisionError::SpawnFailed { os_error })?;
        let pid = child.id();

        match Self::create_job_for(pid) {
            Ok(job) => {
                let process_handle = HANDLE(child.as_raw_handle());
                // SAFETY: job was just created by us; process_handle comes
                // from the child we just spawned and is still open.
                let assign = unsafe { AssignProcessToJobObject(job, process_handle) };
                if let Err(e) = assign {
                    warn!(pid, error = ?e, "assigning child to job object failed, falling back to taskkill");
                    // SAFETY: job is a valid handle we own.
                    unsafe { let _ = CloseHandle(job); };
                    self.job = None;
                } else {
                    self.job = Some(job);
                }
            }
            Err(err) => {
                warn!(pid, %err, "job object setup failed, falling back to taskkill");
                self.job = None;
            }
        }

        let handle = ChildHandle {
            pid,
            exit_status: None,
        };
        self.handle = Some(handle.clone());
        self.child = Some(child);
        Ok(handle)
    }

    fn signal_terminate(&mut self) -> io::Result<()> {
        let pid = self
            .pid()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no child attached"))?;

        match self.job.take() {
            Some(job) => {
                // Dropping the last handle to a KILL_ON_JOB_CLOSE job
                // terminates every process in it; this is our "soft" step.
                // SAFETY: job is a valid handle we own and haven't closed yet.
                let result = unsafe { CloseHandle(job) };
                self.terminated = true;
                result.map_err(|e| io::Error::from_raw_os_error(e.code().0))
            }
            None if !self.terminated => {
                Self::taskkill(pid, false);
                Ok(())
            }
            None => Ok(()), // already terminated
        }
    }

    fn terminate_now(&mut self) -> io::Result<()> {
        let pid = self
            .pid()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no child attached"))?;

        if self.terminated {
            return Ok(());
        }

        match self.job.take() {
            Some(job) => {
                // SAFETY: job is a valid handle we own.
                let result = unsafe { TerminateJobObject(job, 1) };
                unsafe { let _ = CloseHandle(job); };
                self.terminated = true;
                result.map_err(|e| io::Error::from_raw_os_error(e.code().0))
            }
            None => {
                Self::taskkill(pid, true);
                self.terminated = true;
                Ok(())
            }
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
        if let Some(job) = self.job.take() {
            // SAFETY: job is a handle we own; closing it is always valid.
            unsafe { let _ = CloseHandle(job); };
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.try_wait();
        }
        self.child = None;
        self.handle = None;
        self.terminated = false;
    }

    fn root_pid(&self) -> Option<u32> {
        self.pid()
    }

    fn root_handle(&self) -> Option<&ChildHandle> {
        self.handle.as_ref()
    }
}
