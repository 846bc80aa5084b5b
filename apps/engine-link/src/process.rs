//! Child process ownership for the engine.

use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

#[cfg(target_os = "linux")]
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd};
#[cfg(windows)]
use std::os::windows::io::{AsHandle, BorrowedHandle, OwnedHandle};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Identity of a child process plus the OS object used to reach into it.
///
/// On Linux this carries a pidfd so descriptors can later be duplicated out
/// of the child with `pidfd_getfd`; on Windows it carries a process handle
/// for `DuplicateHandle`.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    #[cfg(target_os = "linux")]
    pidfd: Option<OwnedFd>,
    #[cfg(windows)]
    handle: Option<OwnedHandle>,
}

impl ProcessHandle {
    #[cfg(target_os = "linux")]
    pub fn for_pid(pid: u32) -> Self {
        let pidfd = match pidfd_open(pid) {
            Ok(fd) => Some(fd),
            Err(err) => {
                warn!(pid, error = %err, "pidfd_open failed; descriptor import unavailable");
                None
            }
        };
        Self { pid, pidfd }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn for_pid(pid: u32) -> Self {
        Self {
            pid,
            #[cfg(windows)]
            handle: None,
        }
    }

    fn for_child(child: &Child) -> Self {
        #[cfg(windows)]
        {
            let handle = match child.as_handle().try_clone_to_owned() {
                Ok(handle) => Some(handle),
                Err(err) => {
                    warn!(pid = child.id(), error = %err, "failed to duplicate process handle");
                    None
                }
            };
            Self {
                pid: child.id(),
                handle,
            }
        }
        #[cfg(not(windows))]
        {
            Self::for_pid(child.id())
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[cfg(target_os = "linux")]
    pub fn pidfd(&self) -> Option<BorrowedFd<'_>> {
        use std::os::fd::AsFd;
        self.pidfd.as_ref().map(|fd| fd.as_fd())
    }

    #[cfg(windows)]
    pub fn process_handle(&self) -> Option<BorrowedHandle<'_>> {
        self.handle.as_ref().map(|handle| handle.as_handle())
    }
}

#[cfg(target_os = "linux")]
fn pidfd_open(pid: u32) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd as libc::c_int) })
}

/// A spawned engine. Dropping it kills and reaps the child if still running.
#[derive(Debug)]
pub struct EngineProcess {
    child: Child,
    handle: ProcessHandle,
    exit: Option<ExitStatus>,
}

impl EngineProcess {
    pub fn spawn(mut command: Command) -> Result<Self, ProcessError> {
        let program = PathBuf::from(command.get_program());
        let child = command
            .spawn()
            .map_err(|source| ProcessError::Spawn { program, source })?;
        let handle = ProcessHandle::for_child(&child);
        debug!(pid = child.id(), "engine process spawned");
        Ok(Self {
            child,
            handle,
            exit: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.handle.pid()
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Non-blocking exit check.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.exit = status,
                Err(err) => {
                    warn!(pid = self.pid(), error = %err, "failed to query engine process");
                }
            }
        }
        self.exit
    }

    pub fn is_alive(&mut self) -> bool {
        self.exit_status().is_none()
    }

    /// Asks the process to exit without forcing it.
    pub fn request_termination(&mut self) {
        if !self.is_alive() {
            return;
        }
        #[cfg(unix)]
        {
            let rc = unsafe { libc::kill(self.pid() as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                warn!(pid = self.pid(), error = %io::Error::last_os_error(), "SIGTERM failed");
            }
        }
    }

    /// Polls for exit until `timeout` elapses.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<ExitStatus> {
        if self.exit.is_none() {
            match wait_child(&mut self.child, timeout) {
                Ok(status) => self.exit = status,
                Err(err) => warn!(pid = self.pid(), error = %err, "failed to query engine process"),
            }
        }
        self.exit
    }

    /// Force-kills and reaps the child.
    pub fn kill(&mut self) -> Option<ExitStatus> {
        if let Some(status) = self.exit_status() {
            return Some(status);
        }
        if let Err(err) = self.child.kill() {
            warn!(pid = self.pid(), error = %err, "failed to kill engine process");
        }
        match self.child.wait() {
            Ok(status) => {
                self.exit = Some(status);
                Some(status)
            }
            Err(err) => {
                warn!(pid = self.pid(), error = %err, "failed to reap engine process");
                None
            }
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            self.kill();
        }
    }
}

/// Polls `child` for exit until `timeout` elapses without blocking on it.
pub(crate) fn wait_child(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        std::thread::sleep(EXIT_POLL_INTERVAL.min(deadline - now));
    }
}

pub fn describe_exit_status(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {signal}");
        }
    }

    "unknown status".to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sleeper(secs: &str) -> Command {
        let mut command = Command::new("sleep");
        command.arg(secs);
        command
    }

    #[test]
    fn spawn_failure_names_the_program() {
        let err = EngineProcess::spawn(Command::new("/nonexistent/engine-binary"))
            .expect_err("spawn should fail");
        match err {
            ProcessError::Spawn { program, .. } => {
                assert_eq!(program, PathBuf::from("/nonexistent/engine-binary"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn exit_is_observed_without_blocking() {
        let mut process = EngineProcess::spawn(Command::new("true")).expect("spawn");
        let status = process
            .wait_timeout(Duration::from_secs(5))
            .expect("true exits");
        assert!(status.success());
        assert!(!process.is_alive());
        assert_eq!(describe_exit_status(status), "exit code 0");
    }

    #[test]
    fn termination_request_stops_sleep() {
        let mut process = EngineProcess::spawn(sleeper("30")).expect("spawn");
        assert!(process.is_alive());
        assert!(process.wait_timeout(Duration::from_millis(20)).is_none());
        process.request_termination();
        let status = process
            .wait_timeout(Duration::from_secs(5))
            .expect("sleep honours SIGTERM");
        assert_eq!(describe_exit_status(status), "signal 15");
    }

    #[test]
    fn kill_reaps_child() {
        let mut process = EngineProcess::spawn(sleeper("30")).expect("spawn");
        let status = process.kill().expect("killed");
        assert!(!status.success());
        assert!(!process.is_alive());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn handle_carries_pid() {
        let process = EngineProcess::spawn(sleeper("30")).expect("spawn");
        assert_eq!(process.handle().pid(), process.pid());
    }
}
