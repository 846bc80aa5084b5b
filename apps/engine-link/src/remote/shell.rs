use std::io::{self, Write};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::probe::{self, CommandFrame, OsFamily};
use super::stream::PipeReader;
use super::{HostArch, HostOs, RemoteConfig, RemoteError, RemoteHostProfile, SessionState, command};
use crate::process::{describe_exit_status, wait_child};

const AUTH_POLL: Duration = Duration::from_millis(50);
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// An interactive `ssh` client driven over its three standard streams.
///
/// Constructed by [`RemoteShellSession::connect_password`], which returns
/// only once the login succeeded. Dropping the session asks the remote
/// shell to exit, then kills the client if it lingers.
pub struct RemoteShellSession {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: PipeReader<ChildStdout>,
    stderr: PipeReader<ChildStderr>,
    config: RemoteConfig,
    profile: RemoteHostProfile,
    state: SessionState,
    family_hint: Option<OsFamily>,
    commands_sent: u32,
}

impl RemoteShellSession {
    /// Starts ssh against `address` and waits for the login to resolve.
    ///
    /// The password is typed into ssh's own prompt; this only watches the
    /// streams. "Permission denied" on stderr fails immediately.
    pub fn connect_password(
        config: &RemoteConfig,
        address: &str,
        ssh_port: u16,
        copy_port: u16,
    ) -> Result<Self, RemoteError> {
        let mut command = command::interactive_shell(config, address, ssh_port);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn().map_err(|source| RemoteError::Spawn {
            program: config.ssh_program.clone(),
            source,
        })?;
        let (stdin, stdout, stderr) = match take_streams(&mut child) {
            Ok(streams) => streams,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err.into());
            }
        };

        info!(target: "engine_link::remote", %address, port = ssh_port, "connecting to remote host");
        let mut session = Self {
            child,
            stdin: Some(stdin),
            stdout,
            stderr,
            config: config.clone(),
            profile: RemoteHostProfile::new(address, ssh_port, copy_port),
            state: SessionState::Connecting,
            family_hint: None,
            commands_sent: 0,
        };
        if let Err(err) = session.authenticate() {
            return Err(session.fail(err));
        }
        Ok(session)
    }

    /// Waits for the shell to print the ready marker. Banners seen on the way
    /// only hint at the OS family; the echo of the ready command does not
    /// count.
    fn authenticate(&mut self) -> Result<(), RemoteError> {
        self.state = SessionState::Authenticating;
        self.write_line(probe::READY_COMMAND)?;
        let deadline = Instant::now() + self.config.auth_timeout;
        loop {
            self.check_denied()?;

            let mut authenticated = false;
            for line in self.stdout.read_lines(AUTH_POLL)? {
                if let Some(family) = probe::banner_family(&line) {
                    self.family_hint.get_or_insert(family);
                }
                if probe::is_login_banner(&line) {
                    debug!(target: "engine_link::remote", %line, "login banner");
                }
                authenticated |= probe::is_ready_line(&line);
            }
            if authenticated {
                self.state = SessionState::OsFingerprint;
                info!(target: "engine_link::remote", address = %self.profile.address, "authenticated");
                return Ok(());
            }

            if let Some(status) = self.child.try_wait()? {
                self.check_denied()?;
                return Err(RemoteError::AuthenticationFailed {
                    status: describe_exit_status(status),
                });
            }
            if Instant::now() >= deadline {
                return Err(RemoteError::AuthTimeout(self.config.auth_timeout));
            }
        }
    }

    fn check_denied(&mut self) -> Result<(), RemoteError> {
        for line in self.stderr.read_lines(Duration::ZERO)? {
            if probe::is_permission_denied(&line) {
                return Err(RemoteError::PermissionDenied(line));
            }
            debug!(target: "engine_link::remote", %line, "ssh stderr");
        }
        Ok(())
    }

    /// Resolves the remote OS, reusing what the login banner revealed.
    pub fn find_host_os(&mut self) -> Result<HostOs, RemoteError> {
        if self.profile.os != HostOs::Unknown {
            return Ok(self.profile.os);
        }
        self.state = SessionState::OsFingerprint;
        let family = match self.family_hint {
            Some(family) => Some(family),
            None => self
                .probe(probe::OS_COMMAND, probe::classify_uname)
                .map_err(|err| self.fail(err))?,
        };
        let os = match family {
            Some(OsFamily::Linux) => HostOs::Linux,
            Some(OsFamily::Windows) => self
                .probe(probe::SHELL_COMMAND, |lines| {
                    Some(probe::classify_windows_shell(lines))
                })
                .map_err(|err| self.fail(err))?
                .unwrap_or(HostOs::WindowsCmd),
            None => return Err(self.fail(RemoteError::UnsupportedOs)),
        };
        self.profile.os = os;
        self.state = SessionState::ArchFingerprint;
        info!(target: "engine_link::remote", ?os, "remote operating system");
        Ok(os)
    }

    pub fn find_host_architecture(&mut self) -> Result<HostArch, RemoteError> {
        if self.profile.architecture != HostArch::Unknown {
            return Ok(self.profile.architecture);
        }
        let os = self.find_host_os()?;
        self.state = SessionState::ArchFingerprint;
        let architecture = self
            .probe(probe::arch_command(os), probe::classify_arch)
            .map_err(|err| self.fail(err))?
            .ok_or(RemoteError::UnsupportedArchitecture)
            .map_err(|err| self.fail(err))?;
        self.profile.architecture = architecture;
        info!(target: "engine_link::remote", ?architecture, "remote architecture");
        Ok(architecture)
    }

    pub fn find_temp_directory(&mut self) -> Result<String, RemoteError> {
        if let Some(dir) = &self.profile.temp_directory {
            return Ok(dir.clone());
        }
        let os = self.find_host_os()?;
        let dir = self
            .probe(probe::temp_dir_command(os), probe::parse_temp_dir)
            .map_err(|err| self.fail(err))?
            .ok_or(RemoteError::TempDirUnresolved)
            .map_err(|err| self.fail(err))?;
        self.profile.temp_directory = Some(dir.clone());
        self.state = SessionState::TempDirResolved;
        debug!(target: "engine_link::remote", temp_dir = %dir, "remote temp directory");
        Ok(dir)
    }

    /// Runs every probe and marks the session ready.
    pub fn fingerprint(&mut self) -> Result<&RemoteHostProfile, RemoteError> {
        self.find_host_os()?;
        self.find_host_architecture()?;
        self.find_temp_directory()?;
        self.state = SessionState::Ready;
        Ok(&self.profile)
    }

    /// Sends `command` between two marker echoes and classifies what it
    /// printed once the end marker arrives. `None` when the probe timeout
    /// passes first or `classify` does not recognise the output.
    fn probe<T>(
        &mut self,
        command: &str,
        classify: impl Fn(&[String]) -> Option<T>,
    ) -> Result<Option<T>, RemoteError> {
        self.commands_sent += 1;
        let frame = CommandFrame::new(self.commands_sent);
        self.write_line(&frame.begin_command())?;
        self.write_line(command)?;
        self.write_line(&frame.end_command())?;

        let deadline = Instant::now() + self.config.probe_timeout;
        let mut lines = Vec::new();
        let mut errors = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            lines.extend(self.stdout.read_lines(remaining)?);
            errors.extend(self.stderr.read_lines(Duration::ZERO)?);
            if let Some(mut output) = frame.output(command, &lines) {
                output.append(&mut errors);
                let found = classify(&output);
                if found.is_none() {
                    debug!(target: "engine_link::remote", command, ?output, "probe output not recognised");
                }
                return Ok(found);
            }
            if remaining.is_zero() || self.stdout.is_closed() {
                debug!(target: "engine_link::remote", command, ?lines, "probe unanswered");
                return Ok(None);
            }
        }
    }

    /// Complete, non-empty stdout lines received within `timeout`.
    pub fn read(&mut self, timeout: Duration) -> Result<Vec<String>, RemoteError> {
        Ok(self.stdout.read_lines(timeout)?)
    }

    /// Complete, non-empty stderr lines received within `timeout`.
    pub fn read_error(&mut self, timeout: Duration) -> Result<Vec<String>, RemoteError> {
        Ok(self.stderr.read_lines(timeout)?)
    }

    /// Sends one command line, terminated with CRLF.
    pub fn send(&mut self, line: &str) -> Result<(), RemoteError> {
        if self.state == SessionState::Failed {
            return Err(RemoteError::SessionClosed);
        }
        self.write_line(line)
    }

    fn write_line(&mut self, line: &str) -> Result<(), RemoteError> {
        let stdin = self.stdin.as_mut().ok_or(RemoteError::SessionClosed)?;
        let result = stdin
            .write_all(line.as_bytes())
            .and_then(|()| stdin.write_all(b"\r\n"))
            .and_then(|()| stdin.flush());
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Err(RemoteError::SessionClosed),
            Err(err) => Err(err.into()),
        }
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn profile(&self) -> &RemoteHostProfile {
        &self.profile
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn fail(&mut self, err: RemoteError) -> RemoteError {
        error!(
            target: "engine_link::remote",
            address = %self.profile.address,
            stage = ?self.state,
            error = %err,
            "remote session failed"
        );
        self.state = SessionState::Failed;
        self.shutdown();
        err
    }

    fn shutdown(&mut self) {
        if self.is_alive() && self.stdin.is_some() {
            let _ = self.write_line("exit");
        }
        self.stdin = None;
        match wait_child(&mut self.child, EXIT_GRACE) {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(err) => warn!(target: "engine_link::remote", error = %err, "failed to query ssh"),
        }
        if let Err(err) = self.child.kill() {
            warn!(target: "engine_link::remote", error = %err, "failed to kill ssh");
        }
        let _ = self.child.wait();
    }
}

impl Drop for RemoteShellSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn take_streams(
    child: &mut Child,
) -> io::Result<(ChildStdin, PipeReader<ChildStdout>, PipeReader<ChildStderr>)> {
    let missing = || io::Error::other("ssh stdio was not redirected");
    let stdin = child.stdin.take().ok_or_else(missing)?;
    let stdout = child.stdout.take().ok_or_else(missing)?;
    let stderr = child.stderr.take().ok_or_else(missing)?;
    Ok((stdin, PipeReader::new(stdout)?, PipeReader::new(stderr)?))
}
