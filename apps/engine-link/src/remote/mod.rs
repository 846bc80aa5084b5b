//! Remote hosts reached through the system `ssh`/`scp` clients.
//!
//! A [`shell::RemoteShellSession`] authenticates once (the user answers
//! ssh's own password prompt) and leaves a multiplexing master behind on
//! the control socket. Later copy sessions and tunnelled engine launches
//! reuse that master instead of asking for the password again.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

pub mod command;
pub mod copy;
pub mod probe;
pub mod shell;
mod stream;

pub use copy::{CopyOutcome, CopyRequest, RemoteCopySession};
pub use shell::RemoteShellSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostOs {
    #[default]
    Unknown,
    Linux,
    WindowsCmd,
    WindowsPowershell,
}

impl HostOs {
    pub fn is_windows(self) -> bool {
        matches!(self, HostOs::WindowsCmd | HostOs::WindowsPowershell)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostArch {
    #[default]
    Unknown,
    Amd64,
    Arm64,
}

/// What the session learned about the remote machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteHostProfile {
    pub os: HostOs,
    pub architecture: HostArch,
    pub ssh_port: u16,
    pub copy_port: u16,
    pub address: String,
    pub temp_directory: Option<String>,
}

impl RemoteHostProfile {
    pub fn new(address: impl Into<String>, ssh_port: u16, copy_port: u16) -> Self {
        Self {
            os: HostOs::Unknown,
            architecture: HostArch::Unknown,
            ssh_port,
            copy_port,
            address: address.into(),
            temp_directory: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.os != HostOs::Unknown && self.architecture != HostArch::Unknown
    }

    /// Joins `name` onto the remote temp directory with the host's separator.
    pub fn temp_path(&self, name: &str) -> Option<String> {
        let dir = self.temp_directory.as_deref()?;
        let separator = if self.os.is_windows() { '\\' } else { '/' };
        let trimmed = dir.trim_end_matches(['/', '\\']);
        Some(format!("{trimmed}{separator}{name}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    OsFingerprint,
    ArchFingerprint,
    TempDirResolved,
    Ready,
    Failed,
}

/// Client binaries and multiplexing options shared by every remote session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub ssh_program: PathBuf,
    pub scp_program: PathBuf,
    /// ControlPath for the multiplexing master; ssh expands `%` tokens.
    pub control_path: PathBuf,
    pub control_persist: Duration,
    pub compress: bool,
    pub auth_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            scp_program: PathBuf::from("scp"),
            control_path: std::env::temp_dir().join("engine-link-ssh-%C"),
            control_persist: Duration::from_secs(600),
            compress: false,
            auth_timeout: Duration::from_secs(120),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("ssh exited before authenticating ({status})")]
    AuthenticationFailed { status: String },
    #[error("authentication did not complete within {0:?}")]
    AuthTimeout(Duration),
    #[error("remote session has exited")]
    SessionClosed,
    #[error("unsupported remote host: operating system not recognised")]
    UnsupportedOs,
    #[error("unsupported remote host: architecture not recognised")]
    UnsupportedArchitecture,
    #[error("could not determine the remote temp directory")]
    TempDirUnresolved,
    #[error("session is {0:?}, expected Ready")]
    NotReady(SessionState),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_path_uses_host_separator() {
        let mut profile = RemoteHostProfile::new("build-box", 22, 22);
        assert_eq!(profile.temp_path("engine.sock"), None);

        profile.os = HostOs::Linux;
        profile.temp_directory = Some("/tmp/".into());
        assert_eq!(profile.temp_path("engine.sock").as_deref(), Some("/tmp/engine.sock"));

        profile.os = HostOs::WindowsCmd;
        profile.temp_directory = Some(r"C:\Users\dev\AppData\Local\Temp".into());
        assert_eq!(
            profile.temp_path("stage").as_deref(),
            Some(r"C:\Users\dev\AppData\Local\Temp\stage")
        );
    }

    #[test]
    fn profile_serializes_with_snake_case_enums() {
        let mut profile = RemoteHostProfile::new("10.0.0.5", 2222, 22);
        profile.os = HostOs::WindowsPowershell;
        profile.architecture = HostArch::Amd64;
        let json = serde_json::to_value(&profile).expect("json");
        assert_eq!(json["os"], "windows_powershell");
        assert_eq!(json["architecture"], "amd64");
        assert_eq!(json["ssh_port"], 2222);
        assert!(profile.is_resolved());
    }
}
