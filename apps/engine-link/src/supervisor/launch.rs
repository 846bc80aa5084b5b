use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::channel::Endpoint;
use crate::remote::{HostOs, RemoteShellSession, command};

use super::SupervisorError;

/// Environment variable carrying the rendezvous path to the engine.
pub const ENDPOINT_ENV: &str = "ENGINE_LINK_ENDPOINT";

/// Where the engine executable runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchTarget {
    Local {
        executable: PathBuf,
        args: Vec<String>,
    },
    /// Started through the remote shell session's master connection. The
    /// engine's socket on the remote host is forwarded back to the local
    /// rendezvous endpoint.
    Remote {
        executable: String,
        args: Vec<String>,
    },
}

impl LaunchTarget {
    pub fn local(executable: impl Into<PathBuf>) -> Self {
        LaunchTarget::Local {
            executable: executable.into(),
            args: Vec::new(),
        }
    }

    pub(crate) fn command(
        &self,
        working_dir: &Path,
        endpoint: &Endpoint,
        remote: Option<&RemoteShellSession>,
    ) -> Result<Command, SupervisorError> {
        match self {
            LaunchTarget::Local { executable, args } => {
                let mut command = Command::new(executable);
                command
                    .arg("--headless")
                    .arg(working_dir)
                    .args(args)
                    .env(ENDPOINT_ENV, endpoint.path())
                    .stdin(Stdio::null());
                Ok(command)
            }
            LaunchTarget::Remote { executable, args } => {
                let session = remote.ok_or(SupervisorError::RemoteNotConnected)?;
                let profile = session.profile();
                if profile.os != HostOs::Linux {
                    return Err(SupervisorError::UnsupportedRemote(profile.os));
                }
                let file_name = endpoint
                    .path()
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "engine-link.sock".to_string());
                let remote_socket = profile
                    .temp_path(&file_name)
                    .ok_or(SupervisorError::RemoteNotConnected)?;

                let mut remote_args = vec![
                    "env".to_string(),
                    format!("{ENDPOINT_ENV}={remote_socket}"),
                    executable.clone(),
                    "--headless".to_string(),
                    working_dir.to_string_lossy().into_owned(),
                ];
                remote_args.extend(args.iter().cloned());

                let mut command = command::tunnelled_engine(
                    session.config(),
                    &profile.address,
                    profile.ssh_port,
                    &remote_socket,
                    endpoint.path(),
                    &command::render_remote_command(&remote_args),
                );
                command.stdin(Stdio::null());
                Ok(command)
            }
        }
    }
}
