//! Background `scp` transfers over an authenticated master connection.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use super::{RemoteConfig, RemoteError, command};
use crate::process::describe_exit_status;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    pub user: Option<String>,
    pub address: String,
    pub source: PathBuf,
    pub destination: String,
    pub port: u16,
    pub compress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// scp exited on its own. A non-zero code still counts: scp reports
    /// partial failures that way.
    Completed { code: i32 },
    /// Killed by a signal it did not ask for.
    Crashed { signal: Option<i32> },
    Cancelled,
}

impl CopyOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, CopyOutcome::Completed { .. })
    }
}

/// One running transfer. The child is owned by a task on the current tokio
/// runtime; dropping the session cancels the transfer.
pub struct RemoteCopySession {
    destination: String,
    outcome: watch::Receiver<Option<CopyOutcome>>,
    cancel: Option<oneshot::Sender<()>>,
}

impl RemoteCopySession {
    /// Spawns scp. Directories are copied recursively. Must be called from
    /// within a tokio runtime.
    pub fn create(config: &RemoteConfig, request: &CopyRequest) -> Result<Self, RemoteError> {
        let destination = command::scp_destination(
            request.user.as_deref(),
            &request.address,
            &request.destination,
        );
        let recursive = request.source.is_dir();
        let std_command = command::copy(
            config,
            request.port,
            request.compress,
            recursive,
            &request.source,
            &destination,
        );
        let mut command = Command::from(std_command);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|source| RemoteError::Spawn {
            program: config.scp_program.clone(),
            source,
        })?;

        info!(
            target: "engine_link::remote",
            source = %request.source.display(),
            destination = %destination,
            recursive,
            "copy started"
        );
        let (outcome_tx, outcome) = watch::channel(None);
        let (cancel, cancel_rx) = oneshot::channel();
        tokio::spawn(supervise(child, destination.clone(), cancel_rx, outcome_tx));
        Ok(Self {
            destination,
            outcome,
            cancel: Some(cancel),
        })
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn is_alive(&self) -> bool {
        self.outcome.borrow().is_none()
    }

    /// The outcome, if the transfer has finished.
    pub fn outcome(&self) -> Option<CopyOutcome> {
        *self.outcome.borrow()
    }

    pub async fn wait(&mut self) -> CopyOutcome {
        loop {
            if let Some(outcome) = *self.outcome.borrow_and_update() {
                return outcome;
            }
            if self.outcome.changed().await.is_err() {
                return self.outcome().unwrap_or(CopyOutcome::Cancelled);
            }
        }
    }

    /// Kills the transfer. A no-op once it has finished.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

impl Drop for RemoteCopySession {
    fn drop(&mut self) {
        self.cancel();
        if self.outcome().is_none() {
            debug!(target: "engine_link::remote", destination = %self.destination, "copy session dropped while running");
        }
    }
}

async fn supervise(
    mut child: Child,
    destination: String,
    cancel: oneshot::Receiver<()>,
    outcome: watch::Sender<Option<CopyOutcome>>,
) {
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "engine_link::remote", %line, "scp stderr");
            }
        });
    }

    let result = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => classify(status, &destination),
            Err(err) => {
                warn!(target: "engine_link::remote", error = %err, "failed to wait for scp");
                CopyOutcome::Crashed { signal: None }
            }
        },
        _ = cancel => {
            if let Err(err) = child.kill().await {
                warn!(target: "engine_link::remote", error = %err, "failed to kill scp");
            }
            info!(target: "engine_link::remote", %destination, "copy cancelled");
            CopyOutcome::Cancelled
        }
    };
    let _ = outcome.send(Some(result));
}

fn classify(status: ExitStatus, destination: &str) -> CopyOutcome {
    if let Some(code) = status.code() {
        if code == 0 {
            info!(target: "engine_link::remote", %destination, "copy finished");
        } else {
            warn!(target: "engine_link::remote", %destination, code, "scp exited with an error code");
        }
        return CopyOutcome::Completed { code };
    }
    warn!(
        target: "engine_link::remote",
        %destination,
        status = %describe_exit_status(status),
        "scp terminated abnormally"
    );
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        CopyOutcome::Crashed {
            signal: status.signal(),
        }
    }
    #[cfg(not(unix))]
    {
        CopyOutcome::Crashed { signal: None }
    }
}
