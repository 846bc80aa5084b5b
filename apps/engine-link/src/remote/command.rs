//! Argument vectors for the `ssh` and `scp` clients.

use std::path::Path;
use std::process::Command;

use super::RemoteConfig;

fn push_option(command: &mut Command, option: impl AsRef<str>) {
    command.arg("-o").arg(option.as_ref());
}

fn control_path_option(config: &RemoteConfig) -> String {
    format!("ControlPath={}", config.control_path.display())
}

/// Interactive shell that also becomes the multiplexing master.
///
/// A TTY is forced even though stdio is piped so the remote side runs an
/// interactive shell. Keys are never offered: the single password prompt is
/// ssh's own.
pub fn interactive_shell(config: &RemoteConfig, target: &str, port: u16) -> Command {
    let mut command = Command::new(&config.ssh_program);
    command.arg("-tt");
    push_option(&mut command, "ControlMaster=auto");
    push_option(&mut command, control_path_option(config));
    push_option(
        &mut command,
        format!("ControlPersist={}", config.control_persist.as_secs()),
    );
    push_option(&mut command, "NumberOfPasswordPrompts=1");
    push_option(&mut command, "PubkeyAuthentication=no");
    push_option(&mut command, "PreferredAuthentications=keyboard-interactive,password");
    command.arg("-p").arg(port.to_string());
    if config.compress {
        command.arg("-C");
    }
    command.arg(target);
    command
}

/// Runs `remote_command` through an existing master and reverse-forwards
/// `remote_socket` on the remote host to `local_socket` here.
pub fn tunnelled_engine(
    config: &RemoteConfig,
    target: &str,
    port: u16,
    remote_socket: &str,
    local_socket: &Path,
    remote_command: &str,
) -> Command {
    let mut command = Command::new(&config.ssh_program);
    push_option(&mut command, "ControlMaster=no");
    push_option(&mut command, control_path_option(config));
    push_option(&mut command, "BatchMode=yes");
    push_option(&mut command, "ExitOnForwardFailure=yes");
    push_option(&mut command, "StreamLocalBindUnlink=yes");
    command
        .arg("-R")
        .arg(format!("{remote_socket}:{}", local_socket.display()));
    command.arg("-p").arg(port.to_string());
    if config.compress {
        command.arg("-C");
    }
    command.arg(target);
    command.arg(remote_command);
    command
}

/// `scp` through the master socket. Never prompts: without a live master it
/// fails instead.
pub fn copy(
    config: &RemoteConfig,
    port: u16,
    compress: bool,
    recursive: bool,
    source: &Path,
    destination: &str,
) -> Command {
    let mut command = Command::new(&config.scp_program);
    push_option(&mut command, "ControlMaster=no");
    push_option(&mut command, control_path_option(config));
    push_option(&mut command, "BatchMode=yes");
    command.arg("-P").arg(port.to_string());
    if compress {
        command.arg("-C");
    }
    if recursive {
        command.arg("-r");
    }
    command.arg(source);
    command.arg(destination);
    command
}

/// `user@host:path`, leaving an already-qualified path untouched.
pub fn scp_destination(user: Option<&str>, host: &str, remote_path: &str) -> String {
    if remote_path.contains(':') && !looks_like_drive_path(remote_path) {
        return remote_path.to_string();
    }
    match user {
        Some(user) if !user.is_empty() => format!("{user}@{host}:{remote_path}"),
        _ => format!("{host}:{remote_path}"),
    }
}

fn looks_like_drive_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Quotes each argument for a POSIX shell and joins them.
pub fn render_remote_command(args: &[String]) -> String {
    args.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(raw: &str) -> String {
    if raw.is_empty() {
        return "''".to_string();
    }
    let mut quoted = String::with_capacity(raw.len() + 2);
    quoted.push('\'');
    for ch in raw.chars() {
        if ch == '\'' {
            quoted.push_str("'\"'\"'");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}
