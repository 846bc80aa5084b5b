//! Commands sent to an unknown remote shell and classification of what
//! comes back. Everything here is pure so it can be checked without a host.
//!
//! With a forced TTY the remote echoes each command back, often behind a
//! prompt and sometimes before the previous command has answered. Every
//! command is therefore framed by two marker echoes, and only the lines the
//! markers print (never the echoed marker commands) delimit its output.

use super::{HostArch, HostOs};

/// Printed once the remote shell is reading commands.
pub const READY_MARKER: &str = "__ENGINE_LINK_READY__";

pub const READY_COMMAND: &str = "echo __ENGINE_LINK_READY__";
pub const OS_COMMAND: &str = "uname";
/// Prints `CMD` under cmd.exe and `PowerShell` under PowerShell.
pub const SHELL_COMMAND: &str = "(dir 2>&1 *`|echo CMD);&<# rem #>echo PowerShell";

const WINDOWS_MARKERS: &[&str] = &["is not recognized", "Microsoft Windows"];

/// Coarse result of the `uname` probe, before cmd and PowerShell are told
/// apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Linux,
    Windows,
}

pub fn is_permission_denied(line: &str) -> bool {
    line.to_ascii_lowercase().contains("permission denied")
}

/// The shell's answer to [`READY_COMMAND`], as opposed to the pty echo of
/// the command itself.
pub fn is_ready_line(line: &str) -> bool {
    line.trim() == READY_MARKER
}

/// Lines that only appear once a login has succeeded.
pub fn is_login_banner(line: &str) -> bool {
    line.starts_with("Last login")
        || line.starts_with("Welcome to")
        || line.contains("Microsoft Windows")
}

/// OS family implied by a login banner, if any.
pub fn banner_family(line: &str) -> Option<OsFamily> {
    if WINDOWS_MARKERS.iter().any(|marker| line.contains(marker)) {
        Some(OsFamily::Windows)
    } else if line.contains("GNU/Linux") {
        Some(OsFamily::Linux)
    } else {
        None
    }
}

/// Classifies the output of [`OS_COMMAND`].
pub fn classify_uname(lines: &[String]) -> Option<OsFamily> {
    let windows = lines
        .iter()
        .any(|line| WINDOWS_MARKERS.iter().any(|marker| line.contains(marker)));
    if windows {
        return Some(OsFamily::Windows);
    }
    lines
        .iter()
        .any(|line| line.contains("Linux"))
        .then_some(OsFamily::Linux)
}

/// Classifies the output of [`SHELL_COMMAND`]. Only PowerShell reaches the
/// trailing `echo PowerShell`; the echoed command line is ignored.
pub fn classify_windows_shell(lines: &[String]) -> HostOs {
    let powershell = lines
        .iter()
        .filter(|line| !line.contains(SHELL_COMMAND))
        .any(|line| line.trim() == "PowerShell");
    if powershell {
        HostOs::WindowsPowershell
    } else {
        HostOs::WindowsCmd
    }
}

/// Begin and end markers bracketing the output of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    begin: String,
    end: String,
}

impl CommandFrame {
    /// Markers unique to the `sequence`-th command of a session.
    pub fn new(sequence: u32) -> Self {
        Self {
            begin: format!("__ENGINE_LINK_BEGIN_{sequence}__"),
            end: format!("__ENGINE_LINK_END_{sequence}__"),
        }
    }

    pub fn begin_command(&self) -> String {
        format!("echo {}", self.begin)
    }

    pub fn end_command(&self) -> String {
        format!("echo {}", self.end)
    }

    /// Output of `command` once both markers have been printed, without the
    /// echoes of `command` and of the marker commands. `None` until the end
    /// marker shows up.
    pub fn output(&self, command: &str, lines: &[String]) -> Option<Vec<String>> {
        let start = lines.iter().position(|line| line.trim() == self.begin)? + 1;
        let len = lines[start..]
            .iter()
            .position(|line| line.trim() == self.end)?;
        let output = lines[start..start + len]
            .iter()
            .filter(|line| !line.contains(&self.begin) && !line.contains(&self.end))
            .filter(|line| !line.trim_end().ends_with(command))
            .cloned()
            .collect();
        Some(output)
    }
}

pub fn arch_command(os: HostOs) -> &'static str {
    match os {
        HostOs::WindowsCmd => "echo %PROCESSOR_ARCHITECTURE%",
        HostOs::WindowsPowershell => "echo $env:PROCESSOR_ARCHITECTURE",
        HostOs::Linux | HostOs::Unknown => "uname -m",
    }
}

pub fn classify_arch(lines: &[String]) -> Option<HostArch> {
    lines.iter().find_map(|line| {
        let token = line.trim().to_ascii_lowercase();
        if token.contains("x86_64") || token.contains("amd64") {
            Some(HostArch::Amd64)
        } else if token.contains("aarch64") || token.contains("arm64") {
            Some(HostArch::Arm64)
        } else {
            None
        }
    })
}

pub fn temp_dir_command(os: HostOs) -> &'static str {
    match os {
        HostOs::WindowsCmd => "echo %TEMP%",
        HostOs::WindowsPowershell => "echo $env:TEMP",
        HostOs::Linux | HostOs::Unknown => "echo ${TMPDIR:-/tmp}",
    }
}

/// First line that looks like an absolute path rather than an echo or a
/// prompt.
pub fn parse_temp_dir(lines: &[String]) -> Option<String> {
    lines.iter().map(|line| line.trim()).find_map(|line| {
        if line.contains('>') || line.contains("echo") {
            return None;
        }
        let bytes = line.as_bytes();
        let absolute = line.starts_with('/')
            || (bytes.len() >= 3
                && bytes[0].is_ascii_alphabetic()
                && bytes[1] == b':'
                && matches!(bytes[2], b'\\' | b'/'));
        absolute.then(|| line.to_string())
    })
}
