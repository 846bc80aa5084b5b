//! Remapping of native references that are only valid inside the engine
//! process into references the editor process owns.

use engine_wire::ForeignKind;

use super::HandoffError;
use crate::process::ProcessHandle;

#[cfg(unix)]
pub type LocalHandle = std::os::fd::OwnedFd;
#[cfg(windows)]
pub type LocalHandle = std::os::windows::io::OwnedHandle;

pub trait ForeignHandleImporter {
    /// Duplicates `value`, a reference living in `process`, into this process.
    fn import(
        &self,
        process: &ProcessHandle,
        kind: ForeignKind,
        value: u64,
    ) -> Result<LocalHandle, HandoffError>;
}

/// The importer for the host platform.
pub fn native_importer() -> Box<dyn ForeignHandleImporter> {
    #[cfg(target_os = "linux")]
    {
        Box::new(PidfdImporter)
    }
    #[cfg(windows)]
    {
        Box::new(DuplicateHandleImporter)
    }
    #[cfg(not(any(target_os = "linux", windows)))]
    {
        Box::new(UnsupportedImporter)
    }
}

/// Linux: `pidfd_getfd` against the engine's pidfd.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct PidfdImporter;

#[cfg(target_os = "linux")]
impl ForeignHandleImporter for PidfdImporter {
    fn import(
        &self,
        process: &ProcessHandle,
        kind: ForeignKind,
        value: u64,
    ) -> Result<LocalHandle, HandoffError> {
        use std::os::fd::{AsRawFd, FromRawFd};

        if kind != ForeignKind::Fd {
            return Err(HandoffError::UnsupportedKind(kind));
        }
        let target = libc::c_int::try_from(value)
            .map_err(|_| HandoffError::InvalidReference(value))?;
        let pidfd = process
            .pidfd()
            .ok_or(HandoffError::NoProcessReference(process.pid()))?;
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_getfd, pidfd.as_raw_fd(), target, 0) };
        if fd < 0 {
            return Err(HandoffError::Import {
                value,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(unsafe { LocalHandle::from_raw_fd(fd as libc::c_int) })
    }
}

/// Windows: `DuplicateHandle` from the engine process into ours.
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DuplicateHandleImporter;

#[cfg(windows)]
impl ForeignHandleImporter for DuplicateHandleImporter {
    fn import(
        &self,
        process: &ProcessHandle,
        kind: ForeignKind,
        value: u64,
    ) -> Result<LocalHandle, HandoffError> {
        use std::os::windows::io::{AsRawHandle, FromRawHandle, RawHandle};
        use windows_sys::Win32::Foundation::{DUPLICATE_SAME_ACCESS, DuplicateHandle, HANDLE};
        use windows_sys::Win32::System::Threading::GetCurrentProcess;

        if kind != ForeignKind::Handle {
            return Err(HandoffError::UnsupportedKind(kind));
        }
        let source = process
            .process_handle()
            .ok_or(HandoffError::NoProcessReference(process.pid()))?;
        let mut duplicated: HANDLE = 0;
        let ok = unsafe {
            DuplicateHandle(
                source.as_raw_handle() as HANDLE,
                value as HANDLE,
                GetCurrentProcess(),
                &mut duplicated,
                0,
                0,
                DUPLICATE_SAME_ACCESS,
            )
        };
        if ok == 0 {
            return Err(HandoffError::Import {
                value,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(unsafe { LocalHandle::from_raw_handle(duplicated as RawHandle) })
    }
}

#[cfg(not(any(target_os = "linux", windows)))]
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedImporter;

#[cfg(not(any(target_os = "linux", windows)))]
impl ForeignHandleImporter for UnsupportedImporter {
    fn import(
        &self,
        _process: &ProcessHandle,
        kind: ForeignKind,
        _value: u64,
    ) -> Result<LocalHandle, HandoffError> {
        Err(HandoffError::UnsupportedKind(kind))
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn pidfd_importer_rejects_windows_handles() {
        let process = ProcessHandle::for_pid(std::process::id());
        let err = PidfdImporter
            .import(&process, ForeignKind::Handle, 4)
            .expect_err("handles are not descriptors");
        assert!(matches!(err, HandoffError::UnsupportedKind(ForeignKind::Handle)));
    }

    #[test]
    fn pidfd_importer_rejects_out_of_range_descriptor() {
        let process = ProcessHandle::for_pid(std::process::id());
        let err = PidfdImporter
            .import(&process, ForeignKind::Fd, u64::MAX)
            .expect_err("not a descriptor");
        assert!(matches!(err, HandoffError::InvalidReference(u64::MAX)));
    }
}
