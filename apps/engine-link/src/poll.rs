//! Bounded readiness waits on raw descriptors.
//!
//! Nothing in the crate blocks on a read or write without a deadline; every
//! wait goes through here with an explicit timeout.

use std::io;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::fd::{AsRawFd, BorrowedFd};

#[cfg(unix)]
pub(crate) fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    wait_for(fd, libc::POLLIN, timeout)
}

#[cfg(unix)]
pub(crate) fn wait_writable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    wait_for(fd, libc::POLLOUT, timeout)
}

/// Returns `true` when the descriptor is ready for `events`, or has hung up
/// (a subsequent read then reports EOF).
#[cfg(unix)]
fn wait_for(fd: BorrowedFd<'_>, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let millis = remaining.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let mut pollfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pollfd, 1, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted && Instant::now() < deadline {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(false);
        }
        return Ok(pollfd.revents & (events | libc::POLLHUP | libc::POLLERR) != 0);
    }
}

#[cfg(unix)]
pub(crate) fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Windows has no readiness poll for the handle types used here; callers
/// retry non-blocking operations on a short cadence instead.
#[cfg(windows)]
pub(crate) fn backoff(deadline: Instant) -> bool {
    let now = Instant::now();
    if now >= deadline {
        return false;
    }
    std::thread::sleep(deadline.saturating_duration_since(now).min(Duration::from_millis(2)));
    true
}
