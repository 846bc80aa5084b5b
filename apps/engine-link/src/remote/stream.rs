//! Non-blocking line reads from a child's stdout or stderr.

use std::io::{self, Read};
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 4096;

/// Bytes received so far, split into lines on demand. A trailing partial
/// line stays buffered until its newline arrives.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub(crate) fn has_line(&self) -> bool {
        self.pending
            .split(|byte| *byte == b'\n')
            .rev()
            .skip(1)
            .any(|line| !is_blank(line))
    }

    /// Removes every complete line, dropping blank ones and trailing `\r`.
    pub(crate) fn take_lines(&mut self) -> Vec<String> {
        let Some(last_newline) = self.pending.iter().rposition(|byte| *byte == b'\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete
            .split(|byte| *byte == b'\n')
            .filter(|line| !is_blank(line))
            .map(|line| {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                String::from_utf8_lossy(line).into_owned()
            })
            .collect()
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

#[cfg(unix)]
pub(crate) trait Pipe: Read + std::os::fd::AsFd {}
#[cfg(unix)]
impl<T: Read + std::os::fd::AsFd> Pipe for T {}

#[cfg(windows)]
pub(crate) trait Pipe: Read + std::os::windows::io::AsRawHandle {}
#[cfg(windows)]
impl<T: Read + std::os::windows::io::AsRawHandle> Pipe for T {}

/// One redirected child stream with its line buffer.
pub(crate) struct PipeReader<R> {
    pipe: R,
    lines: LineBuffer,
    closed: bool,
}

impl<R: Pipe> PipeReader<R> {
    pub(crate) fn new(pipe: R) -> io::Result<Self> {
        #[cfg(unix)]
        crate::poll::set_nonblocking(pipe.as_fd())?;
        Ok(Self {
            pipe,
            lines: LineBuffer::default(),
            closed: false,
        })
    }

    /// Whether the writer side has gone away.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Waits up to `timeout` for at least one complete line and returns
    /// every complete line buffered so far.
    pub(crate) fn read_lines(&mut self, timeout: Duration) -> io::Result<Vec<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            self.fill()?;
            if self.closed || self.lines.has_line() {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.wait(remaining)? {
                break;
            }
        }
        Ok(self.lines.take_lines())
    }

    /// Reads whatever is available right now.
    fn fill(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        while !self.closed {
            match self.read_available(&mut chunk) {
                Ok(0) => self.closed = true,
                Ok(read) => self.lines.push(&chunk[..read]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => self.closed = true,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.pipe.read(buf)
    }

    #[cfg(unix)]
    fn wait(&self, timeout: Duration) -> io::Result<bool> {
        crate::poll::wait_readable(self.pipe.as_fd(), timeout)
    }

    /// Anonymous pipes cannot be made non-blocking on Windows, so only the
    /// byte count `PeekNamedPipe` reports is read.
    #[cfg(windows)]
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use windows_sys::Win32::Foundation::{ERROR_BROKEN_PIPE, HANDLE};
        use windows_sys::Win32::System::Pipes::PeekNamedPipe;

        let mut available: u32 = 0;
        let ok = unsafe {
            PeekNamedPipe(
                self.pipe.as_raw_handle() as HANDLE,
                std::ptr::null_mut(),
                0,
                std::ptr::null_mut(),
                &mut available,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(ERROR_BROKEN_PIPE as i32) {
                return Ok(0);
            }
            return Err(err);
        }
        if available == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let len = buf.len().min(available as usize);
        self.pipe.read(&mut buf[..len])
    }

    #[cfg(windows)]
    fn wait(&self, timeout: Duration) -> io::Result<bool> {
        Ok(crate::poll::backoff(Instant::now() + timeout))
    }
}
