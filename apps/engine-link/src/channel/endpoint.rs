use std::io;
use std::path::{Path, PathBuf};

/// Rendezvous point for the editor and engine.
///
/// Both processes derive the same path from a well-known service name, so the
/// engine needs no arguments to find the editor. On unix the path is a
/// socket; on Windows it is a file holding the loopback port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    path: PathBuf,
}

impl Endpoint {
    pub fn new(directory: &Path, service: &str) -> Self {
        let file = if cfg!(windows) {
            format!("{service}.port")
        } else {
            format!("{service}.sock")
        };
        Self {
            path: directory.join(file),
        }
    }

    /// Endpoint under the host temp directory.
    pub fn in_temp_dir(service: &str) -> Self {
        Self::new(&std::env::temp_dir(), service)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
pub(crate) type LocalStream = std::os::unix::net::UnixStream;
#[cfg(unix)]
pub(crate) type LocalListener = std::os::unix::net::UnixListener;

#[cfg(windows)]
pub(crate) type LocalStream = std::net::TcpStream;
#[cfg(windows)]
pub(crate) type LocalListener = std::net::TcpListener;

#[cfg(unix)]
pub(crate) fn bind(endpoint: &Endpoint) -> io::Result<LocalListener> {
    match std::fs::remove_file(endpoint.path()) {
        Ok(()) => tracing::debug!(path = %endpoint.path().display(), "removed stale endpoint"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    let listener = LocalListener::bind(endpoint.path())?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

#[cfg(windows)]
pub(crate) fn bind(endpoint: &Endpoint) -> io::Result<LocalListener> {
    let listener = LocalListener::bind(("127.0.0.1", 0))?;
    listener.set_nonblocking(true)?;
    let port = listener.local_addr()?.port();
    std::fs::write(endpoint.path(), port.to_string())?;
    Ok(listener)
}

#[cfg(unix)]
pub(crate) fn connect(endpoint: &Endpoint) -> io::Result<LocalStream> {
    LocalStream::connect(endpoint.path())
}

#[cfg(windows)]
pub(crate) fn connect(endpoint: &Endpoint) -> io::Result<LocalStream> {
    let raw = std::fs::read_to_string(endpoint.path())?;
    let port: u16 = raw
        .trim()
        .parse()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    LocalStream::connect(("127.0.0.1", port))
}

pub(crate) fn unlink(endpoint: &Endpoint) {
    if let Err(err) = std::fs::remove_file(endpoint.path()) {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %endpoint.path().display(), error = %err, "failed to remove endpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_lives_under_directory() {
        let endpoint = Endpoint::new(Path::new("/tmp/rendezvous"), "engine-link");
        assert_eq!(endpoint.path().parent(), Some(Path::new("/tmp/rendezvous")));
        let name = endpoint.path().file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("engine-link."));
    }
}
