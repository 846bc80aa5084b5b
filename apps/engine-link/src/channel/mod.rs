//! Framed message transport between the editor and the engine process.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use engine_wire::{Message, Packet, WireError, decode_frame};
use thiserror::Error;
use tracing::{debug, trace, warn};

mod endpoint;

pub use endpoint::Endpoint;
use endpoint::{LocalListener, LocalStream};

const READ_CHUNK: usize = 64 * 1024;
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("peer disconnected")]
    Disconnected,
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),
    #[error("no peer connected within {0:?}")]
    AcceptTimeout(Duration),
    #[error("accept abandoned: {0}")]
    Abandoned(&'static str),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Listening side of the rendezvous. Removes its endpoint when dropped.
pub struct ChannelListener {
    endpoint: Endpoint,
    listener: LocalListener,
}

impl ChannelListener {
    pub fn bind(endpoint: Endpoint) -> Result<Self, ChannelError> {
        let listener = endpoint::bind(&endpoint)?;
        debug!(target: "engine_link::channel", path = %endpoint.path().display(), "listening");
        Ok(Self { endpoint, listener })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Waits up to `timeout` for exactly one peer. `keep_waiting` is polled
    /// between readiness checks so the caller can give up early, e.g. when
    /// the process that should connect has already exited.
    pub fn accept(
        &self,
        timeout: Duration,
        mut keep_waiting: impl FnMut() -> bool,
    ) -> Result<MessageChannel, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    debug!(target: "engine_link::channel", path = %self.endpoint.path().display(), "peer connected");
                    return MessageChannel::from_stream(stream);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
            if !keep_waiting() {
                return Err(ChannelError::Abandoned("peer process is gone"));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ChannelError::AcceptTimeout(timeout));
            }
            let slice = deadline.saturating_duration_since(now).min(ACCEPT_POLL_INTERVAL);
            self.wait_for_peer(slice)?;
        }
    }

    #[cfg(unix)]
    fn wait_for_peer(&self, slice: Duration) -> io::Result<()> {
        use std::os::fd::AsFd;
        crate::poll::wait_readable(self.listener.as_fd(), slice).map(|_| ())
    }

    #[cfg(windows)]
    fn wait_for_peer(&self, slice: Duration) -> io::Result<()> {
        let deadline = Instant::now() + slice;
        while crate::poll::backoff(deadline) {}
        Ok(())
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        endpoint::unlink(&self.endpoint);
    }
}

/// One end of a framed, ordered, bidirectional channel.
///
/// Reads never block: [`MessageChannel::receive`] drains whatever is
/// available. Writes block for at most the send timeout. Once any operation
/// fails the channel is dead and every later call returns
/// [`ChannelError::Closed`].
#[derive(Debug)]
pub struct MessageChannel {
    stream: LocalStream,
    inbound: BytesMut,
    alive: bool,
    send_timeout: Duration,
}

impl MessageChannel {
    fn from_stream(stream: LocalStream) -> Result<Self, ChannelError> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            alive: true,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        })
    }

    /// Engine-side constructor: connects to a listening editor.
    pub fn connect(endpoint: &Endpoint) -> Result<Self, ChannelError> {
        let stream = endpoint::connect(endpoint)?;
        Self::from_stream(stream)
    }

    /// Connected pair within one process.
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self), ChannelError> {
        let (left, right) = LocalStream::pair()?;
        Ok((Self::from_stream(left)?, Self::from_stream(right)?))
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Marks the channel dead without touching the socket.
    pub fn close(&mut self) {
        self.alive = false;
    }

    pub fn send_packet(&mut self, packet: &Packet) -> Result<(), ChannelError> {
        self.send(&packet.encode())
    }

    /// Writes header and payload as one unit.
    pub fn send(&mut self, message: &Message) -> Result<(), ChannelError> {
        if !self.alive {
            return Err(ChannelError::Closed);
        }
        let frame = message.to_frame()?;
        let result = self.write_all_bounded(&frame);
        if result.is_err() {
            self.alive = false;
        } else {
            trace!(target: "engine_link::channel", tag = message.tag(), len = message.len(), "sent");
        }
        result
    }

    fn write_all_bounded(&mut self, mut buf: &[u8]) -> Result<(), ChannelError> {
        let deadline = Instant::now() + self.send_timeout;
        while !buf.is_empty() {
            match self.stream.write(buf) {
                Ok(0) => return Err(ChannelError::Disconnected),
                Ok(written) => buf = &buf[written..],
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if !self.wait_writable(deadline)? {
                        return Err(ChannelError::SendTimeout(self.send_timeout));
                    }
                }
                Err(err) if is_disconnect(&err) => return Err(ChannelError::Disconnected),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn wait_writable(&self, deadline: Instant) -> io::Result<bool> {
        use std::os::fd::AsFd;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        crate::poll::wait_writable(self.stream.as_fd(), remaining)
    }

    #[cfg(windows)]
    fn wait_writable(&self, deadline: Instant) -> io::Result<bool> {
        Ok(crate::poll::backoff(deadline))
    }

    /// Appends every complete frame currently available to `out`, in arrival
    /// order, and returns how many were added.
    ///
    /// No data is not an error. On a transport failure the frames that
    /// arrived before it are still appended, the channel is marked dead and
    /// the error is returned.
    pub fn receive(&mut self, out: &mut VecDeque<Message>) -> Result<usize, ChannelError> {
        if !self.alive {
            return Err(ChannelError::Closed);
        }
        let mut hung_up = false;
        let mut failure = None;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    hung_up = true;
                    break;
                }
                Ok(read) => self.inbound.extend_from_slice(&chunk[..read]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if is_disconnect(&err) => {
                    hung_up = true;
                    break;
                }
                Err(err) => {
                    failure = Some(ChannelError::Io(err));
                    break;
                }
            }
        }

        let before = out.len();
        loop {
            match decode_frame(&mut self.inbound) {
                Ok(Some(message)) => out.push_back(message),
                Ok(None) => break,
                Err(err) => {
                    failure.get_or_insert(ChannelError::Wire(err));
                    break;
                }
            }
        }
        let added = out.len() - before;

        if let Some(err) = failure {
            warn!(target: "engine_link::channel", error = %err, "receive failed");
            self.alive = false;
            return Err(err);
        }
        if hung_up {
            if !self.inbound.is_empty() {
                debug!(
                    target: "engine_link::channel",
                    pending = self.inbound.len(),
                    "peer hung up mid-frame"
                );
            }
            self.alive = false;
            return Err(ChannelError::Disconnected);
        }
        Ok(added)
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}
