//! Lifecycle and per-frame driving of the engine process.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use engine_wire::{CursorPos, Extent, KeyboardState, Message, MouseState, Packet};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelError, ChannelListener, Endpoint, MessageChannel};
use crate::handoff::{FrameHandoff, ForeignHandleImporter, GpuBackend, SwapImage, native_importer};
use crate::process::{EngineProcess, ProcessError, describe_exit_status};
use crate::remote::{HostOs, RemoteConfig, RemoteError, RemoteHostProfile, RemoteShellSession};

mod dispatch;
pub mod launch;
pub mod rate;
pub mod sinks;

pub use launch::LaunchTarget;
pub use rate::RateSample;
pub use sinks::{FrameSink, HeadlessSurface, LogSink, ProfilerSink, Sinks, WindowSink};

/// Grace period for an engine that announced it is closing.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("engine is already running")]
    AlreadyRunning,
    #[error("engine channel: {0}")]
    Channel(#[from] ChannelError),
    #[error("engine process: {0}")]
    Process(#[from] ProcessError),
    #[error("remote: {0}")]
    Remote(#[from] RemoteError),
    #[error("no ready remote session")]
    RemoteNotConnected,
    #[error("remote engines are not supported on {0:?} hosts")]
    UnsupportedRemote(HostOs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Terminating,
    Crashed,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub launch: LaunchTarget,
    pub service_name: String,
    pub rendezvous_dir: PathBuf,
    pub connect_timeout: Duration,
    pub stop_timeout: Duration,
    pub send_timeout: Duration,
    pub initial_size: Extent,
    pub remote: RemoteConfig,
}

impl SupervisorConfig {
    pub fn new(launch: LaunchTarget) -> Self {
        Self {
            launch,
            service_name: "engine-link".to_string(),
            rendezvous_dir: std::env::temp_dir(),
            connect_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(2),
            initial_size: Extent::new(1280, 720),
            remote: RemoteConfig::default(),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.rendezvous_dir, &self.service_name)
    }
}

/// Owns the engine process, its channel and the shared-image ring.
///
/// Single-threaded: the host calls [`EngineSupervisor::update`] once per
/// editor frame and every other method from the same thread.
pub struct EngineSupervisor {
    config: SupervisorConfig,
    state: SupervisorState,
    process: Option<EngineProcess>,
    channel: Option<MessageChannel>,
    inbox: VecDeque<Message>,
    handoff: FrameHandoff,
    gpu: Option<Box<dyn GpuBackend>>,
    importer: Box<dyn ForeignHandleImporter>,
    sinks: Sinks,
    size: Extent,
    engine_size: Option<Extent>,
    resize_pending: bool,
    input_capture: bool,
    fps: RateSample,
    ups: RateSample,
    remote: Option<RemoteShellSession>,
    closing: Option<ClosingEngine>,
}

/// An engine that sent `Close` and is reaped by later updates.
struct ClosingEngine {
    process: EngineProcess,
    deadline: Instant,
}

impl EngineSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let size = config.initial_size;
        Self {
            config,
            state: SupervisorState::Idle,
            process: None,
            channel: None,
            inbox: VecDeque::new(),
            handoff: FrameHandoff::new(),
            gpu: None,
            importer: native_importer(),
            sinks: Sinks::default(),
            size,
            engine_size: None,
            resize_pending: false,
            input_capture: true,
            fps: RateSample::new(),
            ups: RateSample::new(),
            remote: None,
            closing: None,
        }
    }

    /// Enables shared-image frames. Without a backend they are refused.
    pub fn with_gpu(mut self, gpu: Box<dyn GpuBackend>) -> Self {
        self.gpu = Some(gpu);
        self
    }

    pub fn with_importer(mut self, importer: Box<dyn ForeignHandleImporter>) -> Self {
        self.importer = importer;
        self
    }

    pub fn with_sinks(mut self, sinks: Sinks) -> Self {
        self.sinks = sinks;
        self
    }

    /// Spawns the engine and waits for it to connect.
    ///
    /// On failure nothing is left behind: the child is killed and the
    /// endpoint removed, and the supervisor stays idle.
    pub fn start(&mut self, working_dir: &Path) -> Result<(), SupervisorError> {
        if self.state != SupervisorState::Idle {
            return Err(SupervisorError::AlreadyRunning);
        }
        self.state = SupervisorState::Starting;
        match self.launch(working_dir) {
            Ok((process, channel)) => {
                info!(
                    target: "engine_link::supervisor",
                    pid = process.pid(),
                    width = self.size.width,
                    height = self.size.height,
                    "engine running"
                );
                self.process = Some(process);
                self.channel = Some(channel);
                self.resize_pending = false;
                self.state = SupervisorState::Running;
                Ok(())
            }
            Err(err) => {
                error!(target: "engine_link::supervisor", error = %err, "engine failed to start");
                self.state = SupervisorState::Idle;
                Err(err)
            }
        }
    }

    fn launch(
        &mut self,
        working_dir: &Path,
    ) -> Result<(EngineProcess, MessageChannel), SupervisorError> {
        let listener = ChannelListener::bind(self.config.endpoint())?;
        let command = self
            .config
            .launch
            .command(working_dir, listener.endpoint(), self.remote.as_ref())?;
        let mut process = EngineProcess::spawn(command)?;
        debug!(
            target: "engine_link::supervisor",
            pid = process.pid(),
            endpoint = %listener.endpoint().path().display(),
            "waiting for engine to connect"
        );
        let channel = listener.accept(self.config.connect_timeout, || process.is_alive())?;
        let mut channel = channel.with_send_timeout(self.config.send_timeout);
        channel.send_packet(&Packet::Resize(self.size))?;
        Ok((process, channel))
    }

    /// One editor tick: reaps a dead engine, dispatches everything the
    /// engine sent, presents pending shared frames and paces the next one.
    /// Never blocks on the engine process.
    pub fn update(&mut self) {
        if self.state == SupervisorState::Terminating {
            self.reap_closed();
            return;
        }
        if self.state != SupervisorState::Running {
            return;
        }

        if let Some(status) = self.process.as_mut().and_then(EngineProcess::exit_status) {
            warn!(
                target: "engine_link::supervisor",
                status = %describe_exit_status(status),
                "engine process exited"
            );
            self.release();
            return;
        }

        let Some(channel) = self.channel.as_mut() else {
            self.crash("engine channel missing");
            return;
        };
        let received = channel.receive(&mut self.inbox);

        while let Some(message) = self.inbox.pop_front() {
            if let dispatch::Flow::Closed = self.dispatch(message) {
                self.inbox.clear();
                return;
            }
        }
        if let Err(err) = received {
            error!(target: "engine_link::supervisor", error = %err, "engine channel failed");
            self.crash("receive failed");
            return;
        }

        self.present();

        if let Err(err) = self.send(&Packet::UnlockFrame) {
            error!(target: "engine_link::supervisor", error = %err, "failed to unlock frame");
            self.crash("send failed");
            return;
        }
        if self.resize_pending {
            if let Err(err) = self.send(&Packet::Resize(self.size)) {
                error!(target: "engine_link::supervisor", error = %err, "failed to send resize");
                self.crash("send failed");
                return;
            }
            self.resize_pending = false;
        }
    }

    fn present(&mut self) {
        if self.handoff.pending_swaps() == 0 {
            return;
        }
        let Some(gpu) = self.gpu.as_deref_mut() else {
            return;
        };
        if let Err(err) = self.handoff.present_pending(gpu, self.size) {
            error!(target: "engine_link::supervisor", error = %err, "failed to present shared frame");
        }
    }

    fn send(&mut self, packet: &Packet) -> Result<(), ChannelError> {
        match self.channel.as_mut() {
            Some(channel) => channel.send_packet(packet),
            None => Err(ChannelError::Closed),
        }
    }

    /// Asks the engine to close and waits for it, killing it after the
    /// stop timeout.
    pub fn stop(&mut self) {
        if let Some(mut closing) = self.closing.take() {
            let grace = closing.deadline.saturating_duration_since(Instant::now());
            if closing.process.wait_timeout(grace).is_none() {
                warn!(target: "engine_link::supervisor", pid = closing.process.pid(), "engine lingered after close; killing it");
                closing.process.kill();
            }
            self.state = SupervisorState::Idle;
        }
        if self.state != SupervisorState::Running {
            return;
        }
        self.state = SupervisorState::Terminating;
        if let Err(err) = self.send(&Packet::Close) {
            warn!(target: "engine_link::supervisor", error = %err, "failed to send close");
        }
        self.channel = None;
        if let Some(mut process) = self.process.take() {
            match process.wait_timeout(self.config.stop_timeout) {
                Some(status) => info!(
                    target: "engine_link::supervisor",
                    status = %describe_exit_status(status),
                    "engine stopped"
                ),
                None => {
                    error!(
                        target: "engine_link::supervisor",
                        pid = process.pid(),
                        timeout = ?self.config.stop_timeout,
                        "engine did not exit; killing it"
                    );
                    process.kill();
                }
            }
        }
        self.release();
    }

    /// Kills the engine immediately and releases everything.
    pub fn terminate(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.kill();
        }
        if let Some(mut closing) = self.closing.take() {
            closing.process.kill();
        }
        self.release();
    }

    fn crash(&mut self, reason: &'static str) {
        warn!(target: "engine_link::supervisor", reason, "engine crashed");
        self.state = SupervisorState::Crashed;
        self.terminate();
    }

    /// The engine announced it is closing. Everything but the process is
    /// released now; the process is reaped by later updates.
    fn closed_by_engine(&mut self) {
        info!(target: "engine_link::supervisor", "engine closed the connection");
        let process = self.process.take();
        self.release();
        if let Some(process) = process {
            self.closing = Some(ClosingEngine {
                process,
                deadline: Instant::now() + CLOSE_GRACE,
            });
            self.state = SupervisorState::Terminating;
        }
    }

    /// Polls a closing engine without blocking; kills it once the grace
    /// period is over.
    fn reap_closed(&mut self) {
        let Some(closing) = self.closing.as_mut() else {
            self.state = SupervisorState::Idle;
            return;
        };
        if let Some(status) = closing.process.exit_status() {
            info!(
                target: "engine_link::supervisor",
                status = %describe_exit_status(status),
                "engine exited after close"
            );
        } else if Instant::now() >= closing.deadline {
            warn!(target: "engine_link::supervisor", pid = closing.process.pid(), "engine lingered after close; killing it");
            closing.process.kill();
        } else {
            return;
        }
        self.closing = None;
        self.state = SupervisorState::Idle;
    }

    /// Common tail of every teardown path.
    fn release(&mut self) {
        self.channel = None;
        self.process = None;
        self.inbox.clear();
        match self.gpu.as_deref_mut() {
            Some(gpu) => self.handoff.flush(gpu),
            None => self.handoff.abandon(),
        }
        self.fps.reset();
        self.ups.reset();
        self.engine_size = None;
        self.resize_pending = false;
        self.state = SupervisorState::Idle;
    }

    pub fn push_cursor_pos(&mut self, position: CursorPos) {
        self.push_input(Packet::CursorPos(position));
    }

    pub fn push_mouse_state(&mut self, state: MouseState) {
        self.push_input(Packet::MouseState(state));
    }

    pub fn push_keyboard_state(&mut self, state: KeyboardState) {
        self.push_input(Packet::KeyboardState(state));
    }

    fn push_input(&mut self, packet: Packet) {
        if self.state != SupervisorState::Running || !self.input_capture {
            return;
        }
        if let Err(err) = self.send(&packet) {
            error!(target: "engine_link::supervisor", error = %err, kind = ?packet.kind(), "failed to forward input");
            self.crash("send failed");
        }
    }

    pub fn set_input_capture(&mut self, enabled: bool) {
        self.input_capture = enabled;
    }

    pub fn input_capture(&self) -> bool {
        self.input_capture
    }

    /// Changes the viewport size; the engine hears about it on the next
    /// update.
    pub fn set_size(&mut self, width: u32, height: u32) {
        let size = Extent::new(width, height);
        if size == self.size {
            return;
        }
        self.size = size;
        self.resize_pending = true;
    }

    pub fn width(&self) -> u32 {
        self.size.width
    }

    pub fn height(&self) -> u32 {
        self.size.height
    }

    /// Size the engine last reported rendering at.
    pub fn engine_size(&self) -> Option<Extent> {
        self.engine_size
    }

    pub fn fps(&self) -> u32 {
        self.fps.per_second()
    }

    pub fn ups(&self) -> u32 {
        self.ups.per_second()
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SupervisorState::Running
    }

    pub fn handoff(&self) -> &FrameHandoff {
        &self.handoff
    }

    /// The shared image to sample for the current frame. `None` while no
    /// shared images are imported.
    pub fn current_image(&self) -> Option<&SwapImage> {
        self.handoff.current()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(EngineProcess::pid)
    }

    /// Authenticates against a remote host and fingerprints it. The session
    /// is kept for remote launches and file staging.
    pub fn connect_remote_password(
        &mut self,
        address: &str,
        ssh_port: u16,
        copy_port: u16,
    ) -> Result<&RemoteHostProfile, SupervisorError> {
        self.remote = None;
        let mut session =
            RemoteShellSession::connect_password(&self.config.remote, address, ssh_port, copy_port)?;
        session.fingerprint()?;
        Ok(self.remote.insert(session).profile())
    }

    pub fn remote_session(&self) -> Option<&RemoteShellSession> {
        self.remote.as_ref()
    }

    pub fn remote_session_mut(&mut self) -> Option<&mut RemoteShellSession> {
        self.remote.as_mut()
    }
}

impl Drop for EngineSupervisor {
    fn drop(&mut self) {
        self.stop();
        if self.process.is_some() || self.closing.is_some() {
            self.terminate();
        }
    }
}
