#![cfg(unix)]

use std::collections::VecDeque;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use engine_link::channel::{ChannelError, Endpoint, MessageChannel};
use engine_link::handoff::{
    ForeignHandleImporter, GpuBackend, GpuError, GpuImage, GpuMemory, GpuSemaphore, HandoffError,
    LocalHandle,
};
use engine_link::process::{ProcessError, ProcessHandle};
use engine_link::supervisor::{
    EngineSupervisor, LaunchTarget, SupervisorConfig, SupervisorError, SupervisorState,
};
use engine_wire::{CursorPos, DmaBuffer, Extent, ForeignKind, Message, Packet, TimingSample};

const VIEWPORT: Extent = Extent::new(320, 240);

fn fake_engine(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("engine.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write engine script");
    let mut permissions = fs::metadata(&path).expect("metadata").permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&path, permissions).expect("chmod engine script");
    path
}

fn config(dir: &Path, engine: PathBuf) -> SupervisorConfig {
    let mut config = SupervisorConfig::new(LaunchTarget::local(engine));
    config.rendezvous_dir = dir.to_path_buf();
    config.service_name = "lifecycle".to_string();
    config.connect_timeout = Duration::from_secs(5);
    config.stop_timeout = Duration::from_millis(300);
    config.initial_size = VIEWPORT;
    config
}

/// Plays the engine's side of the rendezvous from a test thread.
fn spawn_peer(endpoint: Endpoint) -> JoinHandle<MessageChannel> {
    thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match MessageChannel::connect(&endpoint) {
                Ok(channel) => return channel,
                Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
                Err(err) => panic!("peer could not connect: {err}"),
            }
        }
    })
}

fn receive(peer: &mut MessageChannel, expected: usize) -> Vec<Packet> {
    let mut inbox = VecDeque::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while inbox.len() < expected && Instant::now() < deadline {
        if peer.receive(&mut inbox).is_err() {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    inbox
        .iter()
        .map(|message: &Message| Packet::decode(message).expect("decode"))
        .collect()
}

fn started(dir: &Path, mut supervisor: EngineSupervisor, config: &SupervisorConfig) -> (EngineSupervisor, MessageChannel) {
    let peer = spawn_peer(config.endpoint());
    supervisor.start(dir).expect("start");
    let mut peer = peer.join().expect("peer thread");
    assert_eq!(receive(&mut peer, 1), vec![Packet::Resize(VIEWPORT)]);
    (supervisor, peer)
}

#[derive(Debug, Default)]
struct GpuCounts {
    imported: usize,
    copies: usize,
    signals: usize,
    released_images: usize,
}

#[derive(Default)]
struct CountingGpu {
    counts: Arc<Mutex<GpuCounts>>,
    next: u64,
}

impl CountingGpu {
    fn id(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

impl GpuBackend for CountingGpu {
    fn import_memory(&mut self, _handle: LocalHandle, _size: u64) -> Result<GpuMemory, GpuError> {
        self.counts.lock().unwrap().imported += 1;
        Ok(GpuMemory(self.id()))
    }

    fn bind_image(&mut self, _memory: GpuMemory, _extent: Extent, _offset: u64) -> Result<GpuImage, GpuError> {
        Ok(GpuImage(self.id()))
    }

    fn import_semaphore(&mut self, _handle: LocalHandle) -> Result<GpuSemaphore, GpuError> {
        Ok(GpuSemaphore(self.id()))
    }

    fn wait(&mut self, _semaphore: GpuSemaphore) -> Result<(), GpuError> {
        Ok(())
    }

    fn signal(&mut self, _semaphore: GpuSemaphore) -> Result<(), GpuError> {
        self.counts.lock().unwrap().signals += 1;
        Ok(())
    }

    fn copy_to_frame(&mut self, _image: GpuImage, _extent: Extent) -> Result<(), GpuError> {
        self.counts.lock().unwrap().copies += 1;
        Ok(())
    }

    fn destroy_image(&mut self, _image: GpuImage) {
        self.counts.lock().unwrap().released_images += 1;
    }

    fn free_memory(&mut self, _memory: GpuMemory) {}

    fn destroy_semaphore(&mut self, _semaphore: GpuSemaphore) {}
}

struct DevNullImporter;

impl ForeignHandleImporter for DevNullImporter {
    fn import(
        &self,
        _process: &ProcessHandle,
        _kind: ForeignKind,
        value: u64,
    ) -> Result<LocalHandle, HandoffError> {
        let file = File::open("/dev/null").map_err(|source| HandoffError::Import { value, source })?;
        Ok(file.into())
    }
}

fn shared_image() -> Packet {
    Packet::PushDmaSwapBuffer(DmaBuffer {
        kind: ForeignKind::Fd,
        memory: 7,
        start_semaphore: 8,
        end_semaphore: 9,
        size: VIEWPORT.pixel_bytes().unwrap() as u64,
        offset: 0,
        extent: VIEWPORT,
    })
}

fn gpu_supervisor(config: &SupervisorConfig) -> (EngineSupervisor, Arc<Mutex<GpuCounts>>) {
    let gpu = CountingGpu::default();
    let counts = Arc::clone(&gpu.counts);
    let supervisor = EngineSupervisor::new(config.clone())
        .with_gpu(Box::new(gpu))
        .with_importer(Box::new(DevNullImporter));
    (supervisor, counts)
}

#[test]
fn start_sends_viewport_and_update_paces_frames() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), fake_engine(dir.path(), "exec sleep 30"));
    let (mut supervisor, mut peer) = started(dir.path(), EngineSupervisor::new(config.clone()), &config);

    assert!(supervisor.is_running());
    assert!(supervisor.pid().is_some());
    assert!(!config.endpoint().path().exists(), "endpoint is removed once connected");

    supervisor.update();
    assert_eq!(receive(&mut peer, 1), vec![Packet::UnlockFrame]);

    supervisor.set_size(640, 480);
    supervisor.set_size(640, 480);
    assert_eq!((supervisor.width(), supervisor.height()), (640, 480));
    supervisor.update();
    assert_eq!(
        receive(&mut peer, 2),
        vec![Packet::UnlockFrame, Packet::Resize(Extent::new(640, 480))]
    );

    supervisor.stop();
    assert_eq!(receive(&mut peer, 1), vec![Packet::Close]);
    assert_eq!(supervisor.state(), SupervisorState::Idle);
    assert!(supervisor.pid().is_none());
}

#[test]
fn spawn_failure_leaves_supervisor_idle() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), dir.path().join("no-such-engine"));
    let mut supervisor = EngineSupervisor::new(config.clone());

    let err = supervisor.start(dir.path()).expect_err("spawn fails");
    assert!(matches!(err, SupervisorError::Process(ProcessError::Spawn { .. })));
    assert!(!supervisor.is_running());
    assert_eq!(supervisor.state(), SupervisorState::Idle);
    assert!(!config.endpoint().path().exists());
}

/// Once the engine has recorded its pid, connects and hangs up straight
/// away, so the initial resize lands on a closed socket.
fn spawn_hangup_peer(endpoint: Endpoint, pid_file: PathBuf) -> JoinHandle<()> {
    thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pid_file.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        while Instant::now() < deadline {
            if let Ok(channel) = MessageChannel::connect(&endpoint) {
                drop(channel);
                return;
            }
            thread::sleep(Duration::from_micros(100));
        }
    })
}

#[test]
fn failed_handshake_kills_the_engine_and_leaves_supervisor_idle() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("engine.pid");
    let body = format!(
        "echo $$ > '{0}.tmp' && mv '{0}.tmp' '{0}'\nexec sleep 30",
        pid_file.display()
    );
    let config = config(dir.path(), fake_engine(dir.path(), &body));
    let mut supervisor = EngineSupervisor::new(config.clone());

    // The hangup races the accept; retry until it lands first.
    let mut failure = None;
    for _ in 0..10 {
        let _ = fs::remove_file(&pid_file);
        let peer = spawn_hangup_peer(config.endpoint(), pid_file.clone());
        let result = supervisor.start(dir.path());
        peer.join().expect("peer thread");
        match result {
            Err(err) => {
                failure = Some(err);
                break;
            }
            Ok(()) => supervisor.terminate(),
        }
    }
    let err = failure.expect("the resize never hit a closed socket");
    assert!(matches!(err, SupervisorError::Channel(_)), "{err}");
    assert_eq!(supervisor.state(), SupervisorState::Idle);
    assert!(supervisor.pid().is_none());
    assert!(!config.endpoint().path().exists());

    let pid: i32 = fs::read_to_string(&pid_file)
        .expect("engine recorded its pid")
        .trim()
        .parse()
        .expect("pid");
    assert_eq!(unsafe { libc::kill(pid, 0) }, -1, "engine {pid} was left running");
}

#[test]
fn engine_that_never_connects_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), fake_engine(dir.path(), "exec sleep 30"));
    config.connect_timeout = Duration::from_millis(200);
    let mut supervisor = EngineSupervisor::new(config.clone());

    let err = supervisor.start(dir.path()).expect_err("no peer");
    assert!(matches!(err, SupervisorError::Channel(ChannelError::AcceptTimeout(_))));
    assert!(!supervisor.is_running());
    assert!(supervisor.pid().is_none());
    assert!(!config.endpoint().path().exists());
}

#[test]
fn engine_exiting_before_connecting_is_noticed_early() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), fake_engine(dir.path(), "exit 3"));
    let mut supervisor = EngineSupervisor::new(config);

    let started = Instant::now();
    let err = supervisor.start(dir.path()).expect_err("engine exits");
    assert!(matches!(err, SupervisorError::Channel(ChannelError::Abandoned(_))));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn second_start_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), fake_engine(dir.path(), "exec sleep 30"));
    let (mut supervisor, _peer) = started(dir.path(), EngineSupervisor::new(config.clone()), &config);
    assert!(matches!(
        supervisor.start(dir.path()),
        Err(SupervisorError::AlreadyRunning)
    ));
    supervisor.terminate();
    assert!(!supervisor.is_running());
}

#[test]
fn peer_hangup_is_detected_within_one_update() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), fake_engine(dir.path(), "exec sleep 30"));
    let (supervisor, counts) = gpu_supervisor(&config);
    let (mut supervisor, mut peer) = started(dir.path(), supervisor, &config);

    peer.send_packet(&shared_image()).unwrap();
    peer.send_packet(&shared_image()).unwrap();
    thread::sleep(Duration::from_millis(50));
    supervisor.update();
    assert_eq!(supervisor.handoff().len(), 2);
    assert!(supervisor.handoff().is_dma_mode());

    drop(peer);
    thread::sleep(Duration::from_millis(50));
    supervisor.update();

    assert!(!supervisor.is_running());
    assert_eq!(supervisor.state(), SupervisorState::Idle);
    assert_eq!(supervisor.handoff().len(), 0);
    assert_eq!(supervisor.handoff().index(), 0);
    assert_eq!(counts.lock().unwrap().released_images, 2);
}

#[test]
fn swaps_are_presented_on_update() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), fake_engine(dir.path(), "exec sleep 30"));
    let (supervisor, counts) = gpu_supervisor(&config);
    let (mut supervisor, mut peer) = started(dir.path(), supervisor, &config);

    peer.send_packet(&Packet::DmaSwap).unwrap();
    peer.send_packet(&shared_image()).unwrap();
    peer.send_packet(&shared_image()).unwrap();
    peer.send_packet(&Packet::DmaSwap).unwrap();
    thread::sleep(Duration::from_millis(50));
    supervisor.update();

    assert!(supervisor.is_running(), "a swap before any image is only logged");
    assert_eq!(supervisor.handoff().index(), 1);
    let current = supervisor.current_image().expect("a shared image is current");
    assert_eq!(current.extent, VIEWPORT);
    assert_eq!(supervisor.handoff().pending_swaps(), 0);
    {
        let counts = counts.lock().unwrap();
        assert_eq!(counts.imported, 2);
        assert_eq!(counts.copies, 1);
        assert_eq!(counts.signals, 1);
    }

    peer.send_packet(&Packet::FlushDmaSwapBuffers(ForeignKind::Fd)).unwrap();
    thread::sleep(Duration::from_millis(50));
    supervisor.update();
    assert!(supervisor.handoff().is_empty());
    assert!(!supervisor.handoff().is_dma_mode());
    assert!(supervisor.current_image().is_none());
    supervisor.terminate();
}

#[test]
fn timing_samples_drive_rates_and_close_ends_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), fake_engine(dir.path(), "exec sleep 30"));
    let (mut supervisor, mut peer) = started(dir.path(), EngineSupervisor::new(config.clone()), &config);

    for _ in 0..15 {
        peer.send_packet(&Packet::FrameData(TimingSample { delta_micros: 33_334 }))
            .unwrap();
    }
    peer.send_packet(&Packet::Resize(Extent::new(300, 200))).unwrap();
    thread::sleep(Duration::from_millis(50));
    supervisor.update();
    assert_eq!(supervisor.fps(), 30);
    assert_eq!(supervisor.ups(), 0);
    assert_eq!(supervisor.engine_size(), Some(Extent::new(300, 200)));

    peer.send_packet(&Packet::Close).unwrap();
    peer.send_packet(&Packet::FrameData(TimingSample { delta_micros: 1 }))
        .unwrap();
    thread::sleep(Duration::from_millis(50));
    supervisor.update();
    assert!(!supervisor.is_running());
    assert_eq!(supervisor.fps(), 0);
    assert_eq!(supervisor.engine_size(), None);
    supervisor.terminate();
}

#[test]
fn close_does_not_block_the_update_that_handles_it() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), fake_engine(dir.path(), "exec sleep 30"));
    let (mut supervisor, mut peer) = started(dir.path(), EngineSupervisor::new(config.clone()), &config);

    peer.send_packet(&Packet::Close).unwrap();
    thread::sleep(Duration::from_millis(50));
    let started_at = Instant::now();
    supervisor.update();
    assert!(
        started_at.elapsed() < Duration::from_millis(200),
        "update blocked for {:?}",
        started_at.elapsed()
    );
    assert_eq!(supervisor.state(), SupervisorState::Terminating);
    assert_eq!(supervisor.pid(), None);
    assert!(supervisor.start(dir.path()).is_err(), "the closing engine is still reaped");

    let deadline = Instant::now() + Duration::from_secs(3);
    while supervisor.state() != SupervisorState::Idle && Instant::now() < deadline {
        let tick = Instant::now();
        supervisor.update();
        assert!(tick.elapsed() < Duration::from_millis(200));
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(supervisor.state(), SupervisorState::Idle, "a lingering engine is killed");
}

#[test]
fn engine_exiting_after_close_is_reaped_without_a_kill() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), fake_engine(dir.path(), "sleep 0.5"));
    let (mut supervisor, mut peer) = started(dir.path(), EngineSupervisor::new(config.clone()), &config);

    peer.send_packet(&Packet::Close).unwrap();
    thread::sleep(Duration::from_millis(20));
    supervisor.update();
    assert_eq!(supervisor.state(), SupervisorState::Terminating);

    thread::sleep(Duration::from_millis(800));
    supervisor.update();
    assert_eq!(supervisor.state(), SupervisorState::Idle);
}

#[test]
fn input_is_forwarded_only_while_captured() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), fake_engine(dir.path(), "exec sleep 30"));
    let (mut supervisor, mut peer) = started(dir.path(), EngineSupervisor::new(config.clone()), &config);

    supervisor.set_input_capture(false);
    supervisor.push_cursor_pos(CursorPos { x: 1.0, y: 2.0 });
    supervisor.set_input_capture(true);
    supervisor.push_cursor_pos(CursorPos { x: 3.0, y: 4.0 });

    assert_eq!(
        receive(&mut peer, 1),
        vec![Packet::CursorPos(CursorPos { x: 3.0, y: 4.0 })]
    );
    supervisor.terminate();
}

#[test]
fn engine_exit_is_reaped_by_update() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), fake_engine(dir.path(), "sleep 0.3"));
    let (mut supervisor, _peer) = started(dir.path(), EngineSupervisor::new(config.clone()), &config);

    let deadline = Instant::now() + Duration::from_secs(5);
    while supervisor.is_running() && Instant::now() < deadline {
        supervisor.update();
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(supervisor.state(), SupervisorState::Idle);
}
