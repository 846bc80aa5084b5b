use std::time::Duration;

use engine_wire::{DmaBuffer, ForeignKind, Message, Packet, WireError};
use tracing::{debug, error, trace, warn};

use super::EngineSupervisor;

pub(super) enum Flow {
    Continue,
    /// The engine closed; the rest of the batch is discarded.
    Closed,
}

impl EngineSupervisor {
    /// Handles one engine message. Undecodable messages are logged and
    /// skipped; they never take the channel down.
    pub(super) fn dispatch(&mut self, message: Message) -> Flow {
        let packet = match Packet::decode(&message) {
            Ok(packet) => packet,
            Err(WireError::UnknownType { tag, len }) => {
                error!(target: "engine_link::supervisor", tag, len, "unknown message type from engine");
                return Flow::Continue;
            }
            Err(err) => {
                warn!(
                    target: "engine_link::supervisor",
                    tag = message.tag(),
                    len = message.len(),
                    error = %err,
                    "malformed message from engine"
                );
                return Flow::Continue;
            }
        };
        drop(message);

        match packet {
            Packet::Null | Packet::UnlockFrame => {}
            Packet::Close => {
                self.closed_by_engine();
                return Flow::Closed;
            }
            Packet::Resize(extent) => {
                debug!(
                    target: "engine_link::supervisor",
                    width = extent.width,
                    height = extent.height,
                    "engine resized"
                );
                self.engine_size = Some(extent);
            }
            Packet::CursorPos(_) | Packet::MouseState(_) | Packet::KeyboardState(_) => {
                trace!(target: "engine_link::supervisor", "ignoring input echoed by engine");
            }
            Packet::PushFrame(frame) => {
                if self.handoff.is_dma_mode() {
                    trace!(target: "engine_link::supervisor", "pixel frame while sharing images; dropped");
                } else if frame.extent != self.size {
                    debug!(
                        target: "engine_link::supervisor",
                        width = frame.extent.width,
                        height = frame.extent.height,
                        "pixel frame does not match viewport; dropped"
                    );
                } else {
                    self.sinks.frame.upload(frame.extent, &frame.pixels);
                }
            }
            Packet::FrameData(sample) => {
                self.fps.record(Duration::from_micros(sample.delta_micros));
            }
            Packet::UpdateData(sample) => {
                self.ups.record(Duration::from_micros(sample.delta_micros));
            }
            Packet::Message(line) => self.sinks.log.log(&line),
            Packet::ProfileScope(sample) => self.sinks.profiler.push_scope(&sample),
            Packet::SetCursorState(state) => self.sinks.window.set_cursor_state(state),
            Packet::PushDmaSwapBuffer(buffer) => self.import_shared_image(&buffer),
            Packet::FlushDmaSwapBuffers(kind) => self.flush_shared_images(kind),
            Packet::DmaSwap => {
                if let Err(err) = self.handoff.queue_swap() {
                    error!(target: "engine_link::supervisor", error = %err, "engine swapped with no shared images");
                }
            }
        }
        Flow::Continue
    }

    fn import_shared_image(&mut self, buffer: &DmaBuffer) {
        let Some(gpu) = self.gpu.as_deref_mut() else {
            error!(target: "engine_link::supervisor", "engine offered a shared image but no gpu backend is attached");
            return;
        };
        let Some(process) = self.process.as_ref() else {
            warn!(
                target: "engine_link::supervisor",
                kind = ?buffer.kind,
                "engine offered a shared image but no engine process is attached"
            );
            return;
        };
        if let Err(err) =
            self.handoff
                .push_buffer(gpu, self.importer.as_ref(), process.handle(), buffer)
        {
            error!(
                target: "engine_link::supervisor",
                kind = ?buffer.kind,
                error = %err,
                "failed to import shared image"
            );
        }
    }

    fn flush_shared_images(&mut self, kind: ForeignKind) {
        debug!(
            target: "engine_link::supervisor",
            ?kind,
            entries = self.handoff.len(),
            "engine flushed shared images"
        );
        match self.gpu.as_deref_mut() {
            Some(gpu) => self.handoff.flush(gpu),
            None => self.handoff.abandon(),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use bytes::Bytes;
    use engine_wire::{
        CursorState, Extent, FramePixels, LogLine, LogSeverity, MessageType, TimingSample,
    };

    use super::*;
    use crate::handoff::tests::{DevNullImporter, RecordingGpu, buffer};
    use crate::supervisor::{
        FrameSink, LaunchTarget, LogSink, ProfilerSink, Sinks, SupervisorConfig, WindowSink,
    };

    #[derive(Default)]
    struct Seen {
        logs: Vec<LogLine>,
        cursor: Vec<CursorState>,
        frames: Vec<Extent>,
        scopes: usize,
    }

    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Seen>>);

    impl LogSink for Recorder {
        fn log(&mut self, line: &LogLine) {
            self.0.borrow_mut().logs.push(line.clone());
        }
    }

    impl ProfilerSink for Recorder {
        fn push_scope(&mut self, _sample: &engine_wire::ProfileSample) {
            self.0.borrow_mut().scopes += 1;
        }
    }

    impl WindowSink for Recorder {
        fn set_cursor_state(&mut self, state: CursorState) {
            self.0.borrow_mut().cursor.push(state);
        }
    }

    impl FrameSink for Recorder {
        fn upload(&mut self, extent: Extent, _pixels: &[u8]) {
            self.0.borrow_mut().frames.push(extent);
        }
    }

    fn supervisor(recorder: &Recorder) -> EngineSupervisor {
        let mut config = SupervisorConfig::new(LaunchTarget::local("/bin/true"));
        config.initial_size = Extent::new(2, 2);
        EngineSupervisor::new(config)
            .with_sinks(Sinks {
                log: Box::new(recorder.clone()),
                profiler: Box::new(recorder.clone()),
                window: Box::new(recorder.clone()),
                frame: Box::new(recorder.clone()),
            })
            .with_gpu(Box::new(RecordingGpu::default()))
            .with_importer(Box::new(DevNullImporter))
    }

    #[test]
    fn collaborators_receive_their_packets() {
        let recorder = Recorder::default();
        let mut supervisor = supervisor(&recorder);

        let log = LogLine {
            severity: LogSeverity::Warning,
            text: "shader cache miss".into(),
        };
        supervisor.dispatch(Packet::Message(log.clone()).encode());
        supervisor.dispatch(Packet::SetCursorState(CursorState::Locked).encode());
        supervisor.dispatch(
            Packet::PushFrame(FramePixels {
                extent: Extent::new(2, 2),
                pixels: Bytes::from(vec![0u8; 16]),
            })
            .encode(),
        );
        supervisor.dispatch(
            Packet::PushFrame(FramePixels {
                extent: Extent::new(1, 1),
                pixels: Bytes::from(vec![0u8; 4]),
            })
            .encode(),
        );
        supervisor.dispatch(Packet::Resize(Extent::new(640, 360)).encode());

        let seen = recorder.0.borrow();
        assert_eq!(seen.logs, vec![log]);
        assert_eq!(seen.cursor, vec![CursorState::Locked]);
        assert_eq!(seen.frames, vec![Extent::new(2, 2)], "mismatched frame is dropped");
        assert_eq!(supervisor.engine_size(), Some(Extent::new(640, 360)));
    }

    #[test]
    fn timing_packets_feed_rates() {
        let recorder = Recorder::default();
        let mut supervisor = supervisor(&recorder);
        for _ in 0..15 {
            supervisor.dispatch(Packet::FrameData(TimingSample { delta_micros: 33_334 }).encode());
        }
        for _ in 0..30 {
            supervisor.dispatch(Packet::UpdateData(TimingSample { delta_micros: 16_667 }).encode());
        }
        assert_eq!(supervisor.fps(), 30);
        assert_eq!(supervisor.ups(), 60);
    }

    #[test]
    fn unknown_and_malformed_messages_are_tolerated() {
        let recorder = Recorder::default();
        let mut supervisor = supervisor(&recorder);
        assert!(matches!(
            supervisor.dispatch(Message::from_raw(99, Bytes::from_static(b"future"))),
            Flow::Continue
        ));
        assert!(matches!(
            supervisor.dispatch(Message::new(MessageType::Resize, vec![1u8, 2])),
            Flow::Continue
        ));
        assert_eq!(supervisor.engine_size(), None);
    }

    #[test]
    fn swap_without_ring_is_ignored() {
        let recorder = Recorder::default();
        let mut supervisor = supervisor(&recorder);
        supervisor.dispatch(Packet::DmaSwap.encode());
        assert_eq!(supervisor.handoff().pending_swaps(), 0);
        assert_eq!(supervisor.handoff().index(), 0);
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn shared_images_need_a_process() {
        let recorder = Recorder::default();
        let mut supervisor = supervisor(&recorder);
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            supervisor.dispatch(Packet::PushDmaSwapBuffer(buffer(2, 2)).encode());
        });
        assert!(supervisor.handoff().is_empty());
        let logged = String::from_utf8_lossy(&captured.0.lock().unwrap()).into_owned();
        assert!(logged.contains("no engine process is attached"), "{logged}");
        assert!(logged.contains("kind=Fd"), "{logged}");
        supervisor.dispatch(Packet::FlushDmaSwapBuffers(ForeignKind::Fd).encode());
        assert!(!supervisor.handoff().is_dma_mode());
    }
}
