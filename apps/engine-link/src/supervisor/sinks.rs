//! Collaborators the supervisor forwards engine output to.

use engine_wire::{CursorState, Extent, LogLine, LogSeverity, ProfileSample};
use tracing::{debug, error, info, trace, warn};

/// Receives log lines produced inside the engine.
pub trait LogSink {
    fn log(&mut self, line: &LogLine);
}

pub trait ProfilerSink {
    fn push_scope(&mut self, sample: &ProfileSample);
}

/// The editor window hosting the viewport.
pub trait WindowSink {
    fn set_cursor_state(&mut self, state: CursorState);
}

/// CPU-side frame upload, used while frames arrive as raw pixels.
pub trait FrameSink {
    fn upload(&mut self, extent: Extent, pixels: &[u8]);
}

/// Re-emits engine log lines through `tracing` under the `engine` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&mut self, line: &LogLine) {
        match line.severity {
            LogSeverity::Message => info!(target: "engine", "{}", line.text),
            LogSeverity::Warning => warn!(target: "engine", "{}", line.text),
            LogSeverity::Error => error!(target: "engine", "{}", line.text),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProfilerSink;

impl ProfilerSink for TracingProfilerSink {
    fn push_scope(&mut self, sample: &ProfileSample) {
        trace!(
            target: "engine",
            scope = %sample.name,
            depth = sample.depth,
            start_us = sample.start_micros,
            duration_us = sample.duration_micros,
            "profile scope"
        );
    }
}

/// Headless stand-in for a window and frame texture: records the latest
/// cursor state and frame size and drops the pixels.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessSurface {
    pub cursor: Option<CursorState>,
    pub last_frame: Option<Extent>,
    pub frames: u64,
}

impl WindowSink for HeadlessSurface {
    fn set_cursor_state(&mut self, state: CursorState) {
        debug!(target: "engine_link::supervisor", ?state, "cursor state");
        self.cursor = Some(state);
    }
}

impl FrameSink for HeadlessSurface {
    fn upload(&mut self, extent: Extent, _pixels: &[u8]) {
        self.last_frame = Some(extent);
        self.frames += 1;
    }
}

/// Everything the dispatch loop may call out to.
pub struct Sinks {
    pub log: Box<dyn LogSink>,
    pub profiler: Box<dyn ProfilerSink>,
    pub window: Box<dyn WindowSink>,
    pub frame: Box<dyn FrameSink>,
}

impl Default for Sinks {
    fn default() -> Self {
        Self {
            log: Box::new(TracingLogSink),
            profiler: Box::new(TracingProfilerSink),
            window: Box::new(HeadlessSurface::default()),
            frame: Box::new(HeadlessSurface::default()),
        }
    }
}
