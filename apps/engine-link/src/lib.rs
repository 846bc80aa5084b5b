//! Editor-side control of a headless engine process: the framed channel,
//! process supervision, shared GPU frame handoff and remote host sessions.

pub mod channel;
pub mod cli;
pub mod config;
pub mod handoff;
mod poll;
pub mod process;
pub mod remote;
pub mod supervisor;
pub mod telemetry;

pub use channel::{ChannelError, ChannelListener, Endpoint, MessageChannel};
pub use supervisor::{EngineSupervisor, LaunchTarget, SupervisorConfig, SupervisorState};
