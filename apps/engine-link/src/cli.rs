use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "engine-link",
    about = "Drive a headless engine process and stage builds on remote hosts",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "ENGINE_LINK_CONFIG",
        value_name = "PATH",
        help = "Config file (defaults to ~/.engine-link/config.toml)"
    )]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "ENGINE_LINK_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "ENGINE_LINK_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the engine headless and drive it until interrupted
    Run(RunArgs),
    /// Log in to a remote host and print what it is
    Probe(ProbeArgs),
    /// Copy files to a remote host over an authenticated connection
    Stage(StageArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(long, value_name = "PATH", help = "Engine executable (overrides config)")]
    pub engine: Option<PathBuf>,

    #[arg(
        long,
        value_name = "DIR",
        default_value = ".",
        help = "Working directory handed to the engine"
    )]
    pub workdir: PathBuf,

    #[arg(long, default_value_t = 1280)]
    pub width: u32,

    #[arg(long, default_value_t = 720)]
    pub height: u32,

    #[arg(
        long = "tick-rate",
        value_name = "HZ",
        default_value_t = 60,
        value_parser = clap::value_parser!(u32).range(1..=1000),
        help = "Editor updates per second"
    )]
    pub tick_rate: u32,

    #[arg(long, value_name = "SECS", help = "Stop after this many seconds")]
    pub duration: Option<f64>,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    #[arg(value_name = "TARGET", help = "Remote host, as accepted by ssh (user@host)")]
    pub target: String,

    #[arg(long = "ssh-port", default_value_t = 22)]
    pub ssh_port: u16,

    #[arg(long = "copy-port", default_value_t = 22)]
    pub copy_port: u16,
}

#[derive(Args, Debug)]
pub struct StageArgs {
    #[arg(value_name = "TARGET", help = "Remote host, optionally user@host")]
    pub target: String,

    #[arg(value_name = "SRC")]
    pub source: PathBuf,

    #[arg(value_name = "DST", help = "Destination path on the remote host")]
    pub destination: String,

    #[arg(long, default_value_t = 22)]
    pub port: u16,

    #[arg(long, help = "Compress the transfer")]
    pub compress: bool,
}

impl StageArgs {
    /// Splits `user@host` into its parts.
    pub fn user_and_host(&self) -> (Option<&str>, &str) {
        match self.target.split_once('@') {
            Some((user, host)) => (Some(user), host),
            None => (None, self.target.as_str()),
        }
    }
}
