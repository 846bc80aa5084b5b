use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use engine_link::cli::{Cli, Command, ProbeArgs, RunArgs, StageArgs};
use engine_link::config::LinkConfig;
use engine_link::remote::{CopyRequest, RemoteCopySession, RemoteShellSession};
use engine_link::supervisor::{EngineSupervisor, SupervisorState};
use engine_link::telemetry::logging;
use engine_wire::Extent;
use tracing::{debug, info, warn};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

fn main() {
    if let Err(err) = run() {
        eprintln!("engine-link: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logging::init(&log_config).context("failed to initialise logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = LinkConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Run(args) => run_engine(&config, args),
        Command::Probe(args) => probe_host(&config, args),
        Command::Stage(args) => stage_files(&config, args),
    }
}

fn run_engine(config: &LinkConfig, args: RunArgs) -> Result<()> {
    let launch = config.local_launch(args.engine.clone())?;
    let supervisor_config = config.supervisor(launch, Extent::new(args.width, args.height));
    let mut supervisor = EngineSupervisor::new(supervisor_config);

    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))
        .context("failed to install Ctrl-C handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&interrupted))
        .context("failed to install SIGTERM handler")?;

    supervisor
        .start(&args.workdir)
        .with_context(|| format!("failed to start engine in {}", args.workdir.display()))?;

    let tick = Duration::from_secs(1) / args.tick_rate;
    let started = Instant::now();
    let deadline = args
        .duration
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .map(|duration| started + duration);
    let mut next_report = started + REPORT_INTERVAL;

    while supervisor.is_running() {
        let frame_start = Instant::now();
        if interrupted.load(Ordering::Relaxed) {
            info!("interrupted; stopping engine");
            break;
        }
        if deadline.is_some_and(|deadline| frame_start >= deadline) {
            info!("run duration reached; stopping engine");
            break;
        }

        supervisor.update();

        if frame_start >= next_report {
            info!(
                fps = supervisor.fps(),
                ups = supervisor.ups(),
                engine_size = ?supervisor.engine_size(),
                "engine rates"
            );
            next_report += REPORT_INTERVAL;
        }
        if let Some(remaining) = tick.checked_sub(frame_start.elapsed()) {
            std::thread::sleep(remaining);
        }
    }

    let state = supervisor.state();
    supervisor.stop();
    if state != SupervisorState::Running {
        bail!("engine stopped unexpectedly");
    }
    Ok(())
}

fn probe_host(config: &LinkConfig, args: ProbeArgs) -> Result<()> {
    let mut session = RemoteShellSession::connect_password(
        &config.remote(),
        &args.target,
        args.ssh_port,
        args.copy_port,
    )
    .with_context(|| format!("failed to log in to {}", args.target))?;
    let profile = session
        .fingerprint()
        .with_context(|| format!("unsupported remote host {}", args.target))?;
    println!("{}", serde_json::to_string_pretty(profile)?);
    Ok(())
}

fn stage_files(config: &LinkConfig, args: StageArgs) -> Result<()> {
    if !args.source.exists() {
        bail!("source {} does not exist", args.source.display());
    }
    let (user, host) = args.user_and_host();
    let request = CopyRequest {
        user: user.map(str::to_string),
        address: host.to_string(),
        source: args.source.clone(),
        destination: args.destination.clone(),
        port: args.port,
        compress: args.compress || config.remote.compress,
    };
    let remote = config.remote();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let outcome = runtime.block_on(async move {
        let mut session = RemoteCopySession::create(&remote, &request)?;
        let outcome = tokio::select! {
            outcome = session.wait() => outcome,
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted; cancelling copy");
                session.cancel();
                session.wait().await
            }
        };
        anyhow::Ok(outcome)
    })?;

    if !outcome.is_success() {
        bail!("copy to {host} did not complete: {outcome:?}");
    }
    info!(?outcome, "copy finished");
    Ok(())
}
