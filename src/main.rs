use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use uwb_tracker_rs::{
    AnchorId, DistanceAggregator, FanoutSink, LogSink, PositioningConfig, PositioningLoop,
    ProcessSupervisor, SessionClock, SupervisorConfig, TelemetrySink,
};

#[derive(Parser, Debug)]
#[command(name = "uwb_tracker")]
#[command(about = "Two-anchor UWB positioning from DWM3001CDK ranging streams", long_about = None)]
struct Args {
    /// Serial port of the tag (initiator)
    #[arg(long)]
    tag: String,

    /// Serial port of the responder acting as anchor 1
    #[arg(long)]
    beacon1: String,

    /// Serial port of the responder acting as anchor 2
    #[arg(long)]
    beacon2: String,

    /// JSON positioning config (anchor coordinates, timings, device id)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Report interval in seconds
    #[arg(long)]
    interval: Option<f64>,

    /// Averaging window in seconds
    #[arg(long)]
    window: Option<f64>,

    /// Staleness timeout in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Collector program launched once per device
    #[arg(long)]
    collector: Option<String>,

    /// Argument passed to the collector before the device flags (repeatable)
    #[arg(long = "collector-arg", allow_hyphen_values = true)]
    collector_args: Vec<String>,

    /// Pause after launching each responder, in milliseconds
    #[arg(long)]
    settle_ms: Option<u64>,

    /// Emit JSON telemetry lines on stdout
    #[arg(long, default_value_t = false)]
    telemetry: bool,

    /// Also emit one distance message per anchor with each position
    #[arg(long, default_value_t = false)]
    distance_messages: bool,

    /// Device identifier used in telemetry messages
    #[arg(long)]
    device_id: Option<String>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn positioning_config(args: &Args) -> Result<PositioningConfig> {
    let mut config = match &args.config {
        Some(path) => PositioningConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => PositioningConfig::default(),
    };

    if let Some(interval) = args.interval {
        config.report_interval_secs = interval;
    }
    if let Some(window) = args.window {
        config.averaging_window_secs = window;
    }
    if let Some(timeout) = args.timeout {
        config.staleness_timeout_secs = timeout;
    }
    if let Some(device_id) = &args.device_id {
        config.device_id = device_id.clone();
    }

    config.validate().context("invalid positioning config")?;
    Ok(config)
}

fn supervisor_config(args: &Args) -> Result<SupervisorConfig> {
    let mut config = SupervisorConfig::default();
    if let Some(program) = &args.collector {
        config.collector_program = program.clone();
    }
    if !args.collector_args.is_empty() {
        config.collector_args = args.collector_args.clone();
    }
    if let Some(settle_ms) = args.settle_ms {
        config.settle_delay_ms = settle_ms;
    }

    config.validate().context("invalid supervisor config")?;
    Ok(config)
}

/// Block until Ctrl-C, logging any collector that dies in the meantime.
async fn wait_for_shutdown(supervisor: &ProcessSupervisor) {
    let mut health_check = tokio::time::interval(Duration::from_secs(1));
    let mut reported_dead = 0;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    log::error!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
            _ = health_check.tick() => {
                let dead = supervisor.dead_devices();
                if dead.len() > reported_dead {
                    for device in &dead[reported_dead..] {
                        log::error!(
                            "{} on {} is down (exit code {:?}); positions will go stale",
                            device.role,
                            device.port,
                            device.exit_code
                        );
                    }
                    reported_dead = dead.len();
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(args.log_level.as_str()))
        .init();

    let config = positioning_config(&args)?;
    let collector = supervisor_config(&args)?;

    log::info!("UWB tracker starting");
    log::info!(
        "  Anchors: beacon1=({:.2}, {:.2}) beacon2=({:.2}, {:.2})",
        config.anchor1[0],
        config.anchor1[1],
        config.anchor2[0],
        config.anchor2[1]
    );
    log::info!(
        "  Window: {:.1}s  Timeout: {:.1}s  Interval: {:.1}s",
        config.averaging_window_secs,
        config.staleness_timeout_secs,
        config.report_interval_secs
    );

    let clock = SessionClock::new();
    let aggregator = Arc::new(DistanceAggregator::new(&config)?);

    let mut supervisor = ProcessSupervisor::new(collector, aggregator.clone(), clock)?;
    supervisor
        .start_all(
            &args.tag,
            &[(AnchorId::One, args.beacon1.as_str()), (AnchorId::Two, args.beacon2.as_str())],
        )
        .await
        .context("failed to start device collectors")?;

    let mut sink = FanoutSink::new().with(Box::new(LogSink::new()));
    if args.telemetry {
        let telemetry = TelemetrySink::new(&config.device_id, std::io::stdout())
            .with_distance_messages(args.distance_messages);
        sink = sink.with(Box::new(telemetry));
    }

    let mut positioning = match PositioningLoop::new(&config, aggregator, clock, Box::new(sink)) {
        Ok(positioning) => positioning,
        Err(e) => {
            supervisor.stop().await;
            return Err(e).context("failed to build positioning loop");
        }
    };
    if let Err(e) = positioning.start() {
        supervisor.stop().await;
        return Err(e).context("failed to start positioning loop");
    }

    log::info!("Tracking. Press Ctrl-C to stop.");
    wait_for_shutdown(&supervisor).await;

    log::info!("Shutting down...");
    let loop_result = positioning.stop().await;
    supervisor.stop().await;
    loop_result.context("positioning loop did not stop cleanly")?;

    log::info!("Stopped after {} position ticks", positioning.ticks_run());
    Ok(())
}
