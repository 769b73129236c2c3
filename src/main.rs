// Replays a directory of solar frames through the guider, driving a device file or
// logging pulses in dry-run mode. Operator commands are read from stdin, one per
// line: start, stop, nudge <d_row> <d_col> [slow|fast], reset, connect <path>,
// disconnect, markers on|off, quit.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use sun_guider::core_modules::log_sink::PositionLog;
use sun_guider::guidance_loop::DirectoryFrameSource;
use sun_guider::{
    CommandDispatcher, ControlCommand, DeviceFileDispatcher, DryRunDispatcher, GuidanceEvent,
    GuidanceLoop, GuidanceStateMachine, GuideConfig, SolarPipeline,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Closed-loop solar telescope autoguider")]
struct Args {
    /// Directory of 8/16-bit grayscale frames, replayed in name order.
    #[arg(short, long)]
    frames: Option<PathBuf>,

    /// INI configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Drive device file; overrides [link] device.
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Append-only position log; overrides [link] position_log.
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Write binned, filtered and correlation grids of each frame here.
    #[arg(long)]
    debug_dir: Option<PathBuf>,

    /// Loop over the frames forever.
    #[arg(long)]
    repeat: bool,

    /// Start guiding immediately instead of waiting for `start`.
    #[arg(long)]
    autostart: bool,

    /// Log sun and setpoint overlay markers every cycle.
    #[arg(long)]
    markers: bool,

    /// Write the effective configuration to this file and exit.
    #[arg(long)]
    write_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => GuideConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => GuideConfig::default(),
    };
    if args.device.is_some() {
        config.link.device = args.device.clone();
    }
    if args.log.is_some() {
        config.link.position_log = args.log.clone();
    }
    if args.debug_dir.is_some() {
        config.pipeline.debug_dir = args.debug_dir.clone();
    }
    config.validate()?;

    if let Some(path) = &args.write_config {
        config.save(path)?;
        info!(path = %path.display(), "configuration written");
        return Ok(());
    }

    let frames = args
        .frames
        .as_deref()
        .context("--frames is required unless --write-config is given")?;
    let source = DirectoryFrameSource::open(frames, args.repeat)?;
    anyhow::ensure!(!source.is_empty(), "no frames in {}", frames.display());

    let pipeline = SolarPipeline::new(config.pipeline.clone())?;
    info!(
        diameter = config.pipeline.sun_diameter_px,
        ring_points = pipeline.reference().points.len(),
        "reference template ready"
    );

    let dispatcher: Box<dyn CommandDispatcher> = match &config.link.device {
        Some(device) => {
            let mut dispatcher = DeviceFileDispatcher::new(config.pins);
            if let Err(e) = dispatcher.connect(device) {
                warn!("{e}; will keep retrying on the connection tick");
            }
            Box::new(dispatcher)
        }
        None => {
            info!("no drive device configured, running dry");
            Box::new(DryRunDispatcher::new(config.pins))
        }
    };

    let machine = GuidanceStateMachine::new(config.guidance.clone());
    let mut guidance = GuidanceLoop::new(
        machine,
        pipeline,
        dispatcher,
        Box::new(source),
        config.link.clone(),
    );
    if let Some(path) = &config.link.position_log {
        guidance = guidance.with_log(Box::new(PositionLog::open(path)?));
    }

    let mut events = guidance.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let GuidanceEvent::Markers(markers) = event {
                info!(position = ?markers.position, setpoint = ?markers.setpoint, "markers");
            }
        }
    });

    let (controls, control_rx) = mpsc::channel(32);
    forward_stdin(controls.clone());
    forward_ctrl_c(controls.clone());
    if args.markers {
        controls.send(ControlCommand::ShowMarkers(true)).await?;
    }
    if args.autostart {
        controls.send(ControlCommand::Start).await?;
    }
    drop(controls);

    let summary = guidance.run(control_rx).await?;
    info!(
        cycles = summary.cycles,
        located = summary.located,
        pulses = summary.pulses,
        state = %summary.final_state,
        "done"
    );
    Ok(())
}

fn forward_stdin(controls: mpsc::Sender<ControlCommand>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<ControlCommand>() {
                Ok(command) => {
                    if controls.send(command).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("{e}"),
            }
        }
    });
}

/// Ctrl-C becomes an explicit stop followed by an orderly shutdown.
fn forward_ctrl_c(controls: mpsc::Sender<ControlCommand>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            let _ = controls.send(ControlCommand::Stop).await;
            let _ = controls.send(ControlCommand::Shutdown).await;
        }
    });
}
