// THEORY:
// Everything that touches guidance state runs on one timeline: a single task that
// `select!`s between three sources.
//
// 1.  **Control commands** (start, stop, nudge, ...) from the operator. They are
//     polled first, so a stop issued during a cycle is honoured as soon as that cycle
//     ends, never in the middle of it.
// 2.  **Connection tick**: a fixed-interval probe of the drive link whose only effect
//     is a `ConnectionState` update.
// 3.  **Guidance tick**: capture, correlate, locate, correct. The timer is re-armed
//     only after a cycle completes, so cycles never overlap. A cycle slower than the
//     period simply starts the next one immediately.
//
// Blocking work (reading a frame, correlating) is pushed to the blocking pool and
// awaited in place, which keeps the timeline strictly sequential while the runtime
// stays responsive. Events leave through a broadcast channel; the loop does not care
// whether anybody listens.

use crate::config::LinkConfig;
use crate::core_modules::dispatcher::CommandDispatcher;
use crate::core_modules::guidance::GuidanceStateMachine;
use crate::core_modules::guidance_state::{
    ConnectionState, GuidanceEvent, GuidanceState, Marker, Markers, NudgeSpeed,
};
use crate::core_modules::image_io::load_frame;
use crate::core_modules::log_sink::LogSink;
use crate::core_modules::pixel_grid::PixelGrid;
use crate::error::{GuideError, Result};
use crate::pipeline::{FrameReport, SolarPipeline};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Operator controls accepted by the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Start,
    Stop,
    Nudge {
        d_row: i32,
        d_col: i32,
        speed: NudgeSpeed,
    },
    ResetSetpoint,
    Connect(PathBuf),
    Disconnect,
    ShowMarkers(bool),
    /// Stops guidance, flushes the log and ends the loop.
    Shutdown,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("unrecognised command {0:?}")]
pub struct CommandParseError(pub String);

impl FromStr for ControlCommand {
    type Err = CommandParseError;

    /// Parses one console line, e.g. `nudge -1 0 fast` or `connect /dev/ttyACM0`.
    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let bad = || CommandParseError(line.trim().to_string());
        let mut words = line.split_whitespace();
        let command = match words.next().ok_or_else(bad)? {
            "start" => ControlCommand::Start,
            "stop" => ControlCommand::Stop,
            "reset" => ControlCommand::ResetSetpoint,
            "disconnect" => ControlCommand::Disconnect,
            "quit" | "exit" => ControlCommand::Shutdown,
            "connect" => ControlCommand::Connect(PathBuf::from(words.next().ok_or_else(bad)?)),
            "markers" => match words.next() {
                Some("on") => ControlCommand::ShowMarkers(true),
                Some("off") => ControlCommand::ShowMarkers(false),
                _ => return Err(bad()),
            },
            "nudge" => {
                let d_row = words.next().and_then(|w| w.parse().ok()).ok_or_else(bad)?;
                let d_col = words.next().and_then(|w| w.parse().ok()).ok_or_else(bad)?;
                let speed = match words.next() {
                    None | Some("slow") => NudgeSpeed::Slow,
                    Some("fast") => NudgeSpeed::Fast,
                    Some(_) => return Err(bad()),
                };
                ControlCommand::Nudge {
                    d_row,
                    d_col,
                    speed,
                }
            }
            _ => return Err(bad()),
        };
        match words.next() {
            Some(_) => Err(bad()),
            None => Ok(command),
        }
    }
}

/// Where frames come from. Reading may block.
pub trait FrameSource: Send {
    /// The next frame, or `None` when the source is exhausted.
    fn next_frame(&mut self) -> Option<Result<PixelGrid>>;
}

/// Replays the image files of a directory in name order.
#[derive(Debug)]
pub struct DirectoryFrameSource {
    files: Vec<PathBuf>,
    next: usize,
    repeat: bool,
}

impl DirectoryFrameSource {
    pub fn open(dir: &Path, repeat: bool) -> Result<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| GuideError::opening(dir, e))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| {
                        matches!(ext.to_ascii_lowercase().as_str(), "tif" | "tiff" | "png")
                    })
            })
            .collect();
        files.sort();
        info!(dir = %dir.display(), frames = files.len(), "frame directory opened");
        Ok(Self {
            files,
            next: 0,
            repeat,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for DirectoryFrameSource {
    fn next_frame(&mut self) -> Option<Result<PixelGrid>> {
        if self.next >= self.files.len() {
            if !self.repeat || self.files.is_empty() {
                return None;
            }
            self.next = 0;
        }
        let path = &self.files[self.next];
        self.next += 1;
        debug!(path = %path.display(), "loading frame");
        Some(load_frame(path))
    }
}

/// Totals reported when the loop ends.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopSummary {
    pub cycles: u64,
    pub located: u64,
    pub pulses: u64,
    pub final_state: GuidanceState,
}

/// The guider's runtime: owns the state machine and its collaborators.
pub struct GuidanceLoop {
    machine: GuidanceStateMachine,
    pipeline: SolarPipeline,
    dispatcher: Box<dyn CommandDispatcher>,
    source: Option<Box<dyn FrameSource>>,
    log: Option<Box<dyn LogSink>>,
    link: LinkConfig,
    events: broadcast::Sender<GuidanceEvent>,
    show_markers: bool,
    summary: LoopSummary,
}

impl GuidanceLoop {
    pub fn new(
        machine: GuidanceStateMachine,
        pipeline: SolarPipeline,
        dispatcher: Box<dyn CommandDispatcher>,
        source: Box<dyn FrameSource>,
        link: LinkConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            machine,
            pipeline,
            dispatcher,
            source: Some(source),
            log: None,
            link,
            events,
            show_markers: false,
            summary: LoopSummary {
                cycles: 0,
                located: 0,
                pulses: 0,
                final_state: GuidanceState::Idle,
            },
        }
    }

    pub fn with_log(mut self, log: Box<dyn LogSink>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GuidanceEvent> {
        self.events.subscribe()
    }

    pub fn machine(&self) -> &GuidanceStateMachine {
        &self.machine
    }

    /// Runs until a `Shutdown` command or until the frame source is exhausted. A frame
    /// reader that dies stops guidance and is returned as `GuideError::Worker`.
    pub async fn run(mut self, mut controls: mpsc::Receiver<ControlCommand>) -> Result<LoopSummary> {
        let mut connection_check = tokio::time::interval(self.link.connection_check_period);
        connection_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let guidance_tick = tokio::time::sleep(std::time::Duration::ZERO);
        tokio::pin!(guidance_tick);
        let mut controls_open = true;
        let mut failure = None;

        info!(
            guidance_ms = self.link.guidance_period.as_millis() as u64,
            check_ms = self.link.connection_check_period.as_millis() as u64,
            "guidance loop started"
        );
        loop {
            tokio::select! {
                biased;

                command = controls.recv(), if controls_open => match command {
                    Some(ControlCommand::Shutdown) => break,
                    Some(command) => self.apply(command),
                    None => controls_open = false,
                },

                _ = connection_check.tick() => {
                    let state = self.dispatcher.check_link();
                    self.machine.on_connection_check(state);
                    self.publish();
                }

                _ = &mut guidance_tick => {
                    let started = tokio::time::Instant::now();
                    match self.cycle().await {
                        Ok(true) => guidance_tick.as_mut().reset(started + self.link.guidance_period),
                        Ok(false) => {
                            info!("frame source exhausted");
                            break;
                        }
                        Err(e) => {
                            error!("frame source failed: {e}");
                            failure = Some(e);
                            break;
                        }
                    }
                }
            }
        }
        let summary = self.shutdown()?;
        match failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn apply(&mut self, command: ControlCommand) {
        debug!(?command, "control");
        match command {
            ControlCommand::Start => self.machine.start(),
            ControlCommand::Stop => self.machine.stop(),
            ControlCommand::Nudge { d_row, d_col, speed } => {
                if let Err(e) = self.machine.nudge(d_row, d_col, speed) {
                    warn!("nudge ignored: {e}");
                }
            }
            ControlCommand::ResetSetpoint => {
                if let Err(e) = self.machine.reset_setpoint() {
                    warn!("reset ignored: {e}");
                }
            }
            ControlCommand::Connect(path) => {
                if let Err(e) = self.dispatcher.connect(&path) {
                    warn!("{e}");
                }
                let state = self.dispatcher.check_link();
                self.machine.on_connection_check(state);
            }
            ControlCommand::Disconnect => {
                self.dispatcher.disconnect();
                self.machine.on_connection_check(ConnectionState::Off);
            }
            ControlCommand::ShowMarkers(on) => self.show_markers = on,
            ControlCommand::Shutdown => {}
        }
        self.publish();
    }

    /// One capture-correlate-locate-correct pass. Returns `false` once frames run out.
    async fn cycle(&mut self) -> Result<bool> {
        let Some(mut source) = self.source.take() else {
            return Ok(false);
        };
        let joined = tokio::task::spawn_blocking(move || {
            let frame = source.next_frame();
            (source, frame)
        })
        .await;
        let frame = match joined {
            Ok((source, frame)) => {
                self.source = Some(source);
                frame
            }
            Err(e) => return Err(GuideError::Worker(format!("frame reader: {e}"))),
        };

        let report = match frame {
            None => return Ok(false),
            Some(Err(e)) => {
                warn!("frame skipped: {e}");
                None
            }
            Some(Ok(grid)) => match self.pipeline.process_frame_async(grid).await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!("no position this cycle: {e}");
                    None
                }
            },
        };

        let outcome = self.machine.observe(
            report.as_ref().map(|r| r.position),
            Instant::now(),
            self.dispatcher.as_mut(),
        );
        self.summary.cycles += 1;
        self.summary.located += u64::from(report.is_some());
        self.summary.pulses += outcome.pulses.len() as u64;

        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.append(&outcome.record) {
                warn!("position log: {e}");
            }
        }
        if self.show_markers {
            if let Some(report) = &report {
                let markers = self.markers(report);
                let _ = self.events.send(GuidanceEvent::Markers(markers));
            }
        }
        self.publish();
        Ok(true)
    }

    fn markers(&self, report: &FrameReport) -> Markers {
        let diameter = (self.pipeline.config().sun_diameter_px * report.binning) as f64;
        let marker = |row: f64, col: f64| {
            let (row, col) = report.frame_point(row, col);
            Marker { row, col, diameter }
        };
        Markers {
            position: Some(marker(report.position.row, report.position.col)),
            setpoint: self.machine.setpoint().map(|sp| marker(sp.row, sp.col)),
        }
    }

    fn publish(&mut self) {
        for event in self.machine.drain_events() {
            // No subscriber is fine.
            let _ = self.events.send(event);
        }
    }

    fn shutdown(mut self) -> Result<LoopSummary> {
        if self.machine.guidance_state().is_active() {
            self.machine.stop();
        }
        self.publish();
        if let Some(log) = self.log.as_mut() {
            log.flush()?;
        }
        self.summary.final_state = self.machine.guidance_state();
        info!(
            cycles = self.summary.cycles,
            pulses = self.summary.pulses,
            state = %self.summary.final_state,
            "guidance loop stopped"
        );
        Ok(self.summary)
    }
}
