// THEORY:
// The state machine is fed one reading per guidance tick and answers with a log
// record and the pulses it sent. A tick runs in a fixed order:
//
//   1. Classify the reading. A missing position or a confidence below the noise
//      threshold is Incoherent.
//   2. Move the guidance axis on coherence. NeedsPosition waits for a coherent
//      reading. Running degrades to RunningNoisy, and RunningNoisy gives up
//      (StoppedNoise) once incoherence has lasted for the sustain duration.
//   3. Compare the position with the setpoint. The first coherent reading becomes
//      the setpoint. While guiding, every growth of the offset magnitude extends a
//      streak, and a long enough streak past the bound is a runaway (Diverging).
//   4. Every N coherent positions, average them and, if the Sun is Far, send one
//      pulse per axis proportional to the averaged offset.
//
// Time is passed in rather than read, so tests can step it exactly. Nothing here
// blocks or spawns; the async loop owns all scheduling.

use crate::core_modules::dispatcher::CommandDispatcher;
use crate::core_modules::guidance_state::{
    ConnectionState, Direction, GuidanceEvent, GuidanceState, NudgeSpeed, PositionState, Pulse,
    SafetyTrip, SetpointState,
};
use crate::core_modules::log_sink::{LogRecord, Point};
use crate::core_modules::subpixel::Position;
use crate::error::{GuideError, Result};
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Control-law and safety settings. Read-only during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct GuidanceConfig {
    /// Pulse milliseconds per pixel of row offset.
    pub gain_row_ms_per_px: f64,
    /// Pulse milliseconds per pixel of column offset.
    pub gain_col_ms_per_px: f64,
    /// Swap north and south.
    pub invert_rows: bool,
    /// Swap east and west.
    pub invert_cols: bool,
    /// Minimum peak/background ratio for a coherent reading.
    pub noise_threshold: f64,
    /// How long incoherence may last before guidance stops.
    pub noise_sustain: Duration,
    pub max_pulse_ms: u32,
    pub nudge_slow_px: f64,
    pub nudge_fast_px: f64,
    /// Coherent positions averaged per correction.
    pub positions_per_guidance: usize,
    /// Offsets up to this magnitude count as on target.
    pub setpoint_tolerance_px: f64,
    /// Consecutive growths of the offset magnitude that make a runaway.
    pub divergence_cycles: usize,
    /// Magnitude the offset must also exceed to trip divergence.
    pub divergence_bound_px: f64,
    /// Halt guidance when the offset diverges.
    pub stop_on_divergence: bool,
}

impl Default for GuidanceConfig {
    fn default() -> Self {
        Self {
            gain_row_ms_per_px: 25.0,
            gain_col_ms_per_px: 25.0,
            invert_rows: false,
            invert_cols: false,
            noise_threshold: 2.0,
            noise_sustain: Duration::from_secs(2 * 60),
            max_pulse_ms: 10_000,
            nudge_slow_px: 0.1,
            nudge_fast_px: 1.0,
            positions_per_guidance: 2,
            setpoint_tolerance_px: 0.05,
            divergence_cycles: 4,
            divergence_bound_px: 5.0,
            stop_on_divergence: true,
        }
    }
}

/// A history entry with its wall-clock time.
#[derive(Debug, Clone, PartialEq)]
pub struct Stamped<T> {
    pub at: DateTime<Local>,
    pub value: T,
}

/// Outcome of one guidance tick.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub record: LogRecord,
    pub pulses: Vec<Pulse>,
}

#[derive(Debug)]
pub struct GuidanceStateMachine {
    config: GuidanceConfig,

    position_state: PositionState,
    setpoint_state: SetpointState,
    connection_state: ConnectionState,
    guidance_state: GuidanceState,

    /// Every reading that produced a position, coherent or not.
    positions: Vec<Stamped<Position>>,
    setpoints: Vec<Stamped<Point>>,
    offsets: Vec<Stamped<Point>>,

    setpoint: Option<Point>,
    last_coherent: Option<Position>,
    /// Coherent positions waiting to be averaged into a correction.
    pending: VecDeque<Position>,
    last_magnitude: Option<f64>,
    growth_streak: usize,
    incoherent_since: Option<Instant>,
    /// Where a `StoppedFailure` resumes once the link is back.
    resume_after_failure: GuidanceState,

    events: Vec<GuidanceEvent>,
}

impl GuidanceStateMachine {
    pub fn new(config: GuidanceConfig) -> Self {
        Self {
            config,
            position_state: PositionState::default(),
            setpoint_state: SetpointState::default(),
            connection_state: ConnectionState::default(),
            guidance_state: GuidanceState::default(),
            positions: Vec::new(),
            setpoints: Vec::new(),
            offsets: Vec::new(),
            setpoint: None,
            last_coherent: None,
            pending: VecDeque::new(),
            last_magnitude: None,
            growth_streak: 0,
            incoherent_since: None,
            resume_after_failure: GuidanceState::NeedsPosition,
            events: Vec::new(),
        }
    }

    pub fn config(&self) -> &GuidanceConfig {
        &self.config
    }

    pub fn position_state(&self) -> PositionState {
        self.position_state
    }

    pub fn setpoint_state(&self) -> SetpointState {
        self.setpoint_state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn guidance_state(&self) -> GuidanceState {
        self.guidance_state
    }

    pub fn setpoint(&self) -> Option<Point> {
        self.setpoint
    }

    pub fn last_coherent(&self) -> Option<Position> {
        self.last_coherent
    }

    pub fn positions(&self) -> &[Stamped<Position>] {
        &self.positions
    }

    pub fn setpoints(&self) -> &[Stamped<Point>] {
        &self.setpoints
    }

    pub fn offsets(&self) -> &[Stamped<Point>] {
        &self.offsets
    }

    /// Takes the events produced since the last call.
    pub fn drain_events(&mut self) -> Vec<GuidanceEvent> {
        std::mem::take(&mut self.events)
    }

    /// Starts (or restarts) a run. While the divergence latch is set, only a setpoint
    /// reset can restart guidance.
    pub fn start(&mut self) {
        if self.divergence_latched() {
            warn!("start ignored: offset diverged, reset the setpoint first");
            return;
        }
        self.pending.clear();
        self.incoherent_since = None;
        self.growth_streak = 0;
        self.last_magnitude = None;
        if self.link_down() {
            warn!(link = ?self.connection_state, "cannot start guidance without a drive link");
            self.enter_failure(GuidanceState::NeedsPosition);
        } else {
            self.set_guidance_state(GuidanceState::NeedsPosition);
        }
    }

    /// Stops the run from any state.
    pub fn stop(&mut self) {
        self.pending.clear();
        self.incoherent_since = None;
        self.set_guidance_state(GuidanceState::StoppedManual);
    }

    /// Feeds the result of the periodic link check.
    pub fn on_connection_check(&mut self, state: ConnectionState) {
        self.set_connection_state(state);
        if state == ConnectionState::On {
            if self.guidance_state == GuidanceState::StoppedFailure {
                let resume = self.resume_after_failure;
                info!(%resume, "drive link back, resuming guidance");
                self.incoherent_since = None;
                self.set_guidance_state(resume);
            }
        } else if self.guidance_state.is_active() {
            warn!(link = ?state, "drive link lost during guidance");
            self.enter_failure(self.guidance_state);
        }
    }

    /// Moves the setpoint by `step * (d_row, d_col)` without sending anything.
    pub fn nudge(&mut self, d_row: i32, d_col: i32, speed: NudgeSpeed) -> Result<()> {
        let setpoint = self.setpoint.ok_or(GuideError::NoPosition)?;
        let step = match speed {
            NudgeSpeed::Slow => self.config.nudge_slow_px,
            NudgeSpeed::Fast => self.config.nudge_fast_px,
        };
        let moved = Point::new(
            setpoint.row + step * f64::from(d_row),
            setpoint.col + step * f64::from(d_col),
        );
        self.growth_streak = 0;
        self.last_magnitude = None;
        self.pending.clear();
        self.set_setpoint(moved);
        Ok(())
    }

    /// Re-centres the setpoint on the last coherent position. This is the only way out
    /// of a divergence stop.
    pub fn reset_setpoint(&mut self) -> Result<()> {
        let position = self.last_coherent.ok_or(GuideError::NoPosition)?;
        self.growth_streak = 0;
        self.last_magnitude = Some(0.0);
        self.pending.clear();
        self.set_setpoint(position.into());
        self.set_setpoint_state(SetpointState::Ok);
        if self.guidance_state == GuidanceState::StoppedDiverge {
            if self.link_down() {
                warn!(link = ?self.connection_state, "setpoint reset, waiting for the drive link");
                self.enter_failure(GuidanceState::Running);
            } else {
                info!("setpoint reset, resuming guidance");
                self.set_guidance_state(GuidanceState::Running);
            }
        }
        Ok(())
    }

    /// Runs one guidance tick on `reading`.
    pub fn observe(
        &mut self,
        reading: Option<Position>,
        now: Instant,
        dispatcher: &mut dyn CommandDispatcher,
    ) -> CycleReport {
        let timestamp = Local::now();
        let confidence = reading.and_then(|p| p.confidence);
        let coherent =
            reading.is_some() && confidence.is_some_and(|c| c >= self.config.noise_threshold);

        if let Some(position) = reading {
            self.positions.push(Stamped {
                at: timestamp,
                value: position,
            });
            self.events.push(GuidanceEvent::Position(position));
        }
        self.events.push(GuidanceEvent::Confidence(confidence));
        self.set_position_state(if coherent {
            PositionState::Coherent
        } else {
            PositionState::Incoherent
        });

        self.track_coherence(coherent, now);

        let mut offset = None;
        if let (true, Some(position)) = (coherent, reading) {
            self.last_coherent = Some(position);
            offset = Some(self.track_offset(position, timestamp));
        }

        let mut pulses = Vec::new();
        if let (true, Some(position)) = (coherent, reading) {
            self.pending.push_back(position);
            if self.pending.len() >= self.config.positions_per_guidance.max(1) {
                let mean = mean_point(self.pending.drain(..));
                if self.correction_due() {
                    if let Some(setpoint) = self.setpoint {
                        let averaged = Point::new(setpoint.row - mean.row, setpoint.col - mean.col);
                        pulses = self.dispatch(averaged, dispatcher);
                    }
                }
            }
        }

        debug!(
            state = %self.guidance_state,
            ?confidence,
            ?offset,
            pulses = pulses.len(),
            "guidance tick"
        );
        CycleReport {
            record: LogRecord {
                timestamp,
                position: reading.map(Point::from),
                setpoint: self.setpoint,
                offset,
                confidence,
            },
            pulses,
        }
    }

    /// Pulses that would correct `offset`, one per non-zero axis.
    pub fn corrections(&self, offset: Point) -> Vec<Pulse> {
        let c = &self.config;
        let row = axis_pulse(
            offset.row,
            c.gain_row_ms_per_px,
            c.max_pulse_ms,
            Direction::South,
            c.invert_rows,
        );
        let col = axis_pulse(
            offset.col,
            c.gain_col_ms_per_px,
            c.max_pulse_ms,
            Direction::West,
            c.invert_cols,
        );
        row.into_iter().chain(col).collect()
    }

    fn track_coherence(&mut self, coherent: bool, now: Instant) {
        match (self.guidance_state, coherent) {
            (GuidanceState::NeedsPosition, true) => {
                self.set_guidance_state(GuidanceState::Running);
            }
            (GuidanceState::Running, false) => {
                self.incoherent_since = Some(now);
                self.set_guidance_state(GuidanceState::RunningNoisy);
            }
            (GuidanceState::RunningNoisy, true) => {
                self.incoherent_since = None;
                self.set_guidance_state(GuidanceState::Running);
            }
            (GuidanceState::RunningNoisy, false) => {
                let since = *self.incoherent_since.get_or_insert(now);
                let elapsed = now.saturating_duration_since(since);
                if elapsed >= self.config.noise_sustain {
                    let trip = SafetyTrip::NoiseTimeout { elapsed };
                    warn!("{trip}");
                    self.events.push(GuidanceEvent::SafetyStop(trip));
                    self.incoherent_since = None;
                    self.pending.clear();
                    self.set_guidance_state(GuidanceState::StoppedNoise);
                }
            }
            _ => {}
        }
    }

    fn track_offset(&mut self, position: Position, at: DateTime<Local>) -> Point {
        let setpoint = match self.setpoint {
            Some(setpoint) => setpoint,
            None => {
                let first = Point::from(position);
                info!(row = first.row, col = first.col, "setpoint initialized");
                self.set_setpoint(first);
                first
            }
        };
        let offset = Point::new(setpoint.row - position.row, setpoint.col - position.col);
        self.offsets.push(Stamped { at, value: offset });

        let magnitude = offset.magnitude();
        if self.guidance_state.is_guiding() {
            match self.last_magnitude {
                Some(last) if magnitude > last => self.growth_streak += 1,
                _ => self.growth_streak = 0,
            }
        }
        self.last_magnitude = Some(magnitude);

        if self.divergence_latched() {
            return offset;
        }
        let state = if self.growth_streak >= self.config.divergence_cycles
            && magnitude > self.config.divergence_bound_px
        {
            SetpointState::Diverging
        } else if magnitude <= self.config.setpoint_tolerance_px {
            SetpointState::Ok
        } else {
            SetpointState::Far
        };
        let entered = state != self.setpoint_state;
        self.set_setpoint_state(state);

        if state == SetpointState::Diverging && entered {
            let trip = SafetyTrip::Divergence {
                magnitude,
                cycles: self.growth_streak,
            };
            warn!("{trip}");
            self.events.push(GuidanceEvent::SafetyStop(trip));
            if self.config.stop_on_divergence && self.guidance_state.is_guiding() {
                self.pending.clear();
                self.set_guidance_state(GuidanceState::StoppedDiverge);
            }
        }
        offset
    }

    fn correction_due(&self) -> bool {
        self.guidance_state.is_guiding()
            && match self.setpoint_state {
                SetpointState::Far => true,
                SetpointState::Diverging => !self.config.stop_on_divergence,
                _ => false,
            }
    }

    fn dispatch(&mut self, offset: Point, dispatcher: &mut dyn CommandDispatcher) -> Vec<Pulse> {
        let mut sent = Vec::new();
        for pulse in self.corrections(offset) {
            match dispatcher.send_pulse(pulse.direction, pulse.duration_ms) {
                Ok(()) => {
                    self.events.push(GuidanceEvent::PulseDispatched(pulse));
                    sent.push(pulse);
                }
                Err(e) => {
                    warn!(direction = %pulse.direction, "pulse failed: {e}");
                    self.set_connection_state(ConnectionState::Off);
                    self.enter_failure(self.guidance_state);
                    break;
                }
            }
        }
        sent
    }

    fn divergence_latched(&self) -> bool {
        self.config.stop_on_divergence && self.setpoint_state == SetpointState::Diverging
    }

    fn link_down(&self) -> bool {
        matches!(
            self.connection_state,
            ConnectionState::Off | ConnectionState::LinkUnavailable
        )
    }

    /// Parks guidance in `StoppedFailure`. A run that was guiding resumes as Running,
    /// anything else waits for a position again.
    fn enter_failure(&mut self, resume: GuidanceState) {
        self.resume_after_failure = if resume.is_guiding() {
            GuidanceState::Running
        } else {
            GuidanceState::NeedsPosition
        };
        self.pending.clear();
        self.set_guidance_state(GuidanceState::StoppedFailure);
    }

    fn set_setpoint(&mut self, point: Point) {
        self.setpoint = Some(point);
        self.setpoints.push(Stamped {
            at: Local::now(),
            value: point,
        });
        self.events.push(GuidanceEvent::Setpoint {
            row: point.row,
            col: point.col,
        });
    }

    fn set_position_state(&mut self, state: PositionState) {
        if self.position_state != state {
            self.position_state = state;
            self.events.push(GuidanceEvent::PositionState(state));
        }
    }

    fn set_setpoint_state(&mut self, state: SetpointState) {
        if self.setpoint_state != state {
            debug!(?state, "setpoint state");
            self.setpoint_state = state;
            self.events.push(GuidanceEvent::SetpointState(state));
        }
    }

    fn set_connection_state(&mut self, state: ConnectionState) {
        if self.connection_state != state {
            info!(?state, "connection state");
            self.connection_state = state;
            self.events.push(GuidanceEvent::Connection(state));
        }
    }

    fn set_guidance_state(&mut self, to: GuidanceState) {
        let from = self.guidance_state;
        if from != to {
            info!(%from, %to, "guidance state");
            self.guidance_state = to;
            self.events.push(GuidanceEvent::Guidance { from, to });
        }
    }
}

/// Pulse for one axis. A positive offset drives `positive`, a negative one its
/// opposite, and `invert` swaps the pair.
fn axis_pulse(offset: f64, gain: f64, max_ms: u32, positive: Direction, invert: bool) -> Option<Pulse> {
    let duration_ms = (offset.abs() * gain).round().min(f64::from(max_ms)) as u32;
    if duration_ms == 0 {
        return None;
    }
    let direction = if (offset > 0.0) != invert {
        positive
    } else {
        positive.opposite()
    };
    Some(Pulse {
        direction,
        duration_ms,
    })
}

fn mean_point(positions: impl Iterator<Item = Position>) -> Point {
    let (mut row, mut col, mut n) = (0.0, 0.0, 0usize);
    for p in positions {
        row += p.row;
        col += p.col;
        n += 1;
    }
    if n == 0 {
        return Point::default();
    }
    Point::new(row / n as f64, col / n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[derive(Default)]
    struct Recorder {
        pulses: Vec<Pulse>,
        fail: bool,
    }

    impl CommandDispatcher for Recorder {
        fn send_pulse(&mut self, direction: Direction, duration_ms: u32) -> Result<()> {
            if self.fail {
                return Err(GuideError::Connection("unplugged".into()));
            }
            self.pulses.push(Pulse {
                direction,
                duration_ms,
            });
            Ok(())
        }
        fn connect(&mut self, _: &Path) -> Result<()> {
            Ok(())
        }
        fn disconnect(&mut self) {}
        fn check_link(&mut self) -> ConnectionState {
            ConnectionState::On
        }
    }

    fn at(row: f64, col: f64) -> Option<Position> {
        Some(Position {
            row,
            col,
            confidence: Some(10.0),
        })
    }

    fn noisy() -> Option<Position> {
        Some(Position {
            row: 0.0,
            col: 0.0,
            confidence: Some(1.1),
        })
    }

    fn running(config: GuidanceConfig) -> (GuidanceStateMachine, Recorder, Instant) {
        let mut gsm = GuidanceStateMachine::new(config);
        let mut rec = Recorder::default();
        let t0 = Instant::now();
        gsm.start();
        gsm.observe(at(100.0, 100.0), t0, &mut rec);
        assert_eq!(gsm.guidance_state(), GuidanceState::Running);
        (gsm, rec, t0)
    }

    #[test]
    fn first_coherent_reading_sets_the_setpoint() {
        let (gsm, rec, _) = running(GuidanceConfig::default());
        assert_eq!(gsm.setpoint(), Some(Point::new(100.0, 100.0)));
        assert_eq!(gsm.setpoint_state(), SetpointState::Ok);
        assert_eq!(gsm.position_state(), PositionState::Coherent);
        assert!(rec.pulses.is_empty());
    }

    #[test]
    fn offset_within_tolerance_sends_nothing() {
        let (mut gsm, mut rec, t0) = running(GuidanceConfig::default());
        for i in 1..6 {
            gsm.observe(at(100.02, 99.97), t0 + Duration::from_secs(i), &mut rec);
        }
        assert_eq!(gsm.setpoint_state(), SetpointState::Ok);
        assert!(rec.pulses.is_empty());
    }

    #[test]
    fn pulse_duration_clamps_to_maximum() {
        let (gsm, _, _) = running(GuidanceConfig::default());
        let pulses = gsm.corrections(Point::new(500.0, 0.0));
        assert_eq!(
            pulses,
            vec![Pulse {
                direction: Direction::South,
                duration_ms: 10_000
            }]
        );
    }

    #[test]
    fn directions_follow_offset_sign_and_inversion() {
        let (gsm, _, _) = running(GuidanceConfig::default());
        let pulses = gsm.corrections(Point::new(-2.0, 1.0));
        assert_eq!(pulses[0], Pulse { direction: Direction::North, duration_ms: 50 });
        assert_eq!(pulses[1], Pulse { direction: Direction::West, duration_ms: 25 });

        let inverted = GuidanceStateMachine::new(GuidanceConfig {
            invert_rows: true,
            invert_cols: true,
            ..GuidanceConfig::default()
        });
        let pulses = inverted.corrections(Point::new(-2.0, 1.0));
        assert_eq!(pulses[0].direction, Direction::South);
        assert_eq!(pulses[1].direction, Direction::East);
    }

    #[test]
    fn corrections_use_the_mean_of_pending_positions() {
        let (mut gsm, mut rec, t0) = running(GuidanceConfig::default());
        // Pending holds the setpoint reading; one more completes the pair.
        gsm.observe(at(104.0, 100.0), t0 + Duration::from_secs(5), &mut rec);
        assert_eq!(
            rec.pulses,
            vec![Pulse {
                direction: Direction::North,
                duration_ms: 50
            }]
        );
        gsm.observe(at(104.0, 100.0), t0 + Duration::from_secs(10), &mut rec);
        assert_eq!(rec.pulses.len(), 1, "waits for a second position");
        gsm.observe(at(104.0, 100.0), t0 + Duration::from_secs(15), &mut rec);
        assert_eq!(rec.pulses[1].duration_ms, 100);
    }

    #[test]
    fn divergence_stops_until_reset() {
        let config = GuidanceConfig {
            positions_per_guidance: 1,
            ..GuidanceConfig::default()
        };
        let (mut gsm, mut rec, t0) = running(config);
        for (i, d) in [2.0, 3.0, 4.0, 5.0, 6.0].into_iter().enumerate() {
            gsm.observe(at(100.0, 100.0 + d), t0 + Duration::from_secs(i as u64 + 1), &mut rec);
        }
        assert_eq!(gsm.setpoint_state(), SetpointState::Diverging);
        assert_eq!(gsm.guidance_state(), GuidanceState::StoppedDiverge);
        let events = gsm.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, GuidanceEvent::SafetyStop(SafetyTrip::Divergence { .. }))));

        let sent = rec.pulses.len();
        gsm.observe(at(100.0, 110.0), t0 + Duration::from_secs(10), &mut rec);
        gsm.start();
        gsm.observe(at(100.0, 90.0), t0 + Duration::from_secs(11), &mut rec);
        assert_eq!(rec.pulses.len(), sent, "no pulses while diverged");
        assert_eq!(gsm.guidance_state(), GuidanceState::StoppedDiverge);

        gsm.reset_setpoint().unwrap();
        assert_eq!(gsm.setpoint(), Some(Point::new(100.0, 90.0)));
        assert_eq!(gsm.setpoint_state(), SetpointState::Ok);
        assert_eq!(gsm.guidance_state(), GuidanceState::Running);
        gsm.observe(at(100.0, 92.0), t0 + Duration::from_secs(12), &mut rec);
        assert_eq!(rec.pulses.len(), sent + 1);
    }

    fn diverged() -> (GuidanceStateMachine, Recorder, Instant) {
        let config = GuidanceConfig {
            positions_per_guidance: 1,
            ..GuidanceConfig::default()
        };
        let (mut gsm, mut rec, t0) = running(config);
        for (i, d) in [2.0, 3.0, 4.0, 5.0, 6.0].into_iter().enumerate() {
            gsm.observe(at(100.0, 100.0 + d), t0 + Duration::from_secs(i as u64 + 1), &mut rec);
        }
        assert_eq!(gsm.guidance_state(), GuidanceState::StoppedDiverge);
        (gsm, rec, t0)
    }

    #[test]
    fn stop_then_start_keeps_the_divergence_latch() {
        let (mut gsm, mut rec, t0) = diverged();
        let sent = rec.pulses.len();

        gsm.stop();
        gsm.start();
        assert_eq!(gsm.guidance_state(), GuidanceState::StoppedManual);
        assert_eq!(gsm.setpoint_state(), SetpointState::Diverging);
        for i in 0..3 {
            gsm.observe(at(100.0, 107.0), t0 + Duration::from_secs(20 + i), &mut rec);
        }
        assert_eq!(rec.pulses.len(), sent, "no pulses until the setpoint is reset");

        gsm.reset_setpoint().unwrap();
        assert_eq!(gsm.setpoint_state(), SetpointState::Ok);
        gsm.start();
        assert_eq!(gsm.guidance_state(), GuidanceState::NeedsPosition);
    }

    #[test]
    fn reset_waits_for_the_link_when_it_dropped_while_diverged() {
        let (mut gsm, mut rec, t0) = diverged();
        gsm.on_connection_check(ConnectionState::LinkUnavailable);
        assert_eq!(gsm.guidance_state(), GuidanceState::StoppedDiverge);

        gsm.reset_setpoint().unwrap();
        assert_eq!(gsm.guidance_state(), GuidanceState::StoppedFailure);
        let sent = rec.pulses.len();
        gsm.observe(at(100.0, 103.0), t0 + Duration::from_secs(20), &mut rec);
        assert_eq!(rec.pulses.len(), sent);

        gsm.on_connection_check(ConnectionState::On);
        assert_eq!(gsm.guidance_state(), GuidanceState::Running);
    }

    #[test]
    fn failure_before_the_first_position_resumes_waiting_for_one() {
        let mut gsm = GuidanceStateMachine::new(GuidanceConfig::default());
        gsm.on_connection_check(ConnectionState::LinkUnavailable);
        gsm.start();
        assert_eq!(gsm.guidance_state(), GuidanceState::StoppedFailure);
        gsm.on_connection_check(ConnectionState::On);
        assert_eq!(gsm.guidance_state(), GuidanceState::NeedsPosition);

        gsm.on_connection_check(ConnectionState::Off);
        assert_eq!(gsm.guidance_state(), GuidanceState::StoppedFailure);
        gsm.on_connection_check(ConnectionState::On);
        assert_eq!(gsm.guidance_state(), GuidanceState::NeedsPosition);
    }

    #[test]
    fn divergence_can_be_reported_without_stopping() {
        let config = GuidanceConfig {
            positions_per_guidance: 1,
            stop_on_divergence: false,
            ..GuidanceConfig::default()
        };
        let (mut gsm, mut rec, t0) = running(config);
        for (i, d) in [2.0, 3.0, 4.0, 5.0, 6.0, 7.0].into_iter().enumerate() {
            gsm.observe(at(100.0, 100.0 + d), t0 + Duration::from_secs(i as u64 + 1), &mut rec);
        }
        assert_eq!(gsm.setpoint_state(), SetpointState::Diverging);
        assert_eq!(gsm.guidance_state(), GuidanceState::Running);
        assert_eq!(rec.pulses.len(), 6);
    }

    #[test]
    fn short_noise_recovers() {
        let (mut gsm, mut rec, t0) = running(GuidanceConfig::default());
        gsm.observe(noisy(), t0 + Duration::from_secs(5), &mut rec);
        assert_eq!(gsm.guidance_state(), GuidanceState::RunningNoisy);
        gsm.observe(None, t0 + Duration::from_secs(60), &mut rec);
        assert_eq!(gsm.position_state(), PositionState::Incoherent);
        gsm.observe(at(100.0, 100.0), t0 + Duration::from_secs(90), &mut rec);
        assert_eq!(gsm.guidance_state(), GuidanceState::Running);
        assert!(!gsm
            .drain_events()
            .iter()
            .any(|e| matches!(e, GuidanceEvent::Guidance { to: GuidanceState::StoppedNoise, .. })));
    }

    #[test]
    fn sustained_noise_stops() {
        let (mut gsm, mut rec, t0) = running(GuidanceConfig::default());
        gsm.observe(noisy(), t0 + Duration::from_secs(5), &mut rec);
        gsm.observe(noisy(), t0 + Duration::from_secs(60), &mut rec);
        assert_eq!(gsm.guidance_state(), GuidanceState::RunningNoisy);
        gsm.observe(noisy(), t0 + Duration::from_secs(125), &mut rec);
        assert_eq!(gsm.guidance_state(), GuidanceState::StoppedNoise);

        // Terminal until restarted.
        gsm.observe(at(100.0, 100.0), t0 + Duration::from_secs(130), &mut rec);
        assert_eq!(gsm.guidance_state(), GuidanceState::StoppedNoise);
        gsm.start();
        assert_eq!(gsm.guidance_state(), GuidanceState::NeedsPosition);
    }

    #[test]
    fn missing_confidence_is_incoherent() {
        let mut gsm = GuidanceStateMachine::new(GuidanceConfig::default());
        let mut rec = Recorder::default();
        gsm.start();
        gsm.observe(
            Some(Position {
                row: 1.0,
                col: 1.0,
                confidence: None,
            }),
            Instant::now(),
            &mut rec,
        );
        assert_eq!(gsm.position_state(), PositionState::Incoherent);
        assert_eq!(gsm.guidance_state(), GuidanceState::NeedsPosition);
        assert_eq!(gsm.setpoint(), None);
    }

    #[test]
    fn link_loss_and_recovery() {
        let (mut gsm, _, _) = running(GuidanceConfig::default());
        gsm.on_connection_check(ConnectionState::On);
        gsm.on_connection_check(ConnectionState::LinkUnavailable);
        assert_eq!(gsm.guidance_state(), GuidanceState::StoppedFailure);
        gsm.on_connection_check(ConnectionState::On);
        assert_eq!(gsm.guidance_state(), GuidanceState::Running);
    }

    #[test]
    fn failed_pulse_marks_link_off() {
        let config = GuidanceConfig {
            positions_per_guidance: 1,
            ..GuidanceConfig::default()
        };
        let (mut gsm, mut rec, t0) = running(config);
        rec.fail = true;
        gsm.observe(at(103.0, 104.0), t0 + Duration::from_secs(5), &mut rec);
        assert_eq!(gsm.connection_state(), ConnectionState::Off);
        assert_eq!(gsm.guidance_state(), GuidanceState::StoppedFailure);
    }

    #[test]
    fn start_without_link_fails() {
        let mut gsm = GuidanceStateMachine::new(GuidanceConfig::default());
        gsm.on_connection_check(ConnectionState::Off);
        gsm.start();
        assert_eq!(gsm.guidance_state(), GuidanceState::StoppedFailure);
    }

    #[test]
    fn nudge_moves_setpoint_only() {
        let (mut gsm, rec, _) = running(GuidanceConfig::default());
        gsm.nudge(1, -1, NudgeSpeed::Fast).unwrap();
        gsm.nudge(0, 3, NudgeSpeed::Slow).unwrap();
        let sp = gsm.setpoint().unwrap();
        assert!((sp.row - 101.0).abs() < 1e-12);
        assert!((sp.col - 99.3).abs() < 1e-12);
        assert!(rec.pulses.is_empty());
        assert_eq!(gsm.setpoints().len(), 3);

        let mut fresh = GuidanceStateMachine::new(GuidanceConfig::default());
        assert!(matches!(fresh.nudge(1, 0, NudgeSpeed::Slow), Err(GuideError::NoPosition)));
        assert!(matches!(fresh.reset_setpoint(), Err(GuideError::NoPosition)));
    }

    #[test]
    fn stop_wins_from_any_state() {
        let (mut gsm, _, _) = running(GuidanceConfig::default());
        gsm.stop();
        assert_eq!(gsm.guidance_state(), GuidanceState::StoppedManual);
        gsm.on_connection_check(ConnectionState::Off);
        assert_eq!(gsm.guidance_state(), GuidanceState::StoppedManual);
    }
}
