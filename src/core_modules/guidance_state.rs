// THEORY:
// The guider's situation is described by four independent axes instead of a bag of
// booleans: how trustworthy the latest position is, where the Sun sits relative to
// the setpoint, whether the drive link is usable, and what the control loop is doing
// about it. Each axis is a small enum with its own "not yet known" value, so a reader
// of any snapshot can tell "never observed" apart from "observed and bad".
//
// Everything observable about a run leaves the state machine as a `GuidanceEvent`.
// The async loop fans these out to whoever listens; the state machine itself never
// knows who that is.

use crate::core_modules::subpixel::Position;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Trust in the latest position reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PositionState {
    #[default]
    Uninitialized,
    /// Confidence at or above the noise threshold.
    Coherent,
    /// Confidence below the threshold, unmeasurable, or no position at all.
    Incoherent,
}

/// Where the Sun sits relative to the setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetpointState {
    #[default]
    Uninitialized,
    /// Offset within tolerance.
    Ok,
    /// Offset beyond tolerance; corrections are due.
    Far,
    /// Offset has kept growing past the runaway bound.
    Diverging,
}

/// Drive link health as reported by the periodic connection check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Uninitialized,
    On,
    /// Transient: the link was reachable but is not now.
    Off,
    /// The device path cannot be opened at all.
    LinkUnavailable,
}

/// What the control loop is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuidanceState {
    /// Never started.
    #[default]
    Idle,
    Running,
    /// Guiding, but recent readings are incoherent.
    RunningNoisy,
    /// Started, waiting for the first coherent reading.
    NeedsPosition,
    StoppedNoise,
    StoppedManual,
    StoppedDiverge,
    StoppedFailure,
}

impl GuidanceState {
    /// States in which corrections may be dispatched.
    pub fn is_guiding(self) -> bool {
        matches!(self, GuidanceState::Running | GuidanceState::RunningNoisy)
    }

    /// States a link failure interrupts.
    pub fn is_active(self) -> bool {
        self.is_guiding() || self == GuidanceState::NeedsPosition
    }
}

impl fmt::Display for GuidanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GuidanceState::Idle => "idle",
            GuidanceState::Running => "running",
            GuidanceState::RunningNoisy => "running (noisy)",
            GuidanceState::NeedsPosition => "needs position",
            GuidanceState::StoppedNoise => "stopped: noise",
            GuidanceState::StoppedManual => "stopped: manual",
            GuidanceState::StoppedDiverge => "stopped: diverging",
            GuidanceState::StoppedFailure => "stopped: link failure",
        };
        f.write_str(name)
    }
}

/// One of the four drive directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::North => Direction::South,
            Direction::South => Direction::North,
            Direction::East => Direction::West,
            Direction::West => Direction::East,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Direction::North => "north",
            Direction::South => "south",
            Direction::East => "east",
            Direction::West => "west",
        };
        f.write_str(name)
    }
}

/// A timed, directional drive command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    pub direction: Direction,
    pub duration_ms: u32,
}

/// Manual nudge step size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NudgeSpeed {
    #[default]
    Slow,
    Fast,
}

/// Safety stops. These end the current run and need operator action.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SafetyTrip {
    #[error("offset diverging: {magnitude:.2} px after {cycles} growing cycles")]
    Divergence { magnitude: f64, cycles: usize },

    #[error("confidence below threshold for {elapsed:?}")]
    NoiseTimeout { elapsed: Duration },
}

/// A point to overlay on the displayed frame, in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Marker {
    pub row: f64,
    pub col: f64,
    pub diameter: f64,
}

/// Overlay markers for the current position and the setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Markers {
    pub position: Option<Marker>,
    pub setpoint: Option<Marker>,
}

/// Everything a listener can learn about a run.
#[derive(Debug, Clone, PartialEq)]
pub enum GuidanceEvent {
    PositionState(PositionState),
    SetpointState(SetpointState),
    Connection(ConnectionState),
    Guidance {
        from: GuidanceState,
        to: GuidanceState,
    },
    Position(Position),
    Setpoint {
        row: f64,
        col: f64,
    },
    Confidence(Option<f64>),
    PulseDispatched(Pulse),
    SafetyStop(SafetyTrip),
    Markers(Markers),
}
