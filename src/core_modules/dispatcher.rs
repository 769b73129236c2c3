// THEORY:
// The state machine decides *what* to send; a dispatcher knows *how*. The drive
// controller sits behind a character device that accepts one text command per line,
// "<pin> <duration_ms>", and pulses the given relay for that long. The pin numbers are
// wiring, not logic, so they live in a `PinMap`.
//
// A dispatcher never retries on its own. A failed write is reported once and the link
// is marked down; the periodic connection check is what tries the device again and
// hands the result back to the state machine as a `ConnectionState`.

use crate::core_modules::guidance_state::{ConnectionState, Direction};
use crate::error::{GuideError, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Boundary between the guidance core and the drive hardware.
pub trait CommandDispatcher: Send {
    /// Pulses the drive in `direction` for `duration_ms`.
    fn send_pulse(&mut self, direction: Direction, duration_ms: u32) -> Result<()>;

    /// Opens the link at `path`, remembering it for later reconnects.
    fn connect(&mut self, path: &Path) -> Result<()>;

    /// Closes the link and forgets its path.
    fn disconnect(&mut self);

    /// Probes the link, reopening a remembered path if it dropped.
    fn check_link(&mut self) -> ConnectionState;
}

/// Relay pin wired to each drive direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinMap {
    pub north: u8,
    pub south: u8,
    pub east: u8,
    pub west: u8,
}

impl Default for PinMap {
    fn default() -> Self {
        Self {
            north: 12,
            south: 11,
            east: 9,
            west: 10,
        }
    }
}

impl PinMap {
    pub fn pin(&self, direction: Direction) -> u8 {
        match direction {
            Direction::North => self.north,
            Direction::South => self.south,
            Direction::East => self.east,
            Direction::West => self.west,
        }
    }
}

/// Writes pulse commands to a device file, one line per pulse.
#[derive(Debug)]
pub struct DeviceFileDispatcher {
    pins: PinMap,
    path: Option<PathBuf>,
    device: Option<File>,
}

impl DeviceFileDispatcher {
    pub fn new(pins: PinMap) -> Self {
        Self {
            pins,
            path: None,
            device: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn open(path: &Path) -> Result<File> {
        OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| GuideError::Connection(format!("{}: {e}", path.display())))
    }
}

impl CommandDispatcher for DeviceFileDispatcher {
    fn send_pulse(&mut self, direction: Direction, duration_ms: u32) -> Result<()> {
        let pin = self.pins.pin(direction);
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| GuideError::Connection("device not connected".to_string()))?;
        let written = writeln!(device, "{pin} {duration_ms}").and_then(|_| device.flush());
        if let Err(e) = written {
            warn!(%direction, pin, "pulse write failed: {e}");
            self.device = None;
            return Err(GuideError::Connection(e.to_string()));
        }
        debug!(%direction, pin, duration_ms, "pulse sent");
        Ok(())
    }

    fn connect(&mut self, path: &Path) -> Result<()> {
        self.path = Some(path.to_path_buf());
        self.device = None;
        let device = Self::open(path)?;
        info!(path = %path.display(), "drive link connected");
        self.device = Some(device);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(path) = self.path.take() {
            info!(path = %path.display(), "drive link disconnected");
        }
        self.device = None;
    }

    fn check_link(&mut self) -> ConnectionState {
        let Some(path) = self.path.clone() else {
            return ConnectionState::Off;
        };
        if self.device.is_some() && path.exists() {
            return ConnectionState::On;
        }
        match Self::open(&path) {
            Ok(device) => {
                info!(path = %path.display(), "drive link reopened");
                self.device = Some(device);
                ConnectionState::On
            }
            Err(e) => {
                debug!("link check: {e}");
                self.device = None;
                ConnectionState::LinkUnavailable
            }
        }
    }
}

/// Logs pulses instead of driving hardware; the link is always up.
#[derive(Debug, Default)]
pub struct DryRunDispatcher {
    pins: PinMap,
    sent: usize,
}

impl DryRunDispatcher {
    pub fn new(pins: PinMap) -> Self {
        Self { pins, sent: 0 }
    }

    /// Number of pulses accepted so far.
    pub fn sent(&self) -> usize {
        self.sent
    }
}

impl CommandDispatcher for DryRunDispatcher {
    fn send_pulse(&mut self, direction: Direction, duration_ms: u32) -> Result<()> {
        self.sent += 1;
        info!(%direction, pin = self.pins.pin(direction), duration_ms, "dry-run pulse");
        Ok(())
    }

    fn connect(&mut self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "dry run: ignoring device path");
        Ok(())
    }

    fn disconnect(&mut self) {}

    fn check_link(&mut self) -> ConnectionState {
        ConnectionState::On
    }
}
