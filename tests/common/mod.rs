//! Shared fixtures for the guider integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use sun_guider::core_modules::log_sink::{LogRecord, LogSink};
use sun_guider::core_modules::template::{draw_donut, DonutShape};
use sun_guider::guidance_loop::FrameSource;
use sun_guider::{CommandDispatcher, ConnectionState, Direction, GuideError, PixelGrid, Position, Pulse};

/// Sky background added under the disc.
pub const BACKGROUND: f64 = 1000.0;
/// Disc brightness above the background.
pub const DISC: f64 = 30000.0;

/// A smooth-edged solar disc of `diameter` pixels centred on `center`.
pub fn sun_frame(rows: usize, cols: usize, center: (f64, f64), diameter: f64) -> PixelGrid {
    let mut frame = PixelGrid::new(rows, cols);
    draw_donut(
        &mut frame,
        &DonutShape {
            center_row: center.0,
            center_col: center.1,
            inner_radius: 0.0,
            inner_margin: 0.0,
            outer_radius: diameter / 2.0 - 1.25,
            outer_margin: 2.5,
        },
    );
    for v in frame.as_mut_slice() {
        *v = BACKGROUND + DISC * *v;
    }
    frame
}

/// A reading at (row, col) with the given confidence.
pub fn reading(row: f64, col: f64, confidence: f64) -> Option<Position> {
    Some(Position {
        row,
        col,
        confidence: Some(confidence),
    })
}

/// Dispatcher that records pulses; clones share the same record.
#[derive(Clone)]
pub struct RecordingDispatcher {
    pub pulses: Arc<Mutex<Vec<Pulse>>>,
    pub link: Arc<Mutex<ConnectionState>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self {
            pulses: Arc::new(Mutex::new(Vec::new())),
            link: Arc::new(Mutex::new(ConnectionState::On)),
        }
    }

    pub fn sent(&self) -> Vec<Pulse> {
        self.pulses.lock().unwrap().clone()
    }

    pub fn set_link(&self, state: ConnectionState) {
        *self.link.lock().unwrap() = state;
    }
}

impl CommandDispatcher for RecordingDispatcher {
    fn send_pulse(&mut self, direction: Direction, duration_ms: u32) -> sun_guider::Result<()> {
        if *self.link.lock().unwrap() != ConnectionState::On {
            return Err(GuideError::Connection("link down".into()));
        }
        self.pulses.lock().unwrap().push(Pulse {
            direction,
            duration_ms,
        });
        Ok(())
    }

    fn connect(&mut self, _path: &Path) -> sun_guider::Result<()> {
        self.set_link(ConnectionState::On);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.set_link(ConnectionState::Off);
    }

    fn check_link(&mut self) -> ConnectionState {
        *self.link.lock().unwrap()
    }
}

/// Log sink whose records stay readable after the loop consumed it.
#[derive(Clone, Default)]
pub struct SharedLog(pub Arc<Mutex<Vec<LogRecord>>>);

impl SharedLog {
    pub fn records(&self) -> Vec<LogRecord> {
        self.0.lock().unwrap().clone()
    }
}

impl LogSink for SharedLog {
    fn append(&mut self, record: &LogRecord) -> sun_guider::Result<()> {
        self.0.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Frames served from memory, in order.
pub struct VecFrameSource(pub VecDeque<sun_guider::Result<PixelGrid>>);

impl VecFrameSource {
    pub fn new(frames: impl IntoIterator<Item = sun_guider::Result<PixelGrid>>) -> Self {
        Self(frames.into_iter().collect())
    }
}

impl FrameSource for VecFrameSource {
    fn next_frame(&mut self) -> Option<sun_guider::Result<PixelGrid>> {
        self.0.pop_front()
    }
}
