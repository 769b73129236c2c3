// THEORY:
// One record per guidance tick, appended and never rewritten, so a night's run can be
// replayed or plotted afterwards. The state machine only builds records; where they
// go is up to a `LogSink`.

use crate::core_modules::subpixel::Position;
use crate::error::{GuideError, Result};
use chrono::{DateTime, Local};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// A (row, col) pair in correlation-map pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub row: f64,
    pub col: f64,
}

impl Point {
    pub fn new(row: f64, col: f64) -> Self {
        Self { row, col }
    }

    pub fn magnitude(&self) -> f64 {
        self.row.hypot(self.col)
    }
}

impl From<Position> for Point {
    fn from(p: Position) -> Self {
        Self::new(p.row, p.col)
    }
}

/// One guidance tick.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: DateTime<Local>,
    pub position: Option<Point>,
    pub setpoint: Option<Point>,
    /// Setpoint minus position.
    pub offset: Option<Point>,
    pub confidence: Option<f64>,
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn pair(f: &mut fmt::Formatter<'_>, p: Option<Point>) -> fmt::Result {
            match p {
                Some(p) => write!(f, "\t{:.3}\t{:.3}", p.row, p.col),
                None => f.write_str("\t-\t-"),
            }
        }
        write!(f, "{}", self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"))?;
        pair(f, self.position)?;
        pair(f, self.setpoint)?;
        pair(f, self.offset)?;
        match self.confidence {
            Some(c) => write!(f, "\t{c:.3}"),
            None => f.write_str("\t-"),
        }
    }
}

/// Destination for guidance log records.
pub trait LogSink: Send {
    fn append(&mut self, record: &LogRecord) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl LogSink for Vec<LogRecord> {
    fn append(&mut self, record: &LogRecord) -> Result<()> {
        self.push(record.clone());
        Ok(())
    }
}

/// Tab-separated append-only position log.
#[derive(Debug)]
pub struct PositionLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl PositionLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| GuideError::opening(&path, e))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }
}

impl LogSink for PositionLog {
    fn append(&mut self, record: &LogRecord) -> Result<()> {
        writeln!(self.writer, "{record}").map_err(|e| GuideError::opening(&self.path, e))
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| GuideError::opening(&self.path, e))
    }
}
