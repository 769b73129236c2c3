// THEORY:
// Every failure the guider can meet falls into one of a handful of families. Frame
// loading can fail to open a source or meet a sample layout we refuse to guess at.
// Normalization can be asked to stretch a flat image. The drive link can vanish.
// Two of the families are not bugs at all but safety stops raised by the state
// machine; they are carried here so callers can log and surface them uniformly.

use crate::core_modules::guidance_state::SafetyTrip;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the image pipeline, the guidance state machine and its collaborators.
#[derive(Error, Debug)]
pub enum GuideError {
    /// The source file could not be opened, read or written.
    #[error("cannot open {path}: {source}")]
    Opening {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O or codec failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The frame is not single-sample grayscale at 8 or 16 bits.
    #[error("unsupported frame format: {samples_per_pixel} sample(s) of {bits_per_sample} bits")]
    Format {
        bits_per_sample: u16,
        samples_per_pixel: u16,
    },

    /// Normalization was attempted on a constant (or empty) grid.
    #[error("degenerate intensity range: cannot normalize a constant image")]
    DegenerateRange,

    /// The device path could not be opened or a pulse could not be written.
    #[error("connection error: {0}")]
    Connection(String),

    /// A safety stop tripped by the state machine.
    #[error("safety stop: {0}")]
    Safety(#[from] SafetyTrip),

    /// An operation needed a coherent position and none has been observed yet.
    #[error("no coherent position available")]
    NoPosition,

    /// Configuration validation or parsing failure.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A blocking correlation worker panicked or was cancelled.
    #[error("correlation worker failed: {0}")]
    Worker(String),
}

impl GuideError {
    pub(crate) fn opening(
        path: impl Into<PathBuf>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        GuideError::Opening {
            path: path.into(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, GuideError>;
