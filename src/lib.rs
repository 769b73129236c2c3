// THEORY:
// This file is the entry point for the `sun_guider` library crate. It exposes two
// high-level pieces: the `SolarPipeline`, which turns a frame into a located limb
// position, and the `GuidanceLoop`, which feeds those positions to the guidance
// state machine and sends drive corrections. The stages themselves live in
// `core_modules` and stay usable on their own for tests and offline analysis.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod guidance_loop;
pub mod parallel_correlation;
pub mod pipeline;

pub use config::{GuideConfig, LinkConfig};
pub use core_modules::dispatcher::{CommandDispatcher, DeviceFileDispatcher, DryRunDispatcher, PinMap};
pub use core_modules::guidance::{GuidanceConfig, GuidanceStateMachine};
pub use core_modules::guidance_state::{
    ConnectionState, Direction, GuidanceEvent, GuidanceState, PositionState, Pulse, SafetyTrip,
    SetpointState,
};
pub use core_modules::pixel_grid::PixelGrid;
pub use core_modules::subpixel::Position;
pub use error::{GuideError, Result};
pub use guidance_loop::{ControlCommand, GuidanceLoop};
pub use pipeline::{FrameReport, PipelineConfig, SolarPipeline};
