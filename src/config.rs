// THEORY:
// All tunables live in one INI file with four sections:
//
//   [pipeline]  image side: binning, solar diameter, thresholds, interpolation
//   [guidance]  control law and safety limits
//   [pins]      relay pin wired to each drive direction
//   [link]      device path and loop cadences
//
// A missing file section or key keeps its default, so an empty file is a valid
// configuration. A key that is present but does not parse is an error, never a
// silent fallback: a typo in a gain must not turn into the default gain.

use crate::core_modules::dispatcher::PinMap;
use crate::core_modules::guidance::GuidanceConfig;
use crate::error::{GuideError, Result};
use crate::pipeline::PipelineConfig;
use ini::{Ini, Properties};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Device link and loop cadence settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    /// Device file the drive controller listens on. `None` runs dry.
    pub device: Option<PathBuf>,
    pub connection_check_period: Duration,
    /// Minimum time between the starts of two guidance cycles.
    pub guidance_period: Duration,
    /// Append-only position log.
    pub position_log: Option<PathBuf>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device: None,
            connection_check_period: Duration::from_millis(1000),
            guidance_period: Duration::from_millis(5000),
            position_log: None,
        }
    }
}

/// Complete guider configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GuideConfig {
    pub pipeline: PipelineConfig,
    pub guidance: GuidanceConfig,
    pub pins: PinMap,
    pub link: LinkConfig,
}

impl GuideConfig {
    /// Reads `path`, filling absent keys with defaults, and validates the result.
    pub fn load(path: &Path) -> Result<Self> {
        let ini = Ini::load_from_file(path).map_err(|e| GuideError::opening(path, e))?;
        let config = Self::from_ini(&ini)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes every key, defaults included.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.to_ini()
            .write_to_file(path)
            .map_err(|e| GuideError::opening(path, e))
    }

    pub fn from_ini(ini: &Ini) -> Result<Self> {
        let mut c = GuideConfig::default();

        if let Some(s) = ini.section(Some("pipeline")) {
            let p = &mut c.pipeline;
            read(s, "pipeline", "binning", &mut p.binning)?;
            read(s, "pipeline", "sun_diameter_px", &mut p.sun_diameter_px)?;
            read(s, "pipeline", "reference_threshold", &mut p.reference_threshold)?;
            read(s, "pipeline", "interpolation_window", &mut p.interpolation_window)?;
            read(s, "pipeline", "interpolation_step", &mut p.interpolation_step)?;
            read(s, "pipeline", "snr_outer", &mut p.snr_outer)?;
            read(s, "pipeline", "snr_inner", &mut p.snr_inner)?;
            read(s, "pipeline", "correlation_workers", &mut p.correlation_workers)?;
            read_path(s, "debug_dir", &mut p.debug_dir);
        }

        if let Some(s) = ini.section(Some("guidance")) {
            let g = &mut c.guidance;
            read(s, "guidance", "gain_row_ms_per_px", &mut g.gain_row_ms_per_px)?;
            read(s, "guidance", "gain_col_ms_per_px", &mut g.gain_col_ms_per_px)?;
            read(s, "guidance", "invert_rows", &mut g.invert_rows)?;
            read(s, "guidance", "invert_cols", &mut g.invert_cols)?;
            read(s, "guidance", "noise_threshold", &mut g.noise_threshold)?;
            let mut minutes = g.noise_sustain.as_secs_f64() / 60.0;
            read(s, "guidance", "noise_sustain_min", &mut minutes)?;
            g.noise_sustain = Duration::try_from_secs_f64(minutes * 60.0).map_err(|e| {
                GuideError::InvalidConfig(format!("guidance.noise_sustain_min: {e}"))
            })?;
            read(s, "guidance", "max_pulse_ms", &mut g.max_pulse_ms)?;
            read(s, "guidance", "nudge_slow_px", &mut g.nudge_slow_px)?;
            read(s, "guidance", "nudge_fast_px", &mut g.nudge_fast_px)?;
            read(s, "guidance", "positions_per_guidance", &mut g.positions_per_guidance)?;
            read(s, "guidance", "setpoint_tolerance_px", &mut g.setpoint_tolerance_px)?;
            read(s, "guidance", "divergence_cycles", &mut g.divergence_cycles)?;
            read(s, "guidance", "divergence_bound_px", &mut g.divergence_bound_px)?;
            read(s, "guidance", "stop_on_divergence", &mut g.stop_on_divergence)?;
        }

        if let Some(s) = ini.section(Some("pins")) {
            read(s, "pins", "north", &mut c.pins.north)?;
            read(s, "pins", "south", &mut c.pins.south)?;
            read(s, "pins", "east", &mut c.pins.east)?;
            read(s, "pins", "west", &mut c.pins.west)?;
        }

        if let Some(s) = ini.section(Some("link")) {
            let l = &mut c.link;
            read_path(s, "device", &mut l.device);
            read_path(s, "position_log", &mut l.position_log);
            read_millis(s, "link", "connection_check_ms", &mut l.connection_check_period)?;
            read_millis(s, "link", "guidance_period_ms", &mut l.guidance_period)?;
        }

        Ok(c)
    }

    pub fn to_ini(&self) -> Ini {
        let p = &self.pipeline;
        let g = &self.guidance;
        let l = &self.link;
        let mut ini = Ini::new();
        ini.with_section(Some("pipeline"))
            .set("binning", p.binning.to_string())
            .set("sun_diameter_px", p.sun_diameter_px.to_string())
            .set("reference_threshold", p.reference_threshold.to_string())
            .set("interpolation_window", p.interpolation_window.to_string())
            .set("interpolation_step", p.interpolation_step.to_string())
            .set("snr_outer", p.snr_outer.to_string())
            .set("snr_inner", p.snr_inner.to_string())
            .set("correlation_workers", p.correlation_workers.to_string())
            .set("debug_dir", path_value(&p.debug_dir));
        ini.with_section(Some("guidance"))
            .set("gain_row_ms_per_px", g.gain_row_ms_per_px.to_string())
            .set("gain_col_ms_per_px", g.gain_col_ms_per_px.to_string())
            .set("invert_rows", g.invert_rows.to_string())
            .set("invert_cols", g.invert_cols.to_string())
            .set("noise_threshold", g.noise_threshold.to_string())
            .set(
                "noise_sustain_min",
                (g.noise_sustain.as_secs_f64() / 60.0).to_string(),
            )
            .set("max_pulse_ms", g.max_pulse_ms.to_string())
            .set("nudge_slow_px", g.nudge_slow_px.to_string())
            .set("nudge_fast_px", g.nudge_fast_px.to_string())
            .set("positions_per_guidance", g.positions_per_guidance.to_string())
            .set("setpoint_tolerance_px", g.setpoint_tolerance_px.to_string())
            .set("divergence_cycles", g.divergence_cycles.to_string())
            .set("divergence_bound_px", g.divergence_bound_px.to_string())
            .set("stop_on_divergence", g.stop_on_divergence.to_string());
        ini.with_section(Some("pins"))
            .set("north", self.pins.north.to_string())
            .set("south", self.pins.south.to_string())
            .set("east", self.pins.east.to_string())
            .set("west", self.pins.west.to_string());
        ini.with_section(Some("link"))
            .set("device", path_value(&l.device))
            .set("position_log", path_value(&l.position_log))
            .set(
                "connection_check_ms",
                l.connection_check_period.as_millis().to_string(),
            )
            .set("guidance_period_ms", l.guidance_period.as_millis().to_string());
        ini
    }

    /// Rejects settings the guider cannot run with.
    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        let g = &self.guidance;
        let checks = [
            (p.binning == 0, "pipeline.binning must be at least 1"),
            (p.sun_diameter_px == 0, "pipeline.sun_diameter_px must be positive"),
            (
                !(0.0..=1.0).contains(&p.reference_threshold),
                "pipeline.reference_threshold must lie in [0, 1]",
            ),
            (p.interpolation_window == 0, "pipeline.interpolation_window must be positive"),
            (
                !(p.interpolation_step > 0.0),
                "pipeline.interpolation_step must be positive",
            ),
            (p.snr_inner >= p.snr_outer, "pipeline.snr_inner must be below snr_outer"),
            (p.correlation_workers == 0, "pipeline.correlation_workers must be at least 1"),
            (
                g.positions_per_guidance == 0,
                "guidance.positions_per_guidance must be at least 1",
            ),
            (g.divergence_cycles == 0, "guidance.divergence_cycles must be at least 1"),
            (
                g.gain_row_ms_per_px < 0.0 || g.gain_col_ms_per_px < 0.0,
                "guidance gains must not be negative",
            ),
            (
                g.setpoint_tolerance_px < 0.0,
                "guidance.setpoint_tolerance_px must not be negative",
            ),
            (
                self.link.connection_check_period.is_zero() || self.link.guidance_period.is_zero(),
                "link periods must be positive",
            ),
        ];
        match checks.into_iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(GuideError::InvalidConfig(message.to_string())),
            None => Ok(()),
        }
    }
}

fn read<T: FromStr>(props: &Properties, section: &str, key: &str, slot: &mut T) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Some(raw) = props.get(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| GuideError::InvalidConfig(format!("{section}.{key} = {raw:?}: {e}")))?;
    }
    Ok(())
}

fn read_millis(props: &Properties, section: &str, key: &str, slot: &mut Duration) -> Result<()> {
    let mut ms = slot.as_millis() as u64;
    read(props, section, key, &mut ms)?;
    *slot = Duration::from_millis(ms);
    Ok(())
}

/// Empty values clear the path.
fn read_path(props: &Properties, key: &str, slot: &mut Option<PathBuf>) {
    if let Some(raw) = props.get(key) {
        let raw = raw.trim();
        *slot = (!raw.is_empty()).then(|| PathBuf::from(raw));
    }
}

fn path_value(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}
