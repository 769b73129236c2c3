// THEORY:
// The `pipeline` module is the top-level API of the image side of the guider. It
// hides the individual stages behind one call: a raw frame goes in and a located
// limb position comes out.
//
//   frame -> bin -> Laplacian -> correlate with the limb ring -> sub-pixel peak
//
// The reference ring is built once, from the expected solar diameter, and shared by
// every frame. `SolarPipeline` is cheap to clone (the heavy state sits behind an
// `Arc`), so the async loop can move a handle into blocking workers without copying
// the template.

use crate::core_modules::correlation::{CorrelationEngine, CorrelationMap, ReferencePoints};
use crate::core_modules::image_io::save_tiff;
use crate::core_modules::pixel_grid::PixelGrid;
use crate::core_modules::subpixel::{Position, SubpixelLocator};
use crate::core_modules::template::ReferenceTemplate;
use crate::error::{GuideError, Result};
use crate::parallel_correlation::correlate_banded;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Configuration for the image side of the guider.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Software binning applied to every frame before filtering.
    pub binning: usize,
    /// Apparent solar diameter in binned pixels.
    pub sun_diameter_px: usize,
    /// Fraction of full scale a filtered reference pixel must exceed to be correlated.
    pub reference_threshold: f64,
    pub interpolation_window: usize,
    pub interpolation_step: f64,
    pub snr_outer: usize,
    pub snr_inner: usize,
    /// Row bands correlated concurrently by the async path.
    pub correlation_workers: usize,
    /// When set, each frame's intermediate grids are written here as TIFF.
    pub debug_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let locator = SubpixelLocator::default();
        Self {
            binning: 2,
            sun_diameter_px: 238,
            reference_threshold: 0.70,
            interpolation_window: locator.window,
            interpolation_step: locator.step,
            snr_outer: locator.snr_outer,
            snr_inner: locator.snr_inner,
            correlation_workers: num_cpus::get(),
            debug_dir: None,
        }
    }
}

/// Result of processing one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    /// Sub-pixel peak in correlation-map coordinates.
    pub position: Position,
    /// Grid-aligned peak cell.
    pub peak: (usize, usize),
    pub map_dims: (usize, usize),
    pub reference_dims: (usize, usize),
    pub binning: usize,
    pub elapsed: Duration,
}

impl FrameReport {
    /// Converts a map-coordinate point to the sun centre in unbinned frame pixels.
    /// Binned pixel `x` covers unbinned pixels `b*x .. b*x + b - 1`.
    pub fn frame_point(&self, row: f64, col: f64) -> (f64, f64) {
        let (ref_rows, ref_cols) = self.reference_dims;
        let b = self.binning as f64;
        let unbin = |x: f64| x * b + (b - 1.0) / 2.0;
        (
            unbin(row - (ref_rows as f64 - 1.0) + (ref_rows / 2) as f64),
            unbin(col - (ref_cols as f64 - 1.0) + (ref_cols / 2) as f64),
        )
    }
}

struct PipelineInner {
    config: PipelineConfig,
    engine: CorrelationEngine,
    locator: SubpixelLocator,
    template: ReferenceTemplate,
    reference: Arc<ReferencePoints>,
}

/// Frame-to-position pipeline. Clones share the same template.
#[derive(Clone)]
pub struct SolarPipeline {
    inner: Arc<PipelineInner>,
}

impl SolarPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let template = ReferenceTemplate::solar_disc(config.sun_diameter_px)?;
        Self::with_template(config, template)
    }

    /// Uses an explicit template instead of drawing a solar disc.
    pub fn with_template(config: PipelineConfig, template: ReferenceTemplate) -> Result<Self> {
        let engine = CorrelationEngine::new(config.binning, config.reference_threshold);
        let reference = engine.prepare_reference(template.grid())?;
        if reference.points.is_empty() {
            return Err(GuideError::InvalidConfig(format!(
                "no reference pixel above {:.2} of full scale",
                config.reference_threshold
            )));
        }
        debug!(
            points = reference.points.len(),
            rows = reference.rows,
            cols = reference.cols,
            "reference ring prepared"
        );
        let locator = SubpixelLocator {
            window: config.interpolation_window,
            step: config.interpolation_step,
            snr_outer: config.snr_outer,
            snr_inner: config.snr_inner,
        };
        Ok(Self {
            inner: Arc::new(PipelineInner {
                config,
                engine,
                locator,
                template,
                reference: Arc::new(reference),
            }),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn template(&self) -> &ReferenceTemplate {
        &self.inner.template
    }

    pub fn reference(&self) -> &ReferencePoints {
        &self.inner.reference
    }

    /// Processes one frame on the calling thread.
    pub fn process_frame(&self, frame: &PixelGrid) -> Result<FrameReport> {
        let started = Instant::now();
        let (binned, filtered) = self.preprocess(frame);
        let map = self.inner.engine.correlate(&filtered, &self.inner.reference)?;
        self.finish(binned.as_ref(), &filtered, map, started)
    }

    /// Processes one frame with preprocessing on the blocking pool and the
    /// correlation split into row bands. Results match `process_frame` exactly.
    pub async fn process_frame_async(&self, frame: PixelGrid) -> Result<FrameReport> {
        let started = Instant::now();
        let this = self.clone();
        let (binned, filtered) = tokio::task::spawn_blocking(move || this.preprocess(&frame))
            .await
            .map_err(|e| GuideError::Worker(e.to_string()))?;

        let filtered = Arc::new(filtered);
        let map = correlate_banded(
            Arc::clone(&self.inner.reference),
            Arc::clone(&filtered),
            self.inner.config.correlation_workers,
        )
        .await?;

        let this = self.clone();
        tokio::task::spawn_blocking(move || this.finish(binned.as_ref(), &filtered, map, started))
            .await
            .map_err(|e| GuideError::Worker(e.to_string()))?
    }

    /// Binned frame (when binning is on) and its filtered version.
    fn preprocess(&self, frame: &PixelGrid) -> (Option<PixelGrid>, PixelGrid) {
        let engine = &self.inner.engine;
        if engine.binning > 1 {
            let binned = frame.reduce(engine.binning);
            let filtered = binned.convolve(&engine.kernel);
            (Some(binned), filtered)
        } else {
            (None, frame.convolve(&engine.kernel))
        }
    }

    fn finish(
        &self,
        binned: Option<&PixelGrid>,
        filtered: &PixelGrid,
        map: CorrelationMap,
        started: Instant,
    ) -> Result<FrameReport> {
        let position = self
            .inner
            .locator
            .locate_peak(&map)
            .ok_or(GuideError::DegenerateRange)?;
        let peak = map.grid.extrema().ok_or(GuideError::DegenerateRange)?.max_at;

        if let Some(dir) = &self.inner.config.debug_dir {
            dump_stages(dir, binned, filtered, &map.grid);
        }

        let report = FrameReport {
            position,
            peak,
            map_dims: map.grid.dims(),
            reference_dims: map.reference_dims,
            binning: self.inner.engine.binning,
            elapsed: started.elapsed(),
        };
        debug!(
            row = report.position.row,
            col = report.position.col,
            confidence = ?report.position.confidence,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "frame located"
        );
        Ok(report)
    }
}

/// Best-effort debug dump; failures are logged and ignored.
fn dump_stages(dir: &Path, binned: Option<&PixelGrid>, filtered: &PixelGrid, map: &PixelGrid) {
    let mut filtered = filtered.clone();
    if filtered.normalize().is_err() {
        filtered.fill(0.0);
    }
    let stages = [
        ("binned.tif", binned),
        ("laplacian.tif", Some(&filtered)),
        ("correlation.tif", Some(map)),
    ];
    for (name, grid) in stages {
        if let Some(grid) = grid {
            if let Err(e) = save_tiff(grid, &dir.join(name)) {
                warn!("debug dump skipped: {e}");
            }
        }
    }
}
