// THEORY:
// The correlation engine answers one question per frame: at which relative shift
// does the reference ring best overlay the limb in the frame? It computes the full
// cross-correlation, so the map has one cell for every shift that leaves the two
// grids at least partially overlapping: (rows_obj + rows_ref - 1) x
// (cols_obj + cols_ref - 1). Map cell (r, c) places the reference's top-left pixel
// at object pixel (r - (rows_ref - 1), c - (cols_ref - 1)).
//
// Key architectural principles:
// 1.  **Reference sparsity**: after filtering, the reference is a thin ring. Only its
//     pixels above `threshold_fraction * MAX_INTENSITY` are extracted (once) into a
//     `ReferencePoints` list, and the loop runs "for each useful reference pixel, for
//     each valid shift" so cost scales with the ring, not with the template area.
// 2.  **One algorithm, two walks**: `accumulate_indexed` is the plain double-indexed
//     definition; `accumulate_strided` walks contiguous row slices. Both add the same
//     products to each cell in the same order (reference pixel order), so they are
//     bit-identical. The strided walk also accepts a band of map rows, which is what
//     the parallel correlator hands to each worker.
// 3.  **Brightness independence**: frames and reference go through the same
//     preprocessing (optional binning, then a Laplacian), so absolute exposure and
//     slow illumination gradients cancel out before matching.

use crate::core_modules::pixel_grid::{Kernel, PixelGrid};
use crate::error::{GuideError, Result};
use tracing::trace;

/// Upper bound of the normalized intensity range (full 16-bit scale).
pub const MAX_INTENSITY: f64 = 65535.0;

/// A single above-threshold reference pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefPoint {
    pub row: usize,
    pub col: usize,
    pub value: f64,
}

/// The sparse part of a normalized reference that actually drives the correlation.
#[derive(Debug, Clone)]
pub struct ReferencePoints {
    /// Rows of the full reference grid.
    pub rows: usize,
    /// Columns of the full reference grid.
    pub cols: usize,
    /// Above-threshold pixels in row-major order.
    pub points: Vec<RefPoint>,
}

impl ReferencePoints {
    /// Normalizes a working copy of `reference` to `[0, MAX_INTENSITY]` and keeps
    /// every pixel strictly above `threshold_fraction * MAX_INTENSITY`.
    pub fn extract(reference: &PixelGrid, threshold_fraction: f64) -> Result<Self> {
        let mut working = reference.clone();
        working.normalize()?;
        let threshold = threshold_fraction * MAX_INTENSITY;
        let cols = working.cols();
        let points = working
            .as_slice()
            .iter()
            .enumerate()
            .filter(|&(_, &value)| value > threshold)
            .map(|(i, &value)| RefPoint {
                row: i / cols,
                col: i % cols,
                value,
            })
            .collect();
        Ok(Self {
            rows: working.rows(),
            cols,
            points,
        })
    }

    /// Dimensions of the full correlation map against an object of `object_dims`.
    pub fn map_dims(&self, object_dims: (usize, usize)) -> (usize, usize) {
        (
            object_dims.0 + self.rows - 1,
            object_dims.1 + self.cols - 1,
        )
    }
}

/// A normalized correlation map plus the geometry needed to read it back.
#[derive(Debug, Clone)]
pub struct CorrelationMap {
    pub grid: PixelGrid,
    /// (rows, cols) of the object the map was computed on.
    pub object_dims: (usize, usize),
    /// (rows, cols) of the reference.
    pub reference_dims: (usize, usize),
}

impl CorrelationMap {
    /// Object coordinates of the reference's top-left pixel for map cell (row, col).
    pub fn to_object(&self, row: f64, col: f64) -> (f64, f64) {
        (
            row - (self.reference_dims.0 as f64 - 1.0),
            col - (self.reference_dims.1 as f64 - 1.0),
        )
    }

    /// Object coordinates of the reference's centre for map cell (row, col).
    pub fn template_center(&self, row: f64, col: f64) -> (f64, f64) {
        (
            row - (self.reference_dims.0 as f64 - 1.0) / 2.0,
            col - (self.reference_dims.1 as f64 - 1.0) / 2.0,
        )
    }
}

/// Plain definition: every (reference pixel, shift) pair addressed by index.
pub fn accumulate_indexed(refs: &ReferencePoints, object: &PixelGrid, map: &mut PixelGrid) {
    let (obj_rows, obj_cols) = (object.rows() as isize, object.cols() as isize);
    let (ref_rows, ref_cols) = (refs.rows as isize, refs.cols as isize);
    for point in &refs.points {
        let (lr, cr) = (point.row as isize, point.col as isize);
        for shift_row in -ref_rows..obj_rows {
            for shift_col in -ref_cols..obj_cols {
                let obj_row = lr + shift_row;
                let obj_col = cr + shift_col;
                if obj_row < 0 || obj_row >= obj_rows || obj_col < 0 || obj_col >= obj_cols {
                    continue;
                }
                let map_row = (shift_row + ref_rows - 1) as usize;
                let map_col = (shift_col + ref_cols - 1) as usize;
                let acc = map.get(map_row, map_col)
                    + point.value * object.get(obj_row as usize, obj_col as usize);
                map.set(map_row, map_col, acc);
            }
        }
    }
}

/// Slice-walking accumulation into map rows `band_start..band_start + band.len() / map_cols`.
///
/// For reference pixel (lr, cr), map cell (r, c) reads object pixel
/// (lr + r - (ref_rows - 1), cr + c - (ref_cols - 1)); the valid shifts are the map
/// rows and columns keeping that pixel inside the object.
pub(crate) fn accumulate_strided(
    refs: &ReferencePoints,
    object: &PixelGrid,
    band_start: usize,
    band: &mut [f64],
) {
    let (map_rows, map_cols) = refs.map_dims(object.dims());
    if map_cols == 0 {
        return;
    }
    let band_end = (band_start + band.len() / map_cols).min(map_rows);
    let (ref_rows, ref_cols) = (refs.rows, refs.cols);

    for point in &refs.points {
        let row_lo = (ref_rows - 1).saturating_sub(point.row).max(band_start);
        let row_hi = (object.rows() + ref_rows - 1 - point.row).min(band_end);
        let col_lo = (ref_cols - 1).saturating_sub(point.col);
        let col_hi = (object.cols() + ref_cols - 1 - point.col).min(map_cols);
        if row_lo >= row_hi || col_lo >= col_hi {
            continue;
        }
        let width = col_hi - col_lo;
        let obj_col = point.col + col_lo - (ref_cols - 1);

        for map_row in row_lo..row_hi {
            let obj_row = point.row + map_row - (ref_rows - 1);
            let src = &object.row(obj_row)[obj_col..obj_col + width];
            let start = (map_row - band_start) * map_cols + col_lo;
            let dst = &mut band[start..start + width];
            for (acc, &value) in dst.iter_mut().zip(src) {
                *acc += point.value * value;
            }
        }
    }
}

/// Full cross-correlation of `object` against the above-threshold pixels of `refs`,
/// normalized to `[0, MAX_INTENSITY]`.
pub fn correlate_points(refs: &ReferencePoints, object: &PixelGrid) -> Result<CorrelationMap> {
    let (map_rows, map_cols) = refs.map_dims(object.dims());
    let mut grid = PixelGrid::new(map_rows, map_cols);
    accumulate_strided(refs, object, 0, grid.as_mut_slice());
    trace!(
        points = refs.points.len(),
        map_rows, map_cols, "correlation accumulated"
    );
    grid.normalize()?;
    Ok(CorrelationMap {
        grid,
        object_dims: object.dims(),
        reference_dims: (refs.rows, refs.cols),
    })
}

/// `correlate(object, reference, threshold_fraction)`: full thresholded cross-correlation.
pub fn correlate(
    object: &PixelGrid,
    reference: &PixelGrid,
    threshold_fraction: f64,
) -> Result<CorrelationMap> {
    if object.is_empty() || reference.is_empty() {
        return Err(GuideError::DegenerateRange);
    }
    let refs = ReferencePoints::extract(reference, threshold_fraction)?;
    correlate_points(&refs, object)
}

/// Frame preprocessing and correlation settings.
#[derive(Debug, Clone)]
pub struct CorrelationEngine {
    /// Software binning factor applied to frames (1 disables it).
    pub binning: usize,
    /// Fraction of full scale a reference pixel must exceed to take part.
    pub threshold_fraction: f64,
    /// Edge-enhancing kernel applied to frames and reference alike.
    pub kernel: Kernel,
}

impl CorrelationEngine {
    pub fn new(binning: usize, threshold_fraction: f64) -> Self {
        Self {
            binning: binning.max(1),
            threshold_fraction,
            kernel: Kernel::laplacian(),
        }
    }

    /// Binning then edge enhancement.
    pub fn preprocess(&self, frame: &PixelGrid) -> PixelGrid {
        let binned;
        let source = if self.binning > 1 {
            binned = frame.reduce(self.binning);
            &binned
        } else {
            frame
        };
        source.convolve(&self.kernel)
    }

    /// Edge enhancement of the reference template (it is already drawn at binned scale).
    pub fn prepare_reference(&self, template: &PixelGrid) -> Result<ReferencePoints> {
        let filtered = template.convolve(&self.kernel);
        ReferencePoints::extract(&filtered, self.threshold_fraction)
    }

    pub fn correlate(&self, object: &PixelGrid, reference: &ReferencePoints) -> Result<CorrelationMap> {
        correlate_points(reference, object)
    }
}
