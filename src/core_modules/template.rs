// THEORY:
// The guider never looks for the Sun itself, only for its limb. A synthetic disc of
// the expected apparent diameter, passed through the same edge-enhancing filter as
// the live frames, becomes a thin bright ring: the "donut" that the correlation
// engine slides over each frame. The edges are shaped with a raised-cosine (Hanning)
// ramp instead of a hard step so the filtered ring is smooth and the correlation peak
// stays well-behaved for sub-pixel interpolation.

use crate::core_modules::pixel_grid::PixelGrid;
use crate::error::Result;
use std::f64::consts::PI;

/// Width in pixels of the smoothed rim of the solar disc.
const SOLAR_RIM_MARGIN: f64 = 2.5;

/// Geometry of a smoothed annulus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DonutShape {
    pub center_row: f64,
    pub center_col: f64,
    /// Radius of the hole. Zero together with `inner_margin == 0` draws a filled disc.
    pub inner_radius: f64,
    /// Width of the 0 -> 1 ramp outside `inner_radius`.
    pub inner_margin: f64,
    /// Radius where the 1 -> 0 ramp starts.
    pub outer_radius: f64,
    /// Width of the 1 -> 0 ramp outside `outer_radius`.
    pub outer_margin: f64,
}

/// Fills `grid` with zeros, then draws `shape` with values in [0, 1].
pub fn draw_donut(grid: &mut PixelGrid, shape: &DonutShape) {
    grid.fill(0.0);
    let ra = shape.inner_radius;
    let rb = shape.inner_radius + shape.inner_margin;
    let rc = shape.outer_radius;
    let rd = shape.outer_radius + shape.outer_margin;
    let (ra2, rb2, rc2, rd2) = (ra * ra, rb * rb, rc * rc, rd * rd);

    // Only the bounding square of the outer rim can be non-zero.
    let bound = |center: f64, limit: usize| {
        let lo = (center - rd).floor().max(0.0) as usize;
        let hi = ((center + rd).ceil().max(0.0) as usize + 1).min(limit);
        (lo.min(limit), hi)
    };
    let (row_lo, row_hi) = bound(shape.center_row, grid.rows());
    let (col_lo, col_hi) = bound(shape.center_col, grid.cols());

    for row in row_lo..row_hi {
        let dv = row as f64 - shape.center_row;
        for col in col_lo..col_hi {
            let dh = col as f64 - shape.center_col;
            let r2 = dh * dh + dv * dv;
            let value = if r2 < ra2 {
                0.0
            } else if r2 < rb2 {
                let dr = (r2.sqrt() - ra) / shape.inner_margin;
                0.5 * (1.0 - (PI * dr).cos())
            } else if r2 < rc2 {
                1.0
            } else if r2 < rd2 {
                let dr = (r2.sqrt() - rc) / shape.outer_margin;
                0.5 * (1.0 + (PI * dr).cos())
            } else {
                0.0
            };
            grid.set(row, col, value);
        }
    }
}

/// Immutable reference image the correlation engine matches frames against.
#[derive(Debug, Clone)]
pub struct ReferenceTemplate {
    grid: PixelGrid,
    /// Apparent solar diameter in pixels the template was drawn for.
    diameter: usize,
}

impl ReferenceTemplate {
    /// A normalized solar disc of `diameter` pixels with a smoothed rim, centred in a
    /// square of side `diameter + 4 * 2.5`.
    pub fn solar_disc(diameter: usize) -> Result<Self> {
        let side = (diameter as f64 + 4.0 * SOLAR_RIM_MARGIN) as usize;
        let mut grid = PixelGrid::new(side, side);
        let center = (side / 2) as f64;
        draw_donut(
            &mut grid,
            &DonutShape {
                center_row: center,
                center_col: center,
                inner_radius: 0.0,
                inner_margin: 0.0,
                outer_radius: (diameter / 2) as f64 - SOLAR_RIM_MARGIN / 2.0,
                outer_margin: SOLAR_RIM_MARGIN,
            },
        );
        grid.normalize()?;
        Ok(Self { grid, diameter })
    }

    /// A normalized annulus drawn in a `rows x cols` grid.
    pub fn donut(rows: usize, cols: usize, shape: &DonutShape) -> Result<Self> {
        let mut grid = PixelGrid::new(rows, cols);
        draw_donut(&mut grid, shape);
        grid.normalize()?;
        let diameter = (2.0 * (shape.outer_radius + shape.outer_margin)) as usize;
        Ok(Self { grid, diameter })
    }

    /// Wraps an existing grid, e.g. one already filtered.
    pub fn from_grid(grid: PixelGrid, diameter: usize) -> Self {
        Self { grid, diameter }
    }

    pub fn grid(&self) -> &PixelGrid {
        &self.grid
    }

    pub fn diameter(&self) -> usize {
        self.diameter
    }
}
