// THEORY:
// The correlation map only knows whole-pixel shifts, but a guider that corrects by
// whole binned pixels oscillates. The locator refines the grid-aligned maximum by
// evaluating a 2-D Neville–Aitken polynomial (4 samples per axis, i.e. a local
// bicubic through the nearest samples) on a fine lattice around it and taking the
// best lattice point.
//
// It also scores how much the peak stands out. The score is the peak intensity over
// the mean of a square annulus around it (outer square minus inner square), so a
// sharp limb match on a quiet map scores high while a washed-out map, such as one
// produced by clouds, scores close to one. The guidance state machine compares this
// score against its noise threshold.

use crate::core_modules::correlation::CorrelationMap;
use crate::core_modules::pixel_grid::PixelGrid;

/// Number of samples per axis in the interpolation stencil.
const STENCIL: usize = 4;

/// A located limb position in correlation-map coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub row: f64,
    pub col: f64,
    /// Peak-to-background ratio; `None` when the background could not be measured.
    pub confidence: Option<f64>,
}

/// Sub-pixel peak refinement settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SubpixelLocator {
    /// Side in pixels of the square interpolated around the grid peak.
    pub window: usize,
    /// Lattice step of the interpolation, in pixels.
    pub step: f64,
    /// Side of the outer square of the background annulus.
    pub snr_outer: usize,
    /// Side of the inner square excluded from the background annulus.
    pub snr_inner: usize,
}

impl Default for SubpixelLocator {
    fn default() -> Self {
        Self {
            window: 20,
            step: 1.0 / 8.0,
            snr_outer: 100,
            snr_inner: 50,
        }
    }
}

impl SubpixelLocator {
    /// `locate_peak(map) -> (row, col, confidence)`.
    pub fn locate_peak(&self, map: &CorrelationMap) -> Option<Position> {
        self.locate(&map.grid)
    }

    /// Refined maximum of `grid`, or `None` for an empty grid.
    pub fn locate(&self, grid: &PixelGrid) -> Option<Position> {
        let (peak_row, peak_col) = grid.extrema()?.max_at;
        let half = self.window as f64 / 2.0;
        let samples = (self.window as f64 / self.step).round() as usize;
        let last_row = grid.rows() as f64 - 1.0;
        let last_col = grid.cols() as f64 - 1.0;

        let mut best: Option<(f64, usize, usize)> = None;
        for i in 0..samples {
            let y = peak_row as f64 - half + i as f64 * self.step;
            if y < 0.0 || y > last_row {
                continue;
            }
            for j in 0..samples {
                let x = peak_col as f64 - half + j as f64 * self.step;
                if x < 0.0 || x > last_col {
                    continue;
                }
                let value = interpolate(grid, y, x);
                if best.is_none_or(|(top, _, _)| value > top) {
                    best = Some((value, i, j));
                }
            }
        }

        let (row, col) = match best {
            Some((_, i, j)) => (
                peak_row as f64 - half + i as f64 * self.step,
                peak_col as f64 - half + j as f64 * self.step,
            ),
            None => (peak_row as f64, peak_col as f64),
        };
        Some(Position {
            row,
            col,
            confidence: self.signal_to_noise(grid, peak_row, peak_col),
        })
    }

    /// Peak intensity over the mean of the annulus between the outer and inner squares
    /// centred on (row, col), clipped to the grid.
    pub fn signal_to_noise(&self, grid: &PixelGrid, row: usize, col: usize) -> Option<f64> {
        let (r, c) = (row as isize, col as isize);
        let outer = (self.snr_outer / 2) as isize;
        let inner = (self.snr_inner / 2) as isize;
        let row_lo = (r - outer).max(0);
        let row_hi = (r + outer).min(grid.rows() as isize);
        let col_lo = (c - outer).max(0);
        let col_hi = (c + outer).min(grid.cols() as isize);

        let mut sum = 0.0;
        let mut count = 0usize;
        for l in row_lo..row_hi {
            let inside_rows = l > r - inner && l < r + inner;
            for k in col_lo..col_hi {
                if inside_rows && k > c - inner && k < c + inner {
                    continue;
                }
                sum += grid.get(l as usize, k as usize);
                count += 1;
            }
        }
        if count == 0 {
            return None;
        }
        let mean = sum / count as f64;
        (mean > 0.0).then(|| grid.get(row, col) / mean)
    }
}

/// First sample index and sample count of the stencil around `t` on an axis of `len`.
fn stencil(t: f64, len: usize) -> (usize, usize) {
    let n = len.min(STENCIL);
    let start = (t.floor() as isize - 1).clamp(0, (len - n) as isize) as usize;
    (start, n)
}

/// Neville–Aitken evaluation at `t` of the polynomial through (start + k, ys[k]).
fn neville(start: usize, ys: &[f64], t: f64) -> f64 {
    let n = ys.len();
    let mut p = [0.0; STENCIL];
    p[..n].copy_from_slice(ys);
    for m in 1..n {
        for i in 0..n - m {
            let xi = (start + i) as f64;
            let xim = (start + i + m) as f64;
            p[i] = ((t - xim) * p[i] + (xi - t) * p[i + 1]) / (xi - xim);
        }
    }
    p[0]
}

/// 2-D interpolation at (y, x): along columns for each stencil row, then along rows.
fn interpolate(grid: &PixelGrid, y: f64, x: f64) -> f64 {
    let (row0, rows) = stencil(y, grid.rows());
    let (col0, cols) = stencil(x, grid.cols());
    let mut along_cols = [0.0; STENCIL];
    for (k, value) in along_cols.iter_mut().take(rows).enumerate() {
        *value = neville(col0, &grid.row(row0 + k)[col0..col0 + cols], x);
    }
    neville(row0, &along_cols[..rows], y)
}
