// THEORY:
// `PixelGrid` is the single image representation used by the whole guider. A frame,
// the reference template and the correlation map are all dense row-major grids of
// `f64` intensities addressed as (row, col) from the top-left corner.
//
// Key architectural principles:
// 1.  **Fixed shape, owned storage**: dimensions are set at construction and never
//     change. Operations that change shape (`reduce`, region copies) return a new grid.
// 2.  **Lazy extrema**: min/max and their positions are needed repeatedly (normalization,
//     peak finding) but only once per mutation. They are computed on first query and
//     cached. The backing buffer is private, so every write goes through a `&mut self`
//     method that drops the cache; a stale cache cannot be observed.
// 3.  **Valid-region filtering**: convolution only writes where the whole kernel fits.
//     The border keeps its zero fill, and negative responses are clamped to zero so an
//     edge-enhancing kernel keeps only the bright side of each edge.

use crate::error::{GuideError, Result};
use std::sync::OnceLock;

/// Position and value of the darkest and brightest pixels of a grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extrema {
    pub min: f64,
    /// (row, col) of the first minimum in row-major order.
    pub min_at: (usize, usize),
    pub max: f64,
    /// (row, col) of the first maximum in row-major order.
    pub max_at: (usize, usize),
}

/// A square convolution kernel stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    size: usize,
    weights: Vec<f64>,
}

impl Kernel {
    /// Builds a kernel from `size * size` row-major weights.
    pub fn new(size: usize, weights: Vec<f64>) -> Result<Self> {
        if size == 0 || weights.len() != size * size {
            return Err(GuideError::InvalidConfig(format!(
                "kernel of size {size} needs {} weights, got {}",
                size * size,
                weights.len()
            )));
        }
        Ok(Self { size, weights })
    }

    /// 3x3 four-neighbour Laplacian: bright where intensity curves downwards.
    pub fn laplacian() -> Self {
        Self {
            size: 3,
            #[rustfmt::skip]
            weights: vec![
                 0.0, -1.0,  0.0,
                -1.0,  4.0, -1.0,
                 0.0, -1.0,  0.0,
            ],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn weight(&self, row: usize, col: usize) -> f64 {
        self.weights[row * self.size + col]
    }
}

/// Dense 2-D intensity buffer with lazily cached extrema.
#[derive(Debug, Clone)]
pub struct PixelGrid {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
    /// `None` inside the cell means the grid has no pixels.
    extrema: OnceLock<Option<Extrema>>,
}

impl PixelGrid {
    /// A `rows x cols` grid filled with zeros.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
            extrema: OnceLock::new(),
        }
    }

    /// Wraps row-major `data`; its length must be `rows * cols`.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(GuideError::InvalidConfig(format!(
                "grid of {rows}x{cols} needs {} values, got {}",
                rows * cols,
                data.len()
            )));
        }
        Ok(Self {
            rows,
            cols,
            data,
            extrema: OnceLock::new(),
        })
    }

    /// Builds a grid from nested rows. All rows must have the same length.
    pub fn from_rows<R: AsRef<[f64]>>(rows: &[R]) -> Result<Self> {
        let cols = rows.first().map_or(0, |r| r.as_ref().len());
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            let row = row.as_ref();
            if row.len() != cols {
                return Err(GuideError::InvalidConfig("ragged rows".into()));
            }
            data.extend_from_slice(row);
        }
        Self::from_vec(rows.len(), cols, data)
    }

    /// Copies the `rows x cols` rectangle whose top-left corner sits at
    /// (`row0`, `col0`) in `source`. Parts of the rectangle falling outside the
    /// source are clamped away and stay zero in the copy.
    pub fn from_region(
        source: &PixelGrid,
        row0: isize,
        col0: isize,
        rows: usize,
        cols: usize,
    ) -> Self {
        let mut out = Self::new(rows, cols);
        let row_start = row0.max(0);
        let col_start = col0.max(0);
        let row_end = (row0 + rows as isize).min(source.rows as isize);
        let col_end = (col0 + cols as isize).min(source.cols as isize);
        if row_start >= row_end || col_start >= col_end {
            return out;
        }
        let width = (col_end - col_start) as usize;
        for src_row in row_start..row_end {
            let dst_row = (src_row - row0) as usize;
            let dst_col = (col_start - col0) as usize;
            let src = &source.row(src_row as usize)[col_start as usize..col_start as usize + width];
            let start = dst_row * cols + dst_col;
            out.data[start..start + width].copy_from_slice(src);
        }
        out
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// (rows, cols)
    pub fn dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.invalidate();
        self.data[row * self.cols + col] = value;
    }

    /// Read-only view of one row.
    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// Read-only row-major view of every pixel.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Mutable row-major view. Drops the extrema cache up front.
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        self.invalidate();
        &mut self.data
    }

    pub fn fill(&mut self, value: f64) {
        self.invalidate();
        self.data.fill(value);
    }

    fn invalidate(&mut self) {
        self.extrema.take();
    }

    /// Cached extrema, or `None` for an empty grid.
    pub fn extrema(&self) -> Option<Extrema> {
        *self.extrema.get_or_init(|| self.scan_extrema())
    }

    fn scan_extrema(&self) -> Option<Extrema> {
        let first = *self.data.first()?;
        let mut found = Extrema {
            min: first,
            min_at: (0, 0),
            max: first,
            max_at: (0, 0),
        };
        for (i, &value) in self.data.iter().enumerate() {
            if value < found.min {
                found.min = value;
                found.min_at = (i / self.cols, i % self.cols);
            }
            if value > found.max {
                found.max = value;
                found.max_at = (i / self.cols, i % self.cols);
            }
        }
        Some(found)
    }

    /// Block-averages `factor x factor` squares. Remainder rows and columns are dropped.
    ///
    /// # Panics
    /// Panics if `factor` is zero.
    pub fn reduce(&self, factor: usize) -> PixelGrid {
        assert!(factor > 0, "binning factor must be at least 1");
        let rows = self.rows / factor;
        let cols = self.cols / factor;
        let area = (factor * factor) as f64;
        let mut out = PixelGrid::new(rows, cols);
        for dst_row in 0..rows {
            for dst_col in 0..cols {
                let mut sum = 0.0;
                for src_row in dst_row * factor..(dst_row + 1) * factor {
                    let start = src_row * self.cols + dst_col * factor;
                    sum += self.data[start..start + factor].iter().sum::<f64>();
                }
                out.data[dst_row * cols + dst_col] = sum / area;
            }
        }
        out
    }

    /// Valid-region convolution. The output keeps the input shape; a border of
    /// width `kernel.size() / 2` stays zero and negative responses clamp to zero.
    pub fn convolve(&self, kernel: &Kernel) -> PixelGrid {
        let k = kernel.size();
        let half = k / 2;
        let mut out = PixelGrid::new(self.rows, self.cols);
        if self.rows < k || self.cols < k {
            return out;
        }
        for row in 0..=self.rows - k {
            for col in 0..=self.cols - k {
                let mut sum = 0.0;
                for kr in 0..k {
                    let src = &self.row(row + kr)[col..col + k];
                    for (kc, &value) in src.iter().enumerate() {
                        sum += value * kernel.weight(kr, kc);
                    }
                }
                out.data[(row + half) * self.cols + col + half] = sum.max(0.0);
            }
        }
        out
    }

    /// Linearly rescales intensities so the current extrema map to `[low, high]`.
    pub fn normalize_to(&mut self, low: f64, high: f64) -> Result<()> {
        let Extrema { min, max, .. } = self.extrema().ok_or(GuideError::DegenerateRange)?;
        if max == min {
            return Err(GuideError::DegenerateRange);
        }
        let scale = (high - low) / (max - min);
        for value in self.as_mut_slice() {
            *value = (*value - min) * scale + low;
        }
        Ok(())
    }

    /// Rescales to `[0, MAX_INTENSITY]`.
    pub fn normalize(&mut self) -> Result<()> {
        self.normalize_to(0.0, crate::core_modules::correlation::MAX_INTENSITY)
    }
}
