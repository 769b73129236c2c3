// THEORY:
// Frames arrive as single-sample grayscale images of 8 or 16 bits per sample. That is
// the whole contract: colour sources and deeper samples are refused outright rather
// than converted, because a silent RGB-to-luma conversion would change what the
// correlation sees from one camera to the next.
//
// Decoding and encoding go through the `image` crate. Debug dumps are written as
// 16-bit grayscale TIFF (one sample per pixel, top-left origin, min-is-black), with
// values clamped into the u16 range.

use crate::core_modules::pixel_grid::PixelGrid;
use crate::error::{GuideError, Result};
use image::{DynamicImage, ImageBuffer, ImageFormat, ImageReader, Luma};
use std::path::Path;

/// Raw samples of one frame, before conversion to a `PixelGrid`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub rows: usize,
    pub cols: usize,
    pub bits_per_sample: u16,
    pub samples_per_pixel: u16,
    /// Row-major samples widened to u16.
    pub data: Vec<u16>,
}

impl RawFrame {
    /// Checks the sample layout and the buffer length.
    pub fn validate(&self) -> Result<()> {
        let layout_ok = self.samples_per_pixel == 1 && matches!(self.bits_per_sample, 8 | 16);
        if !layout_ok {
            return Err(GuideError::Format {
                bits_per_sample: self.bits_per_sample,
                samples_per_pixel: self.samples_per_pixel,
            });
        }
        if self.data.len() != self.rows * self.cols {
            return Err(GuideError::InvalidConfig(format!(
                "frame of {}x{} carries {} samples",
                self.rows,
                self.cols,
                self.data.len()
            )));
        }
        Ok(())
    }

    pub fn into_grid(self) -> Result<PixelGrid> {
        self.validate()?;
        let data = self.data.into_iter().map(f64::from).collect();
        PixelGrid::from_vec(self.rows, self.cols, data)
    }
}

/// Decodes `path` into a `RawFrame`.
pub fn read_frame(path: &Path) -> Result<RawFrame> {
    let image = ImageReader::open(path)
        .map_err(|e| GuideError::opening(path, e))?
        .with_guessed_format()
        .map_err(|e| GuideError::opening(path, e))?
        .decode()
        .map_err(|e| GuideError::opening(path, e))?;

    let (rows, cols) = (image.height() as usize, image.width() as usize);
    match image {
        DynamicImage::ImageLuma8(buf) => Ok(RawFrame {
            rows,
            cols,
            bits_per_sample: 8,
            samples_per_pixel: 1,
            data: buf.into_raw().into_iter().map(u16::from).collect(),
        }),
        DynamicImage::ImageLuma16(buf) => Ok(RawFrame {
            rows,
            cols,
            bits_per_sample: 16,
            samples_per_pixel: 1,
            data: buf.into_raw(),
        }),
        other => {
            let color = other.color();
            let samples = u16::from(color.channel_count());
            Err(GuideError::Format {
                bits_per_sample: color.bits_per_pixel() / samples.max(1),
                samples_per_pixel: samples,
            })
        }
    }
}

/// Decodes `path` straight into a grid.
pub fn load_frame(path: &Path) -> Result<PixelGrid> {
    read_frame(path)?.into_grid()
}

/// Writes `grid` as a 16-bit grayscale TIFF.
pub fn save_tiff(grid: &PixelGrid, path: &Path) -> Result<()> {
    let samples: Vec<u16> = grid
        .as_slice()
        .iter()
        .map(|v| v.round().clamp(0.0, f64::from(u16::MAX)) as u16)
        .collect();
    let buffer: ImageBuffer<Luma<u16>, Vec<u16>> =
        ImageBuffer::from_raw(grid.cols() as u32, grid.rows() as u32, samples).ok_or_else(
            || GuideError::InvalidConfig(format!("cannot encode a {}x{} grid", grid.rows(), grid.cols())),
        )?;
    buffer
        .save_with_format(path, ImageFormat::Tiff)
        .map_err(|e| GuideError::opening(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Rgb, RgbImage};

    #[test]
    fn tiff_round_trip_keeps_samples() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("frame.tif");
        let grid = PixelGrid::from_rows(&[[0.0, 1.4, 65535.0], [70000.0, -3.0, 300.6]]).unwrap();
        save_tiff(&grid, &path).expect("save");

        let raw = read_frame(&path).expect("read");
        assert_eq!((raw.rows, raw.cols), (2, 3));
        assert_eq!(raw.bits_per_sample, 16);
        assert_eq!(raw.data, vec![0, 1, 65535, 65535, 0, 301]);
    }

    #[test]
    fn eight_bit_frames_are_widened() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("frame.png");
        GrayImage::from_raw(2, 1, vec![7, 200]).unwrap().save(&path).unwrap();
        let grid = load_frame(&path).expect("load");
        assert_eq!(grid.as_slice(), &[7.0, 200.0]);
    }

    #[test]
    fn colour_frames_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("colour.tif");
        RgbImage::from_pixel(4, 4, Rgb([1, 2, 3])).save(&path).unwrap();
        match read_frame(&path) {
            Err(GuideError::Format {
                bits_per_sample,
                samples_per_pixel,
            }) => {
                assert_eq!((bits_per_sample, samples_per_pixel), (8, 3));
            }
            other => panic!("expected a format error, got {other:?}"),
        }
    }

    #[test]
    fn layout_validation() {
        let deep = RawFrame {
            rows: 1,
            cols: 1,
            bits_per_sample: 32,
            samples_per_pixel: 1,
            data: vec![0],
        };
        assert!(matches!(deep.validate(), Err(GuideError::Format { .. })));
        let short = RawFrame {
            rows: 2,
            cols: 2,
            bits_per_sample: 8,
            samples_per_pixel: 1,
            data: vec![0; 3],
        };
        assert!(matches!(short.validate(), Err(GuideError::InvalidConfig(_))));
    }

    #[test]
    fn missing_file_is_an_opening_error() {
        let err = load_frame(Path::new("/nonexistent/frame.tif")).unwrap_err();
        assert!(matches!(err, GuideError::Opening { .. }));
    }
}
