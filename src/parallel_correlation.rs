// THEORY:
// Correlation is embarrassingly parallel over map rows: each map row only ever
// receives contributions computed from the shared, read-only object and reference.
// The map is cut into contiguous row bands, each band is accumulated on the tokio
// blocking pool, and the bands are stitched back in order.
//
// Because every band performs exactly the same additions, in the same order, as the
// single-threaded walk does for those rows, the stitched map is bit-identical to the
// sequential one. Parallelism is a throughput knob only.

use crate::core_modules::correlation::{accumulate_strided, CorrelationMap, ReferencePoints};
use crate::core_modules::pixel_grid::PixelGrid;
use crate::error::{GuideError, Result};
use futures::future::join_all;
use std::sync::Arc;
use tracing::trace;

/// Half-open map row ranges covering `map_rows` in at most `bands` pieces.
pub fn band_ranges(map_rows: usize, bands: usize) -> Vec<(usize, usize)> {
    let bands = bands.clamp(1, map_rows.max(1));
    let per_band = map_rows.div_ceil(bands).max(1);
    (0..bands)
        .map(|i| {
            let start = (i * per_band).min(map_rows);
            let end = ((i + 1) * per_band).min(map_rows);
            (start, end)
        })
        .filter(|(start, end)| start < end || map_rows == 0)
        .collect()
}

/// Full normalized cross-correlation, accumulated in `workers` row bands.
pub async fn correlate_banded(
    refs: Arc<ReferencePoints>,
    object: Arc<PixelGrid>,
    workers: usize,
) -> Result<CorrelationMap> {
    let (map_rows, map_cols) = refs.map_dims(object.dims());
    let tasks = band_ranges(map_rows, workers).into_iter().map(|(start, end)| {
        let refs = Arc::clone(&refs);
        let object = Arc::clone(&object);
        tokio::task::spawn_blocking(move || {
            let mut band = vec![0.0; (end - start) * map_cols];
            accumulate_strided(&refs, &object, start, &mut band);
            band
        })
    });

    let mut data = Vec::with_capacity(map_rows * map_cols);
    for joined in join_all(tasks).await {
        let band = joined.map_err(|e| GuideError::Worker(e.to_string()))?;
        data.extend_from_slice(&band);
    }
    trace!(map_rows, map_cols, workers, "banded correlation joined");

    let mut grid = PixelGrid::from_vec(map_rows, map_cols, data)?;
    grid.normalize()?;
    Ok(CorrelationMap {
        grid,
        object_dims: object.dims(),
        reference_dims: (refs.rows, refs.cols),
    })
}
