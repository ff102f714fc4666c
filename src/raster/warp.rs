//! Inverse-mapping reprojection of a band onto a common grid.

use log::trace;
use ndarray::Array2;
use rayon::prelude::*;

use super::{transform_bounds, try_zeros_2d, CoordTransformer, InverseTransform, Raster};
use crate::error::{PipelineError, Result};
use crate::grid::CommonGrid;

/// Destination columns between exactly transformed control points; the
/// source position of the columns in between is interpolated linearly.
const CONTROL_STEP: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resampling {
    Nearest,
    Bilinear,
}

/// Reproject `src` onto `grid` into a freshly allocated array.
pub fn reproject(src: &Raster, grid: &CommonGrid, resampling: Resampling) -> Result<Array2<f32>> {
    let mut dst = try_zeros_2d(grid.shape(), "reprojection destination")?;
    reproject_into(src, grid, resampling, &mut dst)?;
    Ok(dst)
}

/// Reproject `src` onto `grid`, overwriting `dst`. Pixels that fall outside
/// the source, or whose source neighbourhood is all nodata, are 0.
pub fn reproject_into(
    src: &Raster,
    grid: &CommonGrid,
    resampling: Resampling,
    dst: &mut Array2<f32>,
) -> Result<()> {
    if dst.dim() != grid.shape() {
        return Err(PipelineError::ShapeMismatch(format!(
            "destination {:?} does not match grid {:?}",
            dst.dim(),
            grid.shape()
        )));
    }
    dst.fill(0.0);

    let inv_src = src.transform.invert().ok_or_else(|| PipelineError::Projection(
        "source transform is not invertible".to_string(),
    ))?;
    let inv_grid = grid.transform.invert().ok_or_else(|| PipelineError::Projection(
        "grid transform is not invertible".to_string(),
    ))?;
    // Fail early on unsupported CRSs so the per-thread transformers below
    // can be built infallibly.
    CoordTransformer::new(grid.crs, src.crs)?;

    let Some((rows, cols)) = destination_window(src, grid, &inv_grid)? else {
        trace!("source does not overlap the grid");
        return Ok(());
    };

    let width = grid.width;
    let grid_crs = grid.crs;
    let src_crs = src.crs;
    let grid_transform = grid.transform;
    let out = dst
        .as_slice_mut()
        .ok_or_else(|| PipelineError::ShapeMismatch("destination is not contiguous".to_string()))?;

    out.par_chunks_mut(width)
        .enumerate()
        .filter(|(row, _)| rows.contains(row))
        .for_each_init(
            || CoordTransformer::new(grid_crs, src_crs).ok(),
            |transformer, (row, line)| {
                let Some(transformer) = transformer.as_ref() else {
                    return;
                };
                let positions = source_positions(
                    row,
                    cols.clone(),
                    &grid_transform,
                    transformer,
                    &inv_src,
                );
                for (col, pos) in cols.clone().zip(positions) {
                    let Some((sc, sr)) = pos else { continue };
                    line[col] = match resampling {
                        Resampling::Nearest => sample_nearest(&src.data, sc, sr),
                        Resampling::Bilinear => sample_bilinear(&src.data, sc, sr),
                    };
                }
            },
        );
    Ok(())
}

/// Row and column ranges of the grid that the source extent can touch.
fn destination_window(
    src: &Raster,
    grid: &CommonGrid,
    inv_grid: &InverseTransform,
) -> Result<Option<(std::ops::Range<usize>, std::ops::Range<usize>)>> {
    let extent = transform_bounds(&src.bounds(), src.crs, grid.crs)?;
    let corners = [
        (extent.west, extent.north),
        (extent.east, extent.north),
        (extent.west, extent.south),
        (extent.east, extent.south),
    ];
    let (mut c0, mut c1, mut r0, mut r1) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
    for (x, y) in corners {
        let (c, r) = inv_grid.world_to_pixel(x, y);
        c0 = c0.min(c);
        c1 = c1.max(c);
        r0 = r0.min(r);
        r1 = r1.max(r);
    }
    let clamp = |v: f64, hi: usize| v.max(0.0).min(hi as f64) as usize;
    let cols = clamp(c0.floor() - 1.0, grid.width)..clamp(c1.ceil() + 1.0, grid.width);
    let rows = clamp(r0.floor() - 1.0, grid.height)..clamp(r1.ceil() + 1.0, grid.height);
    if cols.is_empty() || rows.is_empty() {
        return Ok(None);
    }
    Ok(Some((rows, cols)))
}

/// Fractional source (col, row) of every destination pixel centre in
/// `cols` on `row`.
fn source_positions(
    row: usize,
    cols: std::ops::Range<usize>,
    grid_transform: &super::GeoTransform,
    transformer: &CoordTransformer,
    inv_src: &InverseTransform,
) -> Vec<Option<(f64, f64)>> {
    let exact = |col: usize| -> Option<(f64, f64)> {
        let (x, y) = grid_transform.pixel_to_world(col as f64 + 0.5, row as f64 + 0.5);
        let (sx, sy) = transformer.transform(x, y).ok()?;
        let (sc, sr) = inv_src.world_to_pixel(sx, sy);
        (sc.is_finite() && sr.is_finite()).then_some((sc, sr))
    };

    let mut out = Vec::with_capacity(cols.len());
    let last = cols.end - 1;
    let mut start = cols.start;
    let mut left = exact(start);
    while start <= last {
        let end = (start + CONTROL_STEP).min(last);
        let right = if end == start { left } else { exact(end) };
        let span = (end - start).max(1) as f64;
        let upto = if end == last { end } else { end - 1 };
        for col in start..=upto {
            let t = (col - start) as f64 / span;
            out.push(match (left, right) {
                (Some((lc, lr)), Some((rc, rr))) => {
                    Some((lc + (rc - lc) * t, lr + (rr - lr) * t))
                }
                _ => exact(col),
            });
        }
        if end == last {
            break;
        }
        start = end;
        left = right;
    }
    out
}

fn sample_nearest(data: &Array2<f32>, sc: f64, sr: f64) -> f32 {
    let (h, w) = data.dim();
    if sc < 0.0 || sr < 0.0 || sc >= w as f64 || sr >= h as f64 {
        return 0.0;
    }
    data[[sr as usize, sc as usize]]
}

fn sample_bilinear(data: &Array2<f32>, sc: f64, sr: f64) -> f32 {
    let (h, w) = data.dim();
    if sc < 0.0 || sr < 0.0 || sc >= w as f64 || sr >= h as f64 {
        return 0.0;
    }
    let x = sc - 0.5;
    let y = sr - 0.5;
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let mut acc = 0.0f64;
    let mut weight = 0.0f64;
    for (dy, wy) in [(0i64, 1.0 - fy), (1, fy)] {
        for (dx, wx) in [(0i64, 1.0 - fx), (1, fx)] {
            let (px, py) = (x0 + dx, y0 + dy);
            if px < 0 || py < 0 || px >= w as i64 || py >= h as i64 {
                continue;
            }
            let wgt = wx * wy;
            if wgt <= 0.0 {
                continue;
            }
            let v = data[[py as usize, px as usize]];
            if v == 0.0 {
                continue;
            }
            acc += v as f64 * wgt;
            weight += wgt;
        }
    }
    if weight > 0.0 {
        (acc / weight) as f32
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{Crs, GeoTransform};
    use ndarray::Array2;

    fn raster(data: Array2<f32>, west: f64, north: f64, res: f64) -> Raster {
        Raster {
            data,
            transform: GeoTransform::from_origin(west, north, res, res),
            crs: Crs(32643),
        }
    }

    fn grid(west: f64, north: f64, res: f64, height: usize, width: usize) -> CommonGrid {
        CommonGrid {
            crs: Crs(32643),
            transform: GeoTransform::from_origin(west, north, res, res),
            height,
            width,
        }
    }

    #[test]
    fn aligned_grid_copies_pixels() {
        let data = Array2::from_shape_fn((4, 40), |(r, c)| (r * 40 + c + 1) as f32);
        let src = raster(data.clone(), 1000.0, 2000.0, 10.0);
        let g = grid(1000.0, 2000.0, 10.0, 4, 40);
        for resampling in [Resampling::Nearest, Resampling::Bilinear] {
            let out = reproject(&src, &g, resampling).unwrap();
            for ((r, c), v) in out.indexed_iter() {
                assert!((v - data[[r, c]]).abs() < 1e-3, "{:?} at ({}, {})", resampling, r, c);
            }
        }
    }

    #[test]
    fn pixels_outside_source_stay_zero() {
        let src = raster(Array2::from_elem((2, 2), 7.0), 1000.0, 2000.0, 10.0);
        let g = grid(1000.0, 2000.0, 10.0, 4, 4);
        let out = reproject(&src, &g, Resampling::Bilinear).unwrap();
        assert_eq!(out[[0, 0]], 7.0);
        assert_eq!(out[[1, 1]], 7.0);
        assert_eq!(out[[0, 2]], 0.0);
        assert_eq!(out[[3, 3]], 0.0);
    }

    #[test]
    fn downsampling_averages_neighbourhood() {
        // 10 m source onto a 20 m grid: each target centre sits on a corner
        // shared by four source pixels.
        let data = Array2::from_shape_fn((4, 4), |(r, c)| ((r / 2) * 2 + c / 2) as f32 + 1.0);
        let src = raster(data, 0.0, 40.0, 10.0);
        let g = grid(0.0, 40.0, 20.0, 2, 2);
        let out = reproject(&src, &g, Resampling::Bilinear).unwrap();
        assert_eq!(out, ndarray::array![[1.0f32, 2.0], [3.0, 4.0]]);
    }

    #[test]
    fn bilinear_ignores_nodata_neighbours() {
        let mut data = Array2::from_elem((2, 2), 8.0f32);
        data[[1, 1]] = 0.0;
        let src = raster(data, 0.0, 20.0, 10.0);
        let g = grid(0.0, 20.0, 20.0, 1, 1);
        let out = reproject(&src, &g, Resampling::Bilinear).unwrap();
        assert_eq!(out[[0, 0]], 8.0);
    }

    #[test]
    fn nearest_keeps_class_codes() {
        let data = Array2::from_shape_fn((4, 4), |(_, c)| if c < 2 { 5.0 } else { 11.0 });
        let src = raster(data, 0.0, 40.0, 10.0);
        let g = grid(0.0, 40.0, 5.0, 8, 8);
        let out = reproject(&src, &g, Resampling::Nearest).unwrap();
        assert!(out.iter().all(|&v| v == 5.0 || v == 11.0));
        assert_eq!(out[[0, 0]], 5.0);
        assert_eq!(out[[7, 7]], 11.0);
    }
}
