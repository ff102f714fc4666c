//! Georeferenced single-band rasters and the affine frame they live in.

pub mod crs;
pub mod geotiff;
pub mod warp;

use ndarray::{Array2, Array3};

use crate::error::{PipelineError, Result};

pub use crs::{transform_bounds, CoordTransformer, Crs};

/// Affine pixel → world mapping, rasterio ordering:
/// `x = a*col + b*row + c`, `y = d*col + e*row + f`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl GeoTransform {
    /// North-up transform anchored at the upper-left corner `(west, north)`.
    pub fn from_origin(west: f64, north: f64, x_res: f64, y_res: f64) -> Self {
        GeoTransform {
            a: x_res,
            b: 0.0,
            c: west,
            d: 0.0,
            e: -y_res,
            f: north,
        }
    }

    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.a * col + self.b * row + self.c,
            self.d * col + self.e * row + self.f,
        )
    }

    pub fn invert(&self) -> Option<InverseTransform> {
        let det = self.a * self.e - self.b * self.d;
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        Some(InverseTransform {
            forward: *self,
            det,
        })
    }

    /// Bounds of a `height` x `width` raster in this frame.
    pub fn bounds(&self, height: usize, width: usize) -> Bounds {
        let corners = [
            self.pixel_to_world(0.0, 0.0),
            self.pixel_to_world(width as f64, 0.0),
            self.pixel_to_world(0.0, height as f64),
            self.pixel_to_world(width as f64, height as f64),
        ];
        let mut bounds = Bounds::empty();
        for (x, y) in corners {
            bounds.include(x, y);
        }
        bounds
    }
}

/// Half-open pixel window `rows x cols` of a raster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub rows: std::ops::Range<usize>,
    pub cols: std::ops::Range<usize>,
}

impl Window {
    /// Pixels of a `height` x `width` raster on `transform` touched by
    /// `bounds` (same CRS), grown by `pad` pixels and clipped to the raster.
    /// `None` when they do not overlap.
    pub fn covering(
        transform: &GeoTransform,
        height: usize,
        width: usize,
        bounds: &Bounds,
        pad: usize,
    ) -> Option<Window> {
        let inv = transform.invert()?;
        let corners = [
            inv.world_to_pixel(bounds.west, bounds.north),
            inv.world_to_pixel(bounds.east, bounds.north),
            inv.world_to_pixel(bounds.west, bounds.south),
            inv.world_to_pixel(bounds.east, bounds.south),
        ];
        let (mut c0, mut c1, mut r0, mut r1) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
        for (c, r) in corners {
            c0 = c0.min(c);
            c1 = c1.max(c);
            r0 = r0.min(r);
            r1 = r1.max(r);
        }
        if !(c0.is_finite() && c1.is_finite() && r0.is_finite() && r1.is_finite()) {
            return None;
        }
        let pad = pad as f64;
        let clip = |v: f64, max: usize| v.clamp(0.0, max as f64) as usize;
        let rows = clip((r0 - pad).floor(), height)..clip((r1 + pad).ceil(), height);
        let cols = clip((c0 - pad).floor(), width)..clip((c1 + pad).ceil(), width);
        if rows.is_empty() || cols.is_empty() {
            return None;
        }
        Some(Window { rows, cols })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows.len(), self.cols.len())
    }

    /// Transform of the window's own upper-left pixel.
    pub fn transform(&self, parent: &GeoTransform) -> GeoTransform {
        let (x, y) = parent.pixel_to_world(self.cols.start as f64, self.rows.start as f64);
        GeoTransform {
            c: x,
            f: y,
            ..*parent
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InverseTransform {
    forward: GeoTransform,
    det: f64,
}

impl InverseTransform {
    /// World coordinate → fractional (col, row).
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let t = &self.forward;
        let dx = x - t.c;
        let dy = y - t.f;
        let col = (t.e * dx - t.b * dy) / self.det;
        let row = (-t.d * dx + t.a * dy) / self.det;
        (col, row)
    }
}

/// Axis-aligned extent `(west, south, east, north)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl Bounds {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Bounds {
            west,
            south,
            east,
            north,
        }
    }

    pub fn empty() -> Self {
        Bounds {
            west: f64::INFINITY,
            south: f64::INFINITY,
            east: f64::NEG_INFINITY,
            north: f64::NEG_INFINITY,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.west < self.east && self.south < self.north)
    }

    pub fn include(&mut self, x: f64, y: f64) {
        if !x.is_finite() || !y.is_finite() {
            return;
        }
        self.west = self.west.min(x);
        self.east = self.east.max(x);
        self.south = self.south.min(y);
        self.north = self.north.max(y);
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            west: self.west.min(other.west),
            south: self.south.min(other.south),
            east: self.east.max(other.east),
            north: self.north.max(other.north),
        }
    }

    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }
}

/// Georeferencing of a raster file without its pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterInfo {
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    pub crs: Crs,
    pub nodata: Option<f64>,
}

impl RasterInfo {
    pub fn bounds(&self) -> Bounds {
        self.transform.bounds(self.height, self.width)
    }
}

/// One decoded band. nodata and NaN samples are stored as 0.
#[derive(Debug, Clone)]
pub struct Raster {
    pub data: Array2<f32>,
    pub transform: GeoTransform,
    pub crs: Crs,
}

impl Raster {
    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn bounds(&self) -> Bounds {
        self.transform.bounds(self.height(), self.width())
    }
}

fn reserve<T: Clone>(len: usize, fill: T, what: &str) -> Result<Vec<T>> {
    let mut buf: Vec<T> = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| PipelineError::Allocation {
            what: what.to_string(),
            bytes: len.saturating_mul(std::mem::size_of::<T>()),
        })?;
    buf.resize(len, fill);
    Ok(buf)
}

/// Zero-filled 2-D array, failing with `Allocation` instead of aborting.
pub fn try_zeros_2d<T: Clone + Default>(shape: (usize, usize), what: &str) -> Result<Array2<T>> {
    let len = shape.0.checked_mul(shape.1).ok_or_else(|| PipelineError::Allocation {
        what: what.to_string(),
        bytes: usize::MAX,
    })?;
    let buf = reserve(len, T::default(), what)?;
    Ok(Array2::from_shape_vec(shape, buf)?)
}

/// Zero-filled 3-D array, failing with `Allocation` instead of aborting.
pub fn try_zeros_3d<T: Clone + Default>(
    shape: (usize, usize, usize),
    what: &str,
) -> Result<Array3<T>> {
    let len = shape
        .0
        .checked_mul(shape.1)
        .and_then(|n| n.checked_mul(shape.2))
        .ok_or_else(|| PipelineError::Allocation {
            what: what.to_string(),
            bytes: usize::MAX,
        })?;
    let buf = reserve(len, T::default(), what)?;
    Ok(Array3::from_shape_vec(shape, buf)?)
}

/// Debug-level per-band statistics of a `(H, W, C)` stack.
pub fn log_stats(stack: &Array3<f32>, name: &str) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    let (h, w, c) = stack.dim();
    log::debug!("stats for {}: shape=({}, {}, {})", name, h, w, c);
    for (i, band) in stack.axis_iter(ndarray::Axis(2)).enumerate() {
        let mut n = 0usize;
        let mut sum = 0f64;
        let mut sum_sq = 0f64;
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for &v in band.iter() {
            let v = if v.is_finite() { v } else { 0.0 };
            n += 1;
            sum += v as f64;
            sum_sq += (v as f64) * (v as f64);
            min = min.min(v);
            max = max.max(v);
        }
        if n == 0 {
            continue;
        }
        let mean = sum / n as f64;
        let std = (sum_sq / n as f64 - mean * mean).max(0.0).sqrt();
        log::debug!(
            "  band {}: mean={:.4} max={:.4} min={:.4} std={:.4}",
            i + 1,
            mean,
            max,
            min,
            std
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_round_trips_pixel_coordinates() {
        let t = GeoTransform::from_origin(500_000.0, 3_400_000.0, 30.0, 30.0);
        let inv = t.invert().unwrap();
        let (x, y) = t.pixel_to_world(12.5, 7.25);
        let (col, row) = inv.world_to_pixel(x, y);
        assert!((col - 12.5).abs() < 1e-9);
        assert!((row - 7.25).abs() < 1e-9);
    }

    #[test]
    fn bounds_of_north_up_raster() {
        let t = GeoTransform::from_origin(100.0, 200.0, 10.0, 10.0);
        let b = t.bounds(5, 8);
        assert_eq!(b, Bounds::new(100.0, 150.0, 180.0, 200.0));
    }

    #[test]
    fn window_covers_touched_pixels_and_clips() {
        let t = GeoTransform::from_origin(100.0, 200.0, 10.0, 10.0);
        let inner = Bounds::new(125.0, 160.0, 150.0, 185.0);
        let w = Window::covering(&t, 5, 8, &inner, 0).unwrap();
        assert_eq!(w, Window { rows: 1..4, cols: 2..5 });
        assert_eq!(w.transform(&t), GeoTransform::from_origin(120.0, 190.0, 10.0, 10.0));

        let padded = Window::covering(&t, 5, 8, &inner, 2).unwrap();
        assert_eq!(padded, Window { rows: 0..5, cols: 0..7 });
        assert_eq!(padded.shape(), (5, 7));

        let outside = Bounds::new(500.0, 500.0, 600.0, 600.0);
        assert!(Window::covering(&t, 5, 8, &outside, 1).is_none());
    }

    #[test]
    fn degenerate_transform_has_no_inverse() {
        let t = GeoTransform::from_origin(0.0, 0.0, 0.0, 10.0);
        assert!(t.invert().is_none());
    }

    #[test]
    fn fallible_allocation_reports_exhaustion() {
        let err = try_zeros_2d::<f32>((usize::MAX / 2, 4), "huge").unwrap_err();
        assert!(matches!(err, PipelineError::Allocation { .. }));
        let ok = try_zeros_3d::<f32>((2, 3, 4), "small").unwrap();
        assert_eq!(ok.dim(), (2, 3, 4));
    }
}
