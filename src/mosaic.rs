//! Same-day mosaicking by accumulate-then-divide on the common grid.
//!
//! Only two grid-sized accumulators (a 5-channel sum and a contribution
//! counter) live across products, so peak memory does not grow with the
//! number of products in a day.

use std::path::Path;

use log::{debug, info, warn};
use ndarray::{Array2, Array3, ArrayView3, Axis, Zip};

use crate::error::{FailureScope, PipelineError, Result};
use crate::grid::CommonGrid;
use crate::raster::warp::{reproject_into, Resampling};
use crate::raster::{geotiff, log_stats, try_zeros_2d, try_zeros_3d};
use crate::sensor::{locate_all, BandRole, BandSet, Product};

pub const MOSAIC_BANDS: usize = 5;

/// Per-pixel average of every product of one date, channels in
/// `BandRole` order. Pixels no product covered are exactly zero.
#[derive(Debug, Clone)]
pub struct DailyMosaic {
    pub data: Array3<f32>,
    pub products: usize,
}

impl DailyMosaic {
    pub fn band(&self, role: BandRole) -> ndarray::ArrayView2<'_, f32> {
        self.data.index_axis(Axis(2), role.index())
    }
}

pub struct DailyAccumulator<'g> {
    grid: &'g CommonGrid,
    sum: Array3<f32>,
    count: Array2<u16>,
    product_buf: Option<Array3<f32>>,
    band_buf: Option<Array2<f32>>,
    products: usize,
}

impl<'g> DailyAccumulator<'g> {
    pub fn new(grid: &'g CommonGrid) -> Result<Self> {
        let (h, w) = grid.shape();
        Ok(DailyAccumulator {
            grid,
            sum: try_zeros_3d((h, w, MOSAIC_BANDS), "mosaic sum")?,
            count: try_zeros_2d((h, w), "mosaic counter")?,
            product_buf: None,
            band_buf: None,
            products: 0,
        })
    }

    /// Reproject all five bands of `product` and fold them in. A product is
    /// folded only once every band was read and reprojected; on error
    /// nothing of it reaches the accumulators.
    pub fn add_product(&mut self, product: &Product) -> Result<()> {
        let bands = locate_all(product)?;
        let (h, w) = self.grid.shape();
        let mut stack = match self.product_buf.take() {
            Some(buf) => buf,
            None => try_zeros_3d((h, w, MOSAIC_BANDS), "product bands")?,
        };
        let mut band = match self.band_buf.take() {
            Some(buf) => buf,
            None => try_zeros_2d((h, w), "reprojected band")?,
        };

        let folded = self
            .reproject_product(&bands, &mut stack, &mut band)
            .and_then(|()| Self::fold_into(&mut self.sum, &mut self.count, stack.view()));
        self.product_buf = Some(stack);
        self.band_buf = Some(band);
        folded?;
        self.products += 1;
        Ok(())
    }

    fn reproject_product(
        &self,
        bands: &BandSet,
        stack: &mut Array3<f32>,
        band: &mut Array2<f32>,
    ) -> Result<()> {
        for (role, path) in bands.iter() {
            geotiff::read_band(path)
                .and_then(|raster| reproject_into(&raster, self.grid, Resampling::Bilinear, band))
                .map_err(|e| unusable_band(path, e))?;
            stack.index_axis_mut(Axis(2), role.index()).assign(band);
            debug!("  {} <- {:?}", role, path.file_name().unwrap_or_default());
        }
        Ok(())
    }

    /// Fold an already reprojected `(H, W, 5)` product.
    pub fn add_stack(&mut self, stack: ArrayView3<'_, f32>) -> Result<()> {
        Self::fold_into(&mut self.sum, &mut self.count, stack)?;
        self.products += 1;
        Ok(())
    }

    fn fold_into(
        sum: &mut Array3<f32>,
        count: &mut Array2<u16>,
        stack: ArrayView3<'_, f32>,
    ) -> Result<()> {
        if stack.dim() != sum.dim() {
            return Err(PipelineError::ShapeMismatch(format!(
                "product stack {:?} does not match mosaic {:?}",
                stack.dim(),
                sum.dim()
            )));
        }
        // All-zero pixels are "no data", never a valid zero reflectance.
        Zip::from(sum.lanes_mut(Axis(2)))
            .and(count)
            .and(stack.lanes(Axis(2)))
            .for_each(|mut acc, n, px| {
                if px.iter().any(|&v| v != 0.0 && v.is_finite()) {
                    for (a, &v) in acc.iter_mut().zip(px.iter()) {
                        if v.is_finite() {
                            *a += v;
                        }
                    }
                    *n = n.saturating_add(1);
                }
            });
        Ok(())
    }

    pub fn products(&self) -> usize {
        self.products
    }

    pub fn total_contributions(&self) -> u64 {
        self.count.iter().map(|&n| n as u64).sum()
    }

    pub fn counts(&self) -> &Array2<u16> {
        &self.count
    }

    /// Divide the sum by the per-pixel count; zero-count pixels divide by 1
    /// and so stay zero. `None` when nothing contributed.
    pub fn finalize(self) -> Option<DailyMosaic> {
        if self.total_contributions() == 0 {
            return None;
        }
        let DailyAccumulator {
            mut sum,
            count,
            products,
            ..
        } = self;
        Zip::from(sum.lanes_mut(Axis(2)))
            .and(&count)
            .for_each(|mut acc, &n| {
                let divisor = n.max(1) as f32;
                acc.mapv_inplace(|v| v / divisor);
            });
        Some(DailyMosaic {
            data: sum,
            products,
        })
    }
}

/// Blame a band file for its read or reprojection failure, unless the
/// failure is about memory or buffer shapes rather than the file.
fn unusable_band(path: &Path, e: PipelineError) -> PipelineError {
    match e {
        PipelineError::Allocation { .. } | PipelineError::ShapeMismatch(_) => e,
        other => PipelineError::BandRead {
            path: path.to_path_buf(),
            source: Box::new(other),
        },
    }
}

/// Mosaic every product of `date` onto `grid`. Product-scoped failures
/// (missing or unreadable bands) drop the product; anything wider aborts
/// the date. `None` if no pixel received data.
pub fn accumulate(products: &[Product], grid: &CommonGrid, date: &str) -> Result<Option<DailyMosaic>> {
    info!("Iteratively processing and mosaicking {} products for {}", products.len(), date);
    let mut acc = DailyAccumulator::new(grid)?;
    for product in products {
        info!(
            "  - Processing product: {} ({:?}, {} m native, resampled to {} m)",
            product.name(),
            product.family,
            product.family.native_resolution(),
            grid.resolution()
        );
        match acc.add_product(product) {
            Ok(()) => {}
            Err(e) if e.scope() == FailureScope::Product => {
                warn!("  Skipping product {}: {}", product.name(), e)
            }
            Err(e) => return Err(e),
        }
    }
    let used = acc.products();
    match acc.finalize() {
        Some(mosaic) => {
            log_stats(&mosaic.data, &format!("{} raw mosaic (5 bands)", date));
            info!("  {} of {} products contributed on {}", used, products.len(), date);
            Ok(Some(mosaic))
        }
        None => {
            warn!("  No valid data found for {}", date);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{Crs, GeoTransform};
    use ndarray::s;

    fn grid(h: usize, w: usize) -> CommonGrid {
        CommonGrid {
            crs: Crs(32643),
            transform: GeoTransform::from_origin(0.0, h as f64 * 30.0, 30.0, 30.0),
            height: h,
            width: w,
        }
    }

    #[test]
    fn overlapping_products_are_averaged() {
        let g = grid(2, 2);
        let mut acc = DailyAccumulator::new(&g).unwrap();
        acc.add_stack(Array3::from_elem((2, 2, 5), 2.0).view()).unwrap();
        acc.add_stack(Array3::from_elem((2, 2, 5), 4.0).view()).unwrap();
        assert_eq!(acc.total_contributions(), 8);
        let m = acc.finalize().unwrap();
        assert!(m.data.iter().all(|&v| v == 3.0));
        assert_eq!(m.products, 2);
    }

    #[test]
    fn uncovered_pixels_stay_exactly_zero() {
        let g = grid(2, 2);
        let mut acc = DailyAccumulator::new(&g).unwrap();
        let mut stack = Array3::zeros((2, 2, 5));
        stack.slice_mut(s![0, .., ..]).fill(6.0);
        acc.add_stack(stack.view()).unwrap();
        let m = acc.finalize().unwrap();
        assert!(m.data.slice(s![0, .., ..]).iter().all(|&v| v == 6.0));
        assert!(m.data.slice(s![1, .., ..]).iter().all(|&v| v == 0.0));
        assert!(m.data.iter().all(|v| !v.is_nan()));
    }

    #[test]
    fn all_zero_pixels_do_not_count() {
        let g = grid(1, 2);
        let mut acc = DailyAccumulator::new(&g).unwrap();
        let mut stack = Array3::zeros((1, 2, 5));
        stack[[0, 0, 3]] = 10.0;
        acc.add_stack(stack.view()).unwrap();
        assert_eq!(acc.counts()[[0, 0]], 1);
        assert_eq!(acc.counts()[[0, 1]], 0);
    }

    #[test]
    fn disjoint_halves_are_not_double_counted() {
        let g = grid(4, 4);
        let mut acc = DailyAccumulator::new(&g).unwrap();
        let mut left = Array3::zeros((4, 4, 5));
        left.slice_mut(s![.., ..2, ..]).fill(10.0);
        let mut right = Array3::zeros((4, 4, 5));
        right.slice_mut(s![.., 2.., ..]).fill(20.0);
        acc.add_stack(left.view()).unwrap();
        acc.add_stack(right.view()).unwrap();
        assert!(acc.counts().iter().all(|&n| n == 1));
        let m = acc.finalize().unwrap();
        assert!(m.data.slice(s![.., ..2, ..]).iter().all(|&v| v == 10.0));
        assert!(m.data.slice(s![.., 2.., ..]).iter().all(|&v| v == 20.0));
    }

    #[test]
    fn nothing_contributed_yields_none() {
        let g = grid(3, 3);
        let mut acc = DailyAccumulator::new(&g).unwrap();
        acc.add_stack(Array3::zeros((3, 3, 5)).view()).unwrap();
        assert!(acc.finalize().is_none());
    }

    #[test]
    fn product_missing_a_band_leaves_accumulators_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LC08_L2SP_148039_20231103_20231104_02_T1");
        std::fs::create_dir_all(&path).unwrap();
        let product = Product::from_path(path).unwrap();
        let g = grid(2, 2);
        let mut acc = DailyAccumulator::new(&g).unwrap();
        let err = acc.add_product(&product).unwrap_err();
        assert!(matches!(err, PipelineError::MissingBands { .. }));
        assert_eq!(acc.total_contributions(), 0);
        assert_eq!(acc.products(), 0);
        assert!(accumulate(&[product], &g, "2023-11-03").unwrap().is_none());
    }

    #[test]
    fn corrupt_band_file_drops_only_that_product() {
        let dir = tempfile::tempdir().unwrap();
        let name = "LC09_L2SP_148039_20231103_20231105_02_T1";
        let path = dir.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        for role in BandRole::ALL {
            let code = crate::sensor::SensorFamily::Landsat.band_code(role);
            std::fs::write(path.join(format!("{}_{}.TIF", name, code)), b"not a tiff").unwrap();
        }
        let product = Product::from_path(path).unwrap();
        let g = grid(2, 2);
        let mut acc = DailyAccumulator::new(&g).unwrap();
        let err = acc.add_product(&product).unwrap_err();
        assert!(matches!(err, PipelineError::BandRead { .. }));
        assert_eq!(err.scope(), FailureScope::Product);
        assert_eq!(acc.products(), 0);
        assert!(accumulate(&[product], &g, "2023-11-03").unwrap().is_none());
    }

    #[test]
    fn mismatched_stack_is_rejected() {
        let g = grid(2, 2);
        let mut acc = DailyAccumulator::new(&g).unwrap();
        let err = acc.add_stack(Array3::zeros((3, 2, 5)).view()).unwrap_err();
        assert_eq!(err.scope(), FailureScope::Date);
    }
}
