//! The common grid every raster of an event is resampled into.

use log::{info, warn};

use crate::error::{PipelineError, Result};
use crate::event::EventLayout;
use crate::landcover::{CroplandMask, LandCoverSource};
use crate::raster::{geotiff, transform_bounds, Bounds, Crs, GeoTransform};
use crate::sensor::{locate, BandRole};

/// Reference band used to measure product extents; red exists in both
/// families at their finest resolution.
pub const REFERENCE_BAND: BandRole = BandRole::Red;

/// CRS, north-up transform and pixel shape shared by an event.
#[derive(Debug, Clone, PartialEq)]
pub struct CommonGrid {
    pub crs: Crs,
    pub transform: GeoTransform,
    pub height: usize,
    pub width: usize,
}

impl CommonGrid {
    /// Grid anchored at the upper-left corner of `bounds` with square pixels
    /// of `resolution`; the shape is the ceiling of span / resolution.
    pub fn from_bounds(bounds: &Bounds, crs: Crs, resolution: f64) -> Result<Self> {
        if !resolution.is_finite() || resolution <= 0.0 {
            return Err(PipelineError::Config(format!(
                "target resolution must be positive, got {}",
                resolution
            )));
        }
        if bounds.is_empty() {
            return Err(PipelineError::Projection(format!("empty extent {:?}", bounds)));
        }
        let height = (bounds.height() / resolution).ceil() as usize;
        let width = (bounds.width() / resolution).ceil() as usize;
        Ok(CommonGrid {
            crs,
            transform: GeoTransform::from_origin(bounds.west, bounds.north, resolution, resolution),
            height,
            width,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn resolution(&self) -> f64 {
        self.transform.a
    }

    pub fn bounds(&self) -> Bounds {
        self.transform.bounds(self.height, self.width)
    }
}

/// Union extent of every product's reference band, expressed in the CRS of
/// the first reference band found. Bands in other CRSs are reprojected
/// before the union; bands that cannot be read or transformed are skipped.
pub fn union_extent(layout: &EventLayout) -> Result<(Crs, Bounds)> {
    let mut canonical: Option<Crs> = None;
    let mut union = Bounds::empty();
    let mut used = 0usize;

    for product in layout.products() {
        let Some(path) = locate(product, REFERENCE_BAND) else {
            warn!("Could not find a reference band in {}", product.name());
            continue;
        };
        let band = match geotiff::read_info(&path) {
            Ok(info) => info,
            Err(e) => {
                warn!("Cannot read georeferencing of {:?}: {}", path, e);
                continue;
            }
        };
        let crs = *canonical.get_or_insert(band.crs);
        let extent = match transform_bounds(&band.bounds(), band.crs, crs) {
            Ok(b) => b,
            Err(e) => {
                warn!("Skipping {:?}: cannot bring {} into {}: {}", path, band.crs, crs, e);
                continue;
            }
        };
        if band.crs != crs {
            info!("Reprojected extent of {} from {} into {}", product.name(), band.crs, crs);
        }
        union = union.union(&extent);
        used += 1;
    }

    match canonical {
        Some(crs) if used > 0 && !union.is_empty() => {
            info!("Union of {} reference bands: {:?} in {}", used, union, crs);
            Ok((crs, union))
        }
        _ => Err(PipelineError::NoReferenceBands(layout.root.clone())),
    }
}

/// Build the event's common grid from its products.
pub fn resolve_grid(layout: &EventLayout, target_resolution: f64) -> Result<CommonGrid> {
    let (crs, union) = union_extent(layout)?;
    let grid = CommonGrid::from_bounds(&union, crs, target_resolution)?;
    info!(
        "Universal grid for {}: shape=({}, {}) at {} m in {}",
        layout.name, grid.height, grid.width, target_resolution, grid.crs
    );
    Ok(grid)
}

/// Grid plus cropland mask, computed once per event.
pub fn resolve(
    layout: &EventLayout,
    target_resolution: f64,
    land_cover: &dyn LandCoverSource,
) -> Result<(CommonGrid, CroplandMask)> {
    let grid = resolve_grid(layout, target_resolution)?;
    let mask = CroplandMask::resolve(&grid, land_cover)?;
    Ok((grid, mask))
}
