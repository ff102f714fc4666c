//! EPSG-coded coordinate reference systems and transforms between them.

use std::fmt;

use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use super::Bounds;
use crate::error::{PipelineError, Result};

pub const EPSG_WGS84: u32 = 4326;
pub const EPSG_WEB_MERCATOR: u32 = 3857;

/// Points sampled along each edge when transforming an extent.
const DENSIFY_POINTS: usize = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Crs(pub u32);

impl Crs {
    pub fn wgs84() -> Self {
        Crs(EPSG_WGS84)
    }

    pub fn epsg(&self) -> u32 {
        self.0
    }

    pub fn is_geographic(&self) -> bool {
        self.0 == EPSG_WGS84
    }

    /// proj4 definition for the EPSG codes satellite products ship in.
    pub fn proj_string(&self) -> Option<String> {
        match self.0 {
            EPSG_WGS84 => Some("+proj=longlat +datum=WGS84 +no_defs".to_string()),
            EPSG_WEB_MERCATOR => Some(
                "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +no_defs"
                    .to_string(),
            ),
            code @ 32601..=32660 => Some(format!(
                "+proj=utm +zone={} +datum=WGS84 +units=m +no_defs",
                code - 32600
            )),
            code @ 32701..=32760 => Some(format!(
                "+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs",
                code - 32700
            )),
            _ => None,
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.0)
    }
}

enum Strategy {
    Identity,
    Proj { source: Proj, target: Proj },
}

/// Point transformer between two CRSs. Degrees in and out for geographic
/// systems, the radian handling proj4rs needs is internal.
pub struct CoordTransformer {
    source: Crs,
    target: Crs,
    strategy: Strategy,
}

impl fmt::Debug for CoordTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordTransformer")
            .field("source", &self.source)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl CoordTransformer {
    pub fn new(source: Crs, target: Crs) -> Result<Self> {
        if source == target {
            return Ok(CoordTransformer {
                source,
                target,
                strategy: Strategy::Identity,
            });
        }
        let source_proj = build_proj(source)?;
        let target_proj = build_proj(target)?;
        Ok(CoordTransformer {
            source,
            target,
            strategy: Strategy::Proj {
                source: source_proj,
                target: target_proj,
            },
        })
    }

    pub fn is_identity(&self) -> bool {
        matches!(self.strategy, Strategy::Identity)
    }

    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        let (source, target) = match &self.strategy {
            Strategy::Identity => return Ok((x, y)),
            Strategy::Proj { source, target } => (source, target),
        };
        let mut point = if self.source.is_geographic() {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };
        transform(source, target, &mut point).map_err(|e| {
            PipelineError::Projection(format!(
                "({}, {}) from {} to {}: {:?}",
                x, y, self.source, self.target, e
            ))
        })?;
        if self.target.is_geographic() {
            Ok((point.0.to_degrees(), point.1.to_degrees()))
        } else {
            Ok((point.0, point.1))
        }
    }
}

fn build_proj(crs: Crs) -> Result<Proj> {
    let def = crs
        .proj_string()
        .ok_or_else(|| PipelineError::Projection(format!("{} is not supported", crs)))?;
    Proj::from_proj_string(&def)
        .map_err(|e| PipelineError::Projection(format!("invalid definition for {}: {:?}", crs, e)))
}

/// Transform an extent by densifying its edges and taking the extrema of the
/// transformed points.
pub fn transform_bounds(bounds: &Bounds, source: Crs, target: Crs) -> Result<Bounds> {
    let transformer = CoordTransformer::new(source, target)?;
    if transformer.is_identity() {
        return Ok(*bounds);
    }
    let mut out = Bounds::empty();
    let steps = (DENSIFY_POINTS - 1) as f64;
    for i in 0..DENSIFY_POINTS {
        let t = i as f64 / steps;
        let x = bounds.west + t * bounds.width();
        let y = bounds.south + t * bounds.height();
        for (px, py) in [
            (x, bounds.south),
            (x, bounds.north),
            (bounds.west, y),
            (bounds.east, y),
        ] {
            let (tx, ty) = transformer.transform(px, py)?;
            out.include(tx, ty);
        }
    }
    if out.is_empty() {
        return Err(PipelineError::Projection(format!(
            "extent {:?} collapsed when transformed from {} to {}",
            bounds, source, target
        )));
    }
    Ok(out)
}
