//! Cropland masking, percentile contrast stretch and vegetation indices.

use std::fmt;

use log::{debug, info};
use ndarray::{Array3, ArrayView2, ArrayViewMut2, Axis, Zip};
use serde::Serialize;

use crate::error::{PipelineError, Result};
use crate::landcover::CroplandMask;
use crate::mosaic::{DailyMosaic, MOSAIC_BANDS};
use crate::raster::try_zeros_3d;
use crate::sensor::BandRole;

pub const LOW_PERCENTILE: f64 = 2.0;
pub const HIGH_PERCENTILE: f64 = 98.0;

/// Final per-date channels, in on-disk order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Channel {
    Blue,
    Green,
    Red,
    Nir,
    Ndvi,
    Ndmi,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::Blue,
        Channel::Green,
        Channel::Red,
        Channel::Nir,
        Channel::Ndvi,
        Channel::Ndmi,
    ];
    pub const COUNT: usize = 6;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Channel::Blue => "blue",
            Channel::Green => "green",
            Channel::Red => "red",
            Channel::Nir => "nir",
            Channel::Ndvi => "ndvi",
            Channel::Ndmi => "ndmi",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Finalized `(H, W, 6)` raster of one date. Never mutated once built.
#[derive(Debug, Clone)]
pub struct DailyRaster {
    data: Array3<f32>,
}

impl DailyRaster {
    pub fn from_array(data: Array3<f32>) -> Result<Self> {
        if data.len_of(Axis(2)) != Channel::COUNT {
            return Err(PipelineError::ShapeMismatch(format!(
                "daily raster needs {} channels, got {}",
                Channel::COUNT,
                data.len_of(Axis(2))
            )));
        }
        Ok(DailyRaster { data })
    }

    pub fn shape(&self) -> (usize, usize) {
        let (h, w, _) = self.data.dim();
        (h, w)
    }

    pub fn channel(&self, channel: Channel) -> ArrayView2<'_, f32> {
        self.data.index_axis(Axis(2), channel.index())
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }
}

/// Linear-interpolated percentile (`q` in 0..=100) of `values`, reordering
/// the slice in place.
pub fn percentile(values: &mut [f32], q: f64) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    let n = values.len();
    let rank = (q / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let frac = rank - lo as f64;
    let (_, lo_v, right) = values.select_nth_unstable_by(lo, f32::total_cmp);
    let lo_v = *lo_v;
    if frac == 0.0 || right.is_empty() {
        return Some(lo_v);
    }
    let hi_v = right.iter().copied().fold(f32::INFINITY, f32::min);
    Some((lo_v as f64 + (hi_v as f64 - lo_v as f64) * frac) as f32)
}

/// Stretch bounds of one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stretch {
    pub low: f32,
    pub high: f32,
}

/// 2nd/98th percentile of the strictly positive pixels, `None` if there
/// are none.
pub fn positive_stretch(channel: ArrayView2<'_, f32>) -> Result<Option<Stretch>> {
    let n = channel.iter().filter(|v| v.is_finite() && **v > 0.0).count();
    if n == 0 {
        return Ok(None);
    }
    let mut values: Vec<f32> = Vec::new();
    values
        .try_reserve_exact(n)
        .map_err(|_| PipelineError::Allocation {
            what: "percentile buffer".to_string(),
            bytes: n * std::mem::size_of::<f32>(),
        })?;
    values.extend(channel.iter().copied().filter(|v| v.is_finite() && *v > 0.0));
    let low = percentile(&mut values, LOW_PERCENTILE);
    let high = percentile(&mut values, HIGH_PERCENTILE);
    Ok(low.zip(high).map(|(low, high)| Stretch { low, high }))
}

/// Clip positive pixels to the channel's 2–98 % range and, when that range
/// is not degenerate, rescale them to [0, 1]. Non-positive pixels become 0.
pub fn normalize_channel(mut channel: ArrayViewMut2<'_, f32>) -> Result<Option<Stretch>> {
    let Some(stretch) = positive_stretch(channel.view())? else {
        channel.fill(0.0);
        return Ok(None);
    };
    let Stretch { low, high } = stretch;
    let range = high - low;
    channel.mapv_inplace(|v| {
        if !v.is_finite() || v <= 0.0 {
            return 0.0;
        }
        let clipped = v.clamp(low, high);
        if range > 0.0 {
            (clipped - low) / range
        } else {
            clipped
        }
    });
    Ok(Some(stretch))
}

/// Normalize each of the five mosaic channels independently, in place.
pub fn normalize_channels(stack: &mut Array3<f32>) -> Result<()> {
    for role in BandRole::ALL {
        match normalize_channel(stack.index_axis_mut(Axis(2), role.index()))? {
            Some(s) => debug!("  {} stretch p2={:.4} p98={:.4}", role, s.low, s.high),
            None => debug!("  {} has no positive pixels", role),
        }
    }
    Ok(())
}

/// `(a - b) / (a + b)` with zero denominators replaced by 1 before the
/// division, non-finite results set to 0, then clamped to [-1, 1].
#[inline]
pub fn normalized_difference(a: f32, b: f32) -> f32 {
    let mut den = a + b;
    if den == 0.0 {
        den = 1.0;
    }
    let v = (a - b) / den;
    if v.is_finite() {
        v.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Assemble blue, green, red, nir, ndvi, ndmi from a normalized 5-band stack.
pub fn compute_indices(stack: &Array3<f32>) -> Result<DailyRaster> {
    let (h, w, c) = stack.dim();
    if c != MOSAIC_BANDS {
        return Err(PipelineError::ShapeMismatch(format!(
            "expected {} mosaic bands, got {}",
            MOSAIC_BANDS, c
        )));
    }
    let mut out = try_zeros_3d((h, w, Channel::COUNT), "daily raster")?;
    for (role, channel) in [
        (BandRole::Blue, Channel::Blue),
        (BandRole::Green, Channel::Green),
        (BandRole::Red, Channel::Red),
        (BandRole::Nir, Channel::Nir),
    ] {
        out.index_axis_mut(Axis(2), channel.index())
            .assign(&stack.index_axis(Axis(2), role.index()));
    }
    let red = stack.index_axis(Axis(2), BandRole::Red.index());
    let nir = stack.index_axis(Axis(2), BandRole::Nir.index());
    let swir1 = stack.index_axis(Axis(2), BandRole::Swir1.index());

    Zip::from(out.index_axis_mut(Axis(2), Channel::Ndvi.index()))
        .and(&nir)
        .and(&red)
        .for_each(|o, &n, &r| *o = normalized_difference(n, r));
    Zip::from(out.index_axis_mut(Axis(2), Channel::Ndmi.index()))
        .and(&nir)
        .and(&swir1)
        .for_each(|o, &n, &s| *o = normalized_difference(n, s));

    DailyRaster::from_array(out)
}

/// Mask, normalize and derive indices for one date's mosaic.
pub fn finalize(mosaic: DailyMosaic, mask: &CroplandMask) -> Result<DailyRaster> {
    finalize_with(mosaic, mask, |_| {})
}

/// [`finalize`], handing the masked and normalized 5-band stack to
/// `after_mask` before the indices are derived from it.
pub fn finalize_with<F>(mosaic: DailyMosaic, mask: &CroplandMask, after_mask: F) -> Result<DailyRaster>
where
    F: FnOnce(&Array3<f32>),
{
    let mut data = mosaic.data;
    let (h, w, _) = data.dim();
    if mask.shape() != (h, w) {
        return Err(PipelineError::ShapeMismatch(format!(
            "mask {:?} does not match mosaic ({}, {})",
            mask.shape(),
            h,
            w
        )));
    }
    info!("Applying cropland mask");
    mask.apply(&mut data);
    info!("Normalizing masked data channel by channel");
    normalize_channels(&mut data)?;
    after_mask(&data);
    info!("Calculating indices");
    compute_indices(&data)
}
