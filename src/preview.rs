//! PNG previews of the cropland mask, each date's composite and its tile grid.
//! Rendering never fails a run: errors are logged and dropped.

use std::fs;
use std::path::{Path, PathBuf};

use image::{GrayImage, Luma, Rgb, RgbImage};
use log::{info, warn};
use ndarray::{Array3, ArrayView2, Axis};

use crate::error::Result;
use crate::landcover::CroplandMask;
use crate::normalize::{positive_stretch, Stretch};
use crate::patches::PatchStats;
use crate::sensor::BandRole;

const CANDIDATE: Rgb<u8> = Rgb([0, 255, 255]);
const KEPT: Rgb<u8> = Rgb([255, 215, 0]);
const OUTLINE: u32 = 2;

/// Writes previews under `<processed>/<event>/visualizations`, or nothing
/// when disabled.
pub struct Previews {
    dir: Option<PathBuf>,
}

impl Previews {
    pub fn new(dir: PathBuf, enabled: bool) -> Self {
        Previews {
            dir: enabled.then_some(dir),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    fn target(&self, name: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        if let Err(e) = fs::create_dir_all(dir) {
            warn!("Could not create preview directory {:?}: {}", dir, e);
            return None;
        }
        Some(dir.join(name))
    }

    pub fn cropland_mask(&self, event: &str, mask: &CroplandMask) {
        let Some(path) = self.target(&format!("{}_00_cropland_mask.png", event)) else {
            return;
        };
        report(mask_image(mask.view()).save(&path).map_err(Into::into), &path);
    }

    /// SWIR1/NIR/red composite of a 5-band mosaic stack, saved as
    /// `<date>_<suffix>.png`. The rendered image is returned for overlays.
    pub fn composite(&self, date: &str, suffix: &str, stack: &Array3<f32>) -> Option<RgbImage> {
        let path = self.target(&format!("{}_{}.png", date, suffix))?;
        let rendered = false_color(stack).and_then(|img| {
            img.save(&path)?;
            Ok(img)
        });
        match rendered {
            Ok(img) => {
                info!("  Saved {:?}", path.file_name().unwrap_or_default());
                Some(img)
            }
            Err(e) => {
                warn!("Could not create preview {:?}: {}", path, e);
                None
            }
        }
    }

    /// Outline every candidate tile on `base`, highlighting kept ones.
    pub fn patch_grid(
        &self,
        date: &str,
        base: Option<RgbImage>,
        patch_size: usize,
        stats: &PatchStats,
        kept: &[(usize, usize)],
    ) {
        let Some(mut img) = base else {
            return;
        };
        let Some(path) = self.target(&format!("{}_03_patch_grid.png", date)) else {
            return;
        };
        let p = patch_size as u32;
        for row in 0..stats.rows as u32 {
            for col in 0..stats.cols as u32 {
                draw_outline(&mut img, col * p, row * p, p, CANDIDATE);
            }
        }
        for &(row, col) in kept {
            draw_outline(&mut img, col as u32 * p + OUTLINE, row as u32 * p + OUTLINE, p.saturating_sub(2 * OUTLINE), KEPT);
        }
        report(img.save(&path).map_err(Into::into), &path);
    }
}

fn report(result: Result<()>, path: &Path) {
    match result {
        Ok(()) => info!("  Saved {:?}", path.file_name().unwrap_or_default()),
        Err(e) => warn!("Could not create preview {:?}: {}", path, e),
    }
}

pub fn mask_image(mask: ArrayView2<'_, bool>) -> GrayImage {
    let (h, w) = mask.dim();
    GrayImage::from_fn(w as u32, h as u32, |x, y| {
        Luma([if mask[[y as usize, x as usize]] { 255 } else { 0 }])
    })
}

fn to_byte(v: f32, stretch: Option<Stretch>) -> u8 {
    let Some(Stretch { low, high }) = stretch else {
        return 0;
    };
    if !v.is_finite() || v <= 0.0 {
        return 0;
    }
    let scaled = if high > low {
        (v.clamp(low, high) - low) / (high - low)
    } else {
        1.0
    };
    (scaled * 255.0).round() as u8
}

/// SWIR1, NIR, red as R, G, B, each stretched over its positive 2–98 % range.
pub fn false_color(stack: &Array3<f32>) -> Result<RgbImage> {
    let (h, w, _) = stack.dim();
    let roles = [BandRole::Swir1, BandRole::Nir, BandRole::Red];
    let mut stretches = [None; 3];
    for (s, role) in stretches.iter_mut().zip(roles) {
        *s = positive_stretch(stack.index_axis(Axis(2), role.index()))?;
    }
    Ok(RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let (r, c) = (y as usize, x as usize);
        let mut px = [0u8; 3];
        for (i, role) in roles.iter().enumerate() {
            px[i] = to_byte(stack[[r, c, role.index()]], stretches[i]);
        }
        Rgb(px)
    }))
}

fn draw_outline(img: &mut RgbImage, x0: u32, y0: u32, size: u32, color: Rgb<u8>) {
    let (w, h) = img.dimensions();
    if size == 0 || x0 >= w || y0 >= h {
        return;
    }
    let x1 = (x0 + size).min(w);
    let y1 = (y0 + size).min(h);
    for y in y0..y1 {
        for x in x0..x1 {
            let edge = x < x0 + OUTLINE || x + OUTLINE >= x0 + size || y < y0 + OUTLINE || y + OUTLINE >= y0 + size;
            if edge {
                img.put_pixel(x, y, color);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn composite_is_black_where_masked() {
        let mut stack = Array3::from_shape_fn((6, 5, 5), |(r, c, _)| (r * 5 + c + 1) as f32);
        stack.index_axis_mut(Axis(0), 0).fill(0.0);
        let img = false_color(&stack).unwrap();
        assert_eq!(img.dimensions(), (5, 6));
        assert_eq!(*img.get_pixel(2, 0), Rgb([0, 0, 0]));
        assert_eq!(*img.get_pixel(4, 5), Rgb([255, 255, 255]));
    }

    #[test]
    fn previews_are_written_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let previews = Previews::new(dir.path().join("viz"), true);
        let mask = CroplandMask::from_array(Array2::from_elem((8, 8), true));
        previews.cropland_mask("Una-yellowRust", &mask);
        let stack = Array3::from_elem((8, 8, 5), 0.5f32);
        let base = previews.composite("2024-02-01", "02_after_mask", &stack);
        assert!(base.is_some());
        let stats = PatchStats {
            rows: 2,
            cols: 2,
            candidates: 4,
            kept: 1,
        };
        previews.patch_grid("2024-02-01", base, 4, &stats, &[(1, 0)]);
        for name in [
            "Una-yellowRust_00_cropland_mask.png",
            "2024-02-01_02_after_mask.png",
            "2024-02-01_03_patch_grid.png",
        ] {
            assert!(dir.path().join("viz").join(name).exists(), "{}", name);
        }
    }

    #[test]
    fn disabled_previews_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let previews = Previews::new(dir.path().join("viz"), false);
        assert!(previews
            .composite("d", "01_before_mask", &Array3::from_elem((2, 2, 5), 1.0))
            .is_none());
        assert!(!dir.path().join("viz").exists());
    }

    #[test]
    fn outline_stays_inside_image() {
        let mut img = RgbImage::new(10, 10);
        draw_outline(&mut img, 6, 6, 8, CANDIDATE);
        assert_eq!(*img.get_pixel(6, 9), CANDIDATE);
        assert_eq!(*img.get_pixel(0, 0), Rgb([0, 0, 0]));
    }
}
