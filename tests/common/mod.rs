#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::Array2;

use cropland_patch_preprocessing::raster::{geotiff, Crs, GeoTransform};
use cropland_patch_preprocessing::sensor::{BandRole, SensorFamily};
use cropland_patch_preprocessing::PipelineConfig;

pub const EVENT: &str = "Haryana-RiceBlast";
pub const CRS: Crs = Crs(32643);
pub const WEST: f64 = 500_000.0;
pub const NORTH: f64 = 3_400_000.0;
pub const RES: f64 = 30.0;

pub struct Workspace {
    pub root: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Workspace {
            root: tempfile::tempdir().unwrap(),
        }
    }

    pub fn raw(&self) -> PathBuf {
        self.root.path().join("raw")
    }

    pub fn processed(&self) -> PathBuf {
        self.root.path().join("processed")
    }

    pub fn date_dir(&self, date: &str) -> PathBuf {
        let dir = self.raw().join(EVENT).join(date);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn config(&self) -> PipelineConfig {
        let mut cfg = PipelineConfig {
            raw_data_dir: self.raw(),
            processed_data_dir: self.processed(),
            events: vec![EVENT.to_string()],
            target_resolution: RES,
            patch_size: 256,
            previews: false,
            progress: false,
            ..PipelineConfig::default()
        };
        cfg.land_cover.enabled = false;
        cfg
    }
}

/// Write a Landsat Collection-2 style product whose five bands are filled
/// by `fill(role, row, col)`. `col_offset` shifts the footprint east in
/// whole pixels.
pub fn landsat_product(
    date_dir: &Path,
    name: &str,
    shape: (usize, usize),
    col_offset: usize,
    fill: impl Fn(BandRole, usize, usize) -> f32,
) -> PathBuf {
    let dir = date_dir.join(name);
    fs::create_dir_all(&dir).unwrap();
    let transform = GeoTransform::from_origin(WEST + col_offset as f64 * RES, NORTH, RES, RES);
    for role in BandRole::ALL {
        let data = Array2::from_shape_fn(shape, |(r, c)| fill(role, r, c));
        let code = SensorFamily::Landsat.band_code(role);
        let path = dir.join(format!("{}_{}.TIF", name, code));
        geotiff::write_band(&path, &data, &transform, CRS, None).unwrap();
    }
    dir
}

/// Write a Sentinel-2 L2A `.SAFE` product anchored at (`WEST`, `NORTH`).
/// Blue, green, red and nir go to `R10m` at `shape_10m`; swir1 goes to
/// `R20m` at half that shape. `fill` gets native pixel indices.
pub fn sentinel2_product(
    date_dir: &Path,
    name: &str,
    shape_10m: (usize, usize),
    fill: impl Fn(BandRole, usize, usize) -> f32,
) -> PathBuf {
    let safe = date_dir.join(name);
    let tile = "T43RFM_20231103T053011";
    let img = safe
        .join("GRANULE")
        .join("L2A_T43RFM_A043512_20231103T053011")
        .join("IMG_DATA");
    for role in BandRole::ALL {
        let (folder, res, shape) = match role {
            BandRole::Swir1 => ("R20m", 20.0, (shape_10m.0 / 2, shape_10m.1 / 2)),
            _ => ("R10m", 10.0, shape_10m),
        };
        let dir = img.join(folder);
        fs::create_dir_all(&dir).unwrap();
        let code = SensorFamily::Sentinel2.band_code(role);
        let path = dir.join(format!("{}_{}_{}.tif", tile, code, folder[1..].to_ascii_lowercase()));
        let data = Array2::from_shape_fn(shape, |(r, c)| fill(role, r, c));
        let transform = GeoTransform::from_origin(WEST, NORTH, res, res);
        geotiff::write_band(&path, &data, &transform, CRS, None).unwrap();
    }
    safe
}

/// Constant reflectance per band, nir given separately.
pub fn flat(role: BandRole, nir: f32) -> f32 {
    match role {
        BandRole::Blue => 50.0,
        BandRole::Green => 60.0,
        BandRole::Red => 70.0,
        BandRole::Nir => nir,
        BandRole::Swir1 => 80.0,
    }
}

pub fn npy_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.ends_with(".npy"))
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}
