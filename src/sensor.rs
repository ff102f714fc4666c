//! Sensor families and the on-disk locations of their reflectance bands.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::Serialize;

use crate::error::{PipelineError, Result};

/// Semantic role of a reflectance band, in mosaic channel order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum BandRole {
    Blue,
    Green,
    Red,
    Nir,
    Swir1,
}

impl BandRole {
    pub const ALL: [BandRole; 5] = [
        BandRole::Blue,
        BandRole::Green,
        BandRole::Red,
        BandRole::Nir,
        BandRole::Swir1,
    ];

    /// Channel index in the 5-band daily mosaic.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            BandRole::Blue => "blue",
            BandRole::Green => "green",
            BandRole::Red => "red",
            BandRole::Nir => "nir",
            BandRole::Swir1 => "swir1",
        }
    }
}

impl fmt::Display for BandRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SensorFamily {
    /// Sentinel-2 L2A `.SAFE` products.
    Sentinel2,
    /// Landsat 8/9 Collection-2 surface reflectance.
    Landsat,
}

impl SensorFamily {
    /// Classify a product folder by its name.
    pub fn from_product_name(name: &str) -> Option<Self> {
        if name.starts_with("S2") || name.ends_with(".SAFE") {
            Some(SensorFamily::Sentinel2)
        } else if name.starts_with("LC0") || name.starts_with("LC8") || name.starts_with("LC9") {
            Some(SensorFamily::Landsat)
        } else {
            None
        }
    }

    /// Native ground resolution tier in metres.
    pub fn native_resolution(self) -> f64 {
        match self {
            SensorFamily::Sentinel2 => 10.0,
            SensorFamily::Landsat => 30.0,
        }
    }

    /// Band code for a role (`B04`, `SR_B4`, ...).
    pub fn band_code(self, role: BandRole) -> &'static str {
        match (self, role) {
            (SensorFamily::Sentinel2, BandRole::Blue) => "B02",
            (SensorFamily::Sentinel2, BandRole::Green) => "B03",
            (SensorFamily::Sentinel2, BandRole::Red) => "B04",
            (SensorFamily::Sentinel2, BandRole::Nir) => "B08",
            (SensorFamily::Sentinel2, BandRole::Swir1) => "B11",
            (SensorFamily::Landsat, BandRole::Blue) => "SR_B2",
            (SensorFamily::Landsat, BandRole::Green) => "SR_B3",
            (SensorFamily::Landsat, BandRole::Red) => "SR_B4",
            (SensorFamily::Landsat, BandRole::Nir) => "SR_B5",
            (SensorFamily::Landsat, BandRole::Swir1) => "SR_B6",
        }
    }
}

/// One acquisition folder under a date folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    pub path: PathBuf,
    pub family: SensorFamily,
}

impl Product {
    /// `None` if the folder name matches no supported family.
    pub fn from_path(path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_string();
        let family = SensorFamily::from_product_name(&name)?;
        Some(Product { path, family })
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|os| os.to_string_lossy().to_string())
            .unwrap_or_else(|| "UnknownProduct".to_string())
    }
}

/// Paths of all five bands of a product, indexed by `BandRole::index`.
#[derive(Debug, Clone)]
pub struct BandSet {
    paths: [PathBuf; 5],
}

impl BandSet {
    pub fn path(&self, role: BandRole) -> &Path {
        &self.paths[role.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (BandRole, &Path)> {
        BandRole::ALL.into_iter().map(move |r| (r, self.path(r)))
    }
}

fn is_geotiff(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".tif") || lower.ends_with(".tiff")
}

fn sorted_entries(dir: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(rd) => rd.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => return Vec::new(),
    };
    out.sort();
    out
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|os| os.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// First GeoTIFF in `dir` whose stem ends with `suffix`. A JPEG2000 match is
/// reported, it has to be converted before this pipeline can read it.
fn find_band_file(dir: &Path, suffix: &str) -> Option<PathBuf> {
    let suffix = suffix.to_ascii_lowercase();
    let mut jp2 = None;
    for path in sorted_entries(dir) {
        let name = file_name(&path);
        let lower = name.to_ascii_lowercase();
        let stem = match lower.rsplit_once('.') {
            Some((stem, _)) => stem,
            None => continue,
        };
        if !stem.ends_with(&suffix) {
            continue;
        }
        if is_geotiff(&name) {
            return Some(path);
        }
        if lower.ends_with(".jp2") {
            jp2 = Some(path);
        }
    }
    if let Some(jp2) = jp2 {
        warn!("Only JPEG2000 found for {:?}, convert it to GeoTIFF first", jp2);
    }
    None
}

/// Resolve the file of one band of a product, `None` if it is missing.
pub fn locate(product: &Product, role: BandRole) -> Option<PathBuf> {
    let code = product.family.band_code(role);
    match product.family {
        SensorFamily::Sentinel2 => {
            let granule = sorted_entries(&product.path.join("GRANULE"))
                .into_iter()
                .find(|p| p.is_dir() && file_name(p).starts_with("L2A"))?;
            let (folder, res) = match role {
                BandRole::Swir1 => ("R20m", "20m"),
                _ => ("R10m", "10m"),
            };
            let dir = granule.join("IMG_DATA").join(folder);
            find_band_file(&dir, &format!("_{}_{}", code, res))
        }
        SensorFamily::Landsat => find_band_file(&product.path, &format!("_{}", code)),
    }
}

/// Resolve all five bands or report which are missing.
pub fn locate_all(product: &Product) -> Result<BandSet> {
    let mut found: Vec<PathBuf> = Vec::with_capacity(5);
    let mut missing = Vec::new();
    for role in BandRole::ALL {
        match locate(product, role) {
            Some(p) => found.push(p),
            None => missing.push(role),
        }
    }
    if !missing.is_empty() {
        debug!("product {} misses {:?}", product.name(), missing);
        return Err(PipelineError::MissingBands {
            product: product.path.clone(),
            missing,
        });
    }
    let paths: [PathBuf; 5] = found.try_into().map_err(|_| PipelineError::MissingBands {
        product: product.path.clone(),
        missing: Vec::new(),
    })?;
    Ok(BandSet { paths })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        File::create(path).unwrap();
    }

    #[test]
    fn families_from_folder_names() {
        assert_eq!(
            SensorFamily::from_product_name("S2A_MSIL2A_20231105T053031_N0509_R105_T43RFN_20231105T085010.SAFE"),
            Some(SensorFamily::Sentinel2)
        );
        assert_eq!(
            SensorFamily::from_product_name("LC09_L2SP_148039_20231103_20231104_02_T1"),
            Some(SensorFamily::Landsat)
        );
        assert_eq!(SensorFamily::from_product_name("notes"), None);
    }

    #[test]
    fn sentinel2_bands_resolve_across_resolution_folders() {
        let dir = tempfile::tempdir().unwrap();
        let product = dir.path().join("S2A_MSIL2A_20231105T053031_N0509_R105_T43RFN_20231105T085010.SAFE");
        let img = product.join("GRANULE/L2A_T43RFN_A043683_20231105T053611/IMG_DATA");
        for code in ["B02", "B03", "B04", "B08"] {
            touch(&img.join(format!("R10m/T43RFN_20231105T053031_{}_10m.tif", code)));
        }
        touch(&img.join("R20m/T43RFN_20231105T053031_B11_20m.tif"));

        let p = Product::from_path(product).unwrap();
        let set = locate_all(&p).unwrap();
        assert!(set.path(BandRole::Swir1).to_string_lossy().contains("R20m"));
        assert!(set.path(BandRole::Nir).to_string_lossy().ends_with("_B08_10m.tif"));
    }

    #[test]
    fn landsat_missing_band_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let product = dir.path().join("LC08_L2SP_148039_20231103_20231104_02_T1");
        for code in ["SR_B2", "SR_B3", "SR_B4", "SR_B6"] {
            touch(&product.join(format!("LC08_L2SP_148039_20231103_20231104_02_T1_{}.TIF", code)));
        }
        let p = Product::from_path(product).unwrap();
        assert!(locate(&p, BandRole::Red).is_some());
        match locate_all(&p) {
            Err(PipelineError::MissingBands { missing, .. }) => {
                assert_eq!(missing, vec![BandRole::Nir])
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn jpeg2000_only_band_counts_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let product = dir.path().join("LC09_L2SP_1_2_3_02_T1");
        touch(&product.join("LC09_L2SP_1_2_3_02_T1_SR_B4.jp2"));
        let p = Product::from_path(product).unwrap();
        assert!(locate(&p, BandRole::Red).is_none());
    }
}
