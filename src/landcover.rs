//! Cropland mask derivation from an external land-cover catalog.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use ndarray::{Array2, Array3, ArrayView2, Axis, Zip};
use serde::Deserialize;
use serde_json::json;

use crate::config::LandCoverConfig;
use crate::error::{PipelineError, Result};
use crate::grid::CommonGrid;
use crate::raster::warp::{reproject, Resampling};
use crate::raster::{geotiff, transform_bounds, try_zeros_2d, Bounds, Crs, Raster};

/// Source of a land-cover classification raster covering an extent.
pub trait LandCoverSource {
    fn describe(&self) -> String;

    /// One scene covering `bounds` (WGS84 degrees), `None` if the catalog
    /// has no coverage.
    fn fetch(&self, bounds: &Bounds) -> Result<Option<Raster>>;

    /// Class code that marks cropland in the fetched raster.
    fn cropland_class(&self) -> u8;
}

/// Offline source: never has coverage, so every mask is all-true.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLandCover;

impl LandCoverSource for NoLandCover {
    fn describe(&self) -> String {
        "disabled".to_string()
    }

    fn fetch(&self, _bounds: &Bounds) -> Result<Option<Raster>> {
        Ok(None)
    }

    fn cropland_class(&self) -> u8 {
        0
    }
}

#[derive(Debug, Deserialize)]
struct ItemCollection {
    #[serde(default)]
    features: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    id: String,
    #[serde(default)]
    assets: HashMap<String, Asset>,
}

#[derive(Debug, Deserialize)]
struct Asset {
    href: String,
}

#[derive(Debug, Deserialize)]
struct SasToken {
    token: String,
}

/// STAC API search returning the first item of a land-cover collection.
pub struct StacLandCover {
    config: LandCoverConfig,
    client: reqwest::blocking::Client,
    download_dir: PathBuf,
}

impl StacLandCover {
    pub fn new(config: LandCoverConfig, download_dir: PathBuf) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(StacLandCover {
            config,
            client,
            download_dir,
        })
    }

    fn search_body(&self, bounds: &Bounds) -> serde_json::Value {
        let mut body = json!({
            "collections": [self.config.collection],
            "bbox": [bounds.west, bounds.south, bounds.east, bounds.north],
            "limit": 1,
        });
        if let Some(datetime) = &self.config.datetime {
            body["datetime"] = json!(datetime);
        }
        body
    }

    fn sign(&self, href: String) -> Result<String> {
        let Some(token_url) = &self.config.token_url else {
            return Ok(href);
        };
        let url = format!("{}/{}", token_url.trim_end_matches('/'), self.config.collection);
        let token: SasToken = self.client.get(url).send()?.error_for_status()?.json()?;
        Ok(sign_href(&href, &token.token))
    }
}

fn sign_href(href: &str, token: &str) -> String {
    let sep = if href.contains('?') { '&' } else { '?' };
    format!("{}{}{}", href, sep, token)
}

impl LandCoverSource for StacLandCover {
    fn describe(&self) -> String {
        format!("{} at {}", self.config.collection, self.config.stac_url)
    }

    fn fetch(&self, bounds: &Bounds) -> Result<Option<Raster>> {
        let url = format!("{}/search", self.config.stac_url.trim_end_matches('/'));
        let found: ItemCollection = self
            .client
            .post(url)
            .json(&self.search_body(bounds))
            .send()?
            .error_for_status()?
            .json()?;
        let Some(item) = found.features.into_iter().next() else {
            return Ok(None);
        };
        let href = item
            .assets
            .get(&self.config.asset)
            .map(|a| a.href.clone())
            .ok_or_else(|| {
                PipelineError::LandCover(format!(
                    "item {} has no asset {:?}",
                    item.id, self.config.asset
                ))
            })?;
        info!("Land-cover item {} selected", item.id);
        let href = self.sign(href)?;

        fs::create_dir_all(&self.download_dir)?;
        let path = self.download_dir.join(format!("landcover_{}.tif", item.id));
        {
            let mut file = BufWriter::new(File::create(&path)?);
            let bytes = self
                .client
                .get(href)
                .send()?
                .error_for_status()?
                .copy_to(&mut file)?;
            file.flush()?;
            debug!("downloaded {} bytes to {:?}", bytes, path);
        }
        let raster = read_scene_window(&path, bounds);
        if let Err(e) = fs::remove_file(&path) {
            warn!("Could not remove downloaded scene {:?}: {}", path, e);
        }
        raster
    }

    fn cropland_class(&self) -> u8 {
        self.config.cropland_class
    }
}

/// Pixels of the classification beyond the window edge, so nearest
/// resampling never reads outside what was decoded.
const WINDOW_PAD: usize = 2;

/// Decode only the part of a downloaded scene that covers `wgs84` bounds.
fn read_scene_window(path: &Path, wgs84: &Bounds) -> Result<Option<Raster>> {
    let info = geotiff::read_info(path)?;
    let extent = transform_bounds(wgs84, Crs::wgs84(), info.crs)?;
    let window = geotiff::read_window(path, &extent, WINDOW_PAD)?;
    match &window {
        Some(w) => debug!(
            "decoded {}x{} of the {}x{} land-cover scene",
            w.height(),
            w.width(),
            info.height,
            info.width
        ),
        None => warn!("Land-cover scene {:?} does not overlap the grid", path),
    }
    Ok(window)
}

/// Boolean raster on the common grid, true where land cover is cropland.
#[derive(Debug, Clone, PartialEq)]
pub struct CroplandMask {
    data: Array2<bool>,
    from_catalog: bool,
}

impl CroplandMask {
    /// Every pixel counts as cropland.
    pub fn all_true(shape: (usize, usize)) -> Result<Self> {
        let mut data = try_zeros_2d::<bool>(shape, "cropland mask")?;
        data.fill(true);
        Ok(CroplandMask {
            data,
            from_catalog: false,
        })
    }

    pub fn from_array(data: Array2<bool>) -> Self {
        CroplandMask {
            data,
            from_catalog: true,
        }
    }

    /// Nearest-neighbour resample of a classification onto `grid`,
    /// thresholded to `class`.
    pub fn from_land_cover(land_cover: &Raster, grid: &CommonGrid, class: u8) -> Result<Self> {
        let classes = reproject(land_cover, grid, Resampling::Nearest)?;
        let target = class as f32;
        Ok(CroplandMask {
            data: classes.mapv(|v| v == target),
            from_catalog: true,
        })
    }

    /// Query `source` for the grid's extent; any failure or missing coverage
    /// degrades to the all-true mask.
    pub fn resolve(grid: &CommonGrid, source: &dyn LandCoverSource) -> Result<Self> {
        info!("Fetching cropland mask from {}", source.describe());
        let fetched = transform_bounds(&grid.bounds(), grid.crs, Crs::wgs84())
            .and_then(|wgs84| source.fetch(&wgs84));
        let mask = match fetched {
            Ok(Some(scene)) => {
                match CroplandMask::from_land_cover(&scene, grid, source.cropland_class()) {
                    Ok(mask) => mask,
                    Err(e @ PipelineError::Allocation { .. }) => return Err(e),
                    Err(e) => {
                        warn!("Could not resample land cover ({}), using a full mask", e);
                        CroplandMask::all_true(grid.shape())?
                    }
                }
            }
            Ok(None) => {
                warn!("No land use/land cover data found, using a full mask");
                CroplandMask::all_true(grid.shape())?
            }
            Err(e) => {
                warn!("Land-cover query failed ({}), using a full mask", e);
                CroplandMask::all_true(grid.shape())?
            }
        };
        if mask.from_catalog {
            info!(
                "Cropland mask fetched, {:.2}% of the area is cropland",
                mask.cropland_fraction() * 100.0
            );
        }
        Ok(mask)
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn view(&self) -> ArrayView2<'_, bool> {
        self.data.view()
    }

    pub fn is_from_catalog(&self) -> bool {
        self.from_catalog
    }

    pub fn is_all_true(&self) -> bool {
        self.data.iter().all(|&v| v)
    }

    pub fn cropland_fraction(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().filter(|&&v| v).count() as f64 / self.data.len() as f64
    }

    /// Zero every channel of a `(H, W, C)` stack outside cropland.
    pub fn apply(&self, stack: &mut Array3<f32>) {
        for mut channel in stack.axis_iter_mut(Axis(2)) {
            Zip::from(&mut channel).and(&self.data).for_each(|v, &keep| {
                if !keep {
                    *v = 0.0;
                }
            });
        }
    }
}
