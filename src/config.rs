//! Run configuration, loaded once at start and passed to every component.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputLayout {
    /// One `.npy` file per kept patch.
    Individual,
    /// One `.npz` per date holding every kept patch.
    Batched,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LandCoverConfig {
    pub enabled: bool,
    pub stac_url: String,
    pub collection: String,
    pub asset: String,
    /// Class code marking cropland in the land-cover raster.
    pub cropland_class: u8,
    /// SAS token endpoint used to sign asset hrefs; unsigned when absent.
    pub token_url: Option<String>,
    /// STAC datetime filter, e.g. `2023-01-01/2023-12-31`.
    pub datetime: Option<String>,
    pub timeout_secs: u64,
}

impl Default for LandCoverConfig {
    fn default() -> Self {
        LandCoverConfig {
            enabled: true,
            stac_url: "https://planetarycomputer.microsoft.com/api/stac/v1".to_string(),
            collection: "io-lulc-9-class".to_string(),
            asset: "data".to_string(),
            cropland_class: 5,
            token_url: Some("https://planetarycomputer.microsoft.com/api/sas/v1/token".to_string()),
            datetime: None,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root holding one folder per event.
    pub raw_data_dir: PathBuf,
    /// Root receiving one folder per event with patches and previews.
    pub processed_data_dir: PathBuf,
    pub events: Vec<String>,
    /// Ground resolution of the common grid, in CRS units (metres).
    pub target_resolution: f64,
    pub patch_size: usize,
    /// Minimum fraction of non-zero NIR pixels for a tile to be kept.
    pub density_threshold: f64,
    pub output_layout: OutputLayout,
    pub previews: bool,
    pub progress: bool,
    /// Parent of the scratch area, `<processed_data_dir>/temp_bands` if unset.
    pub scratch_dir: Option<PathBuf>,
    pub land_cover: LandCoverConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            raw_data_dir: PathBuf::from("data/organize/organized_date"),
            processed_data_dir: PathBuf::from("data/processed"),
            events: Vec::new(),
            target_resolution: 30.0,
            patch_size: 256,
            density_threshold: 0.1,
            output_layout: OutputLayout::Individual,
            previews: true,
            progress: true,
            scratch_dir: None,
            land_cover: LandCoverConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("cannot read {:?}: {}", path, e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.events.is_empty() {
            return Err(PipelineError::Config("no events configured".to_string()));
        }
        if !self.target_resolution.is_finite() || self.target_resolution <= 0.0 {
            return Err(PipelineError::Config(format!(
                "target_resolution must be positive, got {}",
                self.target_resolution
            )));
        }
        if self.patch_size == 0 {
            return Err(PipelineError::Config("patch_size must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.density_threshold) {
            return Err(PipelineError::Config(format!(
                "density_threshold must lie in [0, 1], got {}",
                self.density_threshold
            )));
        }
        Ok(())
    }

    pub fn event_raw_dir(&self, event: &str) -> PathBuf {
        self.raw_data_dir.join(event)
    }

    pub fn event_output_dir(&self, event: &str) -> PathBuf {
        self.processed_data_dir.join(event)
    }

    pub fn visualization_dir(&self, event: &str) -> PathBuf {
        self.event_output_dir(event).join("visualizations")
    }

    pub fn scratch_parent(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| self.processed_data_dir.join("temp_bands"))
    }
}
