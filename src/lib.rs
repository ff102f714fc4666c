//! Reconciles Sentinel-2 and Landsat products of an event onto one grid,
//! masks them to cropland and cuts fixed-size six-channel patches.

pub mod config;
pub mod error;
pub mod event;
pub mod grid;
pub mod landcover;
pub mod mosaic;
pub mod normalize;
pub mod patches;
pub mod pipeline;
pub mod preview;
pub mod raster;
pub mod scratch;
pub mod sensor;

pub use config::{LandCoverConfig, OutputLayout, PipelineConfig};
pub use error::{FailureScope, PipelineError, Result};
pub use pipeline::{run, run_with, RunSummary};
