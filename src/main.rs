use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use cropland_patch_preprocessing::scratch::purge_stale;
use cropland_patch_preprocessing::{run, OutputLayout, PipelineConfig};

#[derive(Parser, Debug)]
#[command(name = "cropland-patches", version = "0.1.0")]
struct Args {
    /// TOML configuration file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root directory holding one folder per event
    #[arg(long)]
    raw_data_dir: Option<PathBuf>,

    /// Output directory for patches, previews and the run summary
    #[arg(long)]
    processed_data_dir: Option<PathBuf>,

    /// Event to process (repeatable)
    #[arg(long = "event")]
    events: Vec<String>,

    /// Common grid resolution in metres
    #[arg(long)]
    target_resolution: Option<f64>,

    /// Patch edge length in pixels
    #[arg(long)]
    patch_size: Option<usize>,

    /// Minimum non-zero NIR fraction for a patch to be kept
    #[arg(long)]
    density_threshold: Option<f64>,

    #[arg(long, value_enum)]
    output_layout: Option<OutputLayout>,

    /// Skip the land-cover query and use a full cropland mask
    #[arg(long)]
    no_land_cover: bool,

    /// Do not write PNG previews
    #[arg(long)]
    no_previews: bool,

    /// Hide progress bars
    #[arg(long)]
    no_progress: bool,
}

impl Args {
    fn into_config(self) -> Result<PipelineConfig> {
        let mut cfg = match &self.config {
            Some(path) => PipelineConfig::load(path)
                .with_context(|| format!("loading configuration {:?}", path))?,
            None => PipelineConfig::default(),
        };
        if let Some(dir) = self.raw_data_dir {
            cfg.raw_data_dir = dir;
        }
        if let Some(dir) = self.processed_data_dir {
            cfg.processed_data_dir = dir;
        }
        if !self.events.is_empty() {
            cfg.events = self.events;
        }
        if let Some(res) = self.target_resolution {
            cfg.target_resolution = res;
        }
        if let Some(p) = self.patch_size {
            cfg.patch_size = p;
        }
        if let Some(t) = self.density_threshold {
            cfg.density_threshold = t;
        }
        if let Some(layout) = self.output_layout {
            cfg.output_layout = layout;
        }
        if self.no_land_cover {
            cfg.land_cover.enabled = false;
        }
        if self.no_previews {
            cfg.previews = false;
        }
        if self.no_progress {
            cfg.progress = false;
        }
        Ok(cfg)
    }
}

/// SIGINT/SIGTERM never unwind, so the scratch area's destructor would not
/// run. Remove it from the handler and exit with the conventional 130.
fn install_interrupt_cleanup(scratch_parent: PathBuf) -> Result<()> {
    let owns_parent = !scratch_parent.exists();
    ctrlc::set_handler(move || {
        warn!("Interrupted, removing scratch data under {:?}", scratch_parent);
        purge_stale(&scratch_parent);
        if owns_parent {
            let _ = std::fs::remove_dir(&scratch_parent);
        }
        std::process::exit(130);
    })
    .context("installing interrupt handler")
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();
    info!("=== cropland-patches start ===");

    let args = Args::parse();
    info!("Parsed command-line args: {:?}", args);
    let config = args.into_config()?;
    config.validate().context("invalid configuration")?;
    info!(
        "Events: {:?}, resolution {} m, patch size {}, layout {:?}",
        config.events, config.target_resolution, config.patch_size, config.output_layout
    );

    install_interrupt_cleanup(config.scratch_parent())?;
    let summary = run(&config).context("preprocessing run failed")?;
    info!(
        "=== Done. {} patches written under {:?} ===",
        summary.total_patches(),
        config.processed_data_dir
    );
    Ok(())
}
