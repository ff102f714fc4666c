//! Drives events and dates through grid resolution, mosaicking,
//! normalization and patch extraction, containing every failure at the
//! smallest unit it belongs to.

use std::fs;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::error::{FailureScope, PipelineError, Result};
use crate::event::scan_event;
use crate::grid::{self, CommonGrid};
use crate::landcover::{CroplandMask, LandCoverSource, NoLandCover, StacLandCover};
use crate::mosaic::accumulate;
use crate::normalize::finalize_with;
use crate::patches::{extract_and_write, PatchStats, PatchWriter};
use crate::preview::Previews;
use crate::raster::log_stats;
use crate::scratch::ScratchArea;
use crate::sensor::Product;

pub const SUMMARY_FILE: &str = "run_summary.json";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum EventStatus {
    Processed,
    Skipped { cause: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedDate {
    pub date: String,
    pub cause: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventSummary {
    pub event: String,
    #[serde(flatten)]
    pub status: EventStatus,
    pub cropland_fraction: Option<f64>,
    pub dates_with_patches: Vec<String>,
    pub dates_skipped: Vec<SkippedDate>,
    pub patches_written: usize,
}

impl EventSummary {
    fn new(event: &str) -> Self {
        EventSummary {
            event: event.to_string(),
            status: EventStatus::Processed,
            cropland_fraction: None,
            dates_with_patches: Vec::new(),
            dates_skipped: Vec::new(),
            patches_written: 0,
        }
    }

    fn skipped(event: &str, cause: &PipelineError) -> Self {
        warn!("Skipping event {}: {}", event, cause);
        EventSummary {
            status: EventStatus::Skipped {
                cause: cause.to_string(),
            },
            ..EventSummary::new(event)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub events: Vec<EventSummary>,
}

impl RunSummary {
    pub fn total_patches(&self) -> usize {
        self.events.iter().map(|e| e.patches_written).sum()
    }

    pub fn log(&self) {
        info!("==== Run summary ====");
        for e in &self.events {
            match &e.status {
                EventStatus::Processed => info!(
                    "{}: {} dates with patches, {} dates skipped, {} patches",
                    e.event,
                    e.dates_with_patches.len(),
                    e.dates_skipped.len(),
                    e.patches_written
                ),
                EventStatus::Skipped { cause } => info!("{}: skipped ({})", e.event, cause),
            }
        }
        info!("Total patches written: {}", self.total_patches());
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::Config(format!("cannot serialize summary: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Run every configured event, querying the configured land-cover catalog.
pub fn run(config: &PipelineConfig) -> Result<RunSummary> {
    config.validate()?;
    let scratch = ScratchArea::create(&config.scratch_parent())?;
    let source: Box<dyn LandCoverSource> = if config.land_cover.enabled {
        match StacLandCover::new(config.land_cover.clone(), scratch.downloads()?) {
            Ok(stac) => Box::new(stac),
            Err(e) => {
                warn!("Land-cover catalog unavailable ({}), masks will be full", e);
                Box::new(NoLandCover)
            }
        }
    } else {
        info!("Land-cover masking disabled");
        Box::new(NoLandCover)
    };
    run_in(config, source.as_ref(), &scratch)
}

/// Same as [`run`] with an explicit land-cover source.
pub fn run_with(config: &PipelineConfig, land_cover: &dyn LandCoverSource) -> Result<RunSummary> {
    config.validate()?;
    let scratch = ScratchArea::create(&config.scratch_parent())?;
    run_in(config, land_cover, &scratch)
}

fn run_in(
    config: &PipelineConfig,
    land_cover: &dyn LandCoverSource,
    scratch: &ScratchArea,
) -> Result<RunSummary> {
    fs::create_dir_all(&config.processed_data_dir)?;
    let mut summary = RunSummary::default();
    for event in &config.events {
        info!("{} PROCESSING EVENT: {} {}", "=".repeat(20), event, "=".repeat(20));
        summary.events.push(process_event(config, event, land_cover, scratch)?);
    }
    let path = config.processed_data_dir.join(SUMMARY_FILE);
    if let Err(e) = summary.write(&path) {
        warn!("Could not write {:?}: {}", path, e);
    }
    summary.log();
    Ok(summary)
}

/// Read-only state shared by every date of an event.
struct EventContext<'a> {
    config: &'a PipelineConfig,
    event: &'a str,
    output_dir: PathBuf,
    grid: CommonGrid,
    mask: CroplandMask,
    previews: Previews,
    scratch: &'a ScratchArea,
}

fn progress_bar(len: usize, enabled: bool) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) =
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}/{len:3} {msg}")
    {
        pb.set_style(style.progress_chars("##-"));
    }
    pb
}

/// Process every date of one event. Failures scoped below the run are
/// recorded in the returned summary; `Err` means the whole run must stop.
pub fn process_event(
    config: &PipelineConfig,
    event: &str,
    land_cover: &dyn LandCoverSource,
    scratch: &ScratchArea,
) -> Result<EventSummary> {
    let skip_event = |e: PipelineError| match e.scope() {
        FailureScope::Run => Err(e),
        _ => Ok(EventSummary::skipped(event, &e)),
    };
    let layout = match scan_event(event, &config.event_raw_dir(event)) {
        Ok(layout) => layout,
        Err(e) => return skip_event(e),
    };
    info!(
        "Found {} dates with {} products for {}",
        layout.dates.len(),
        layout.product_count(),
        event
    );
    let (grid, mask) = match grid::resolve(&layout, config.target_resolution, land_cover) {
        Ok(resolved) => resolved,
        Err(e) => return skip_event(e),
    };
    let output_dir = config.event_output_dir(event);
    if let Err(e) = fs::create_dir_all(&output_dir) {
        return skip_event(PipelineError::from(e));
    }

    let mut summary = EventSummary::new(event);
    summary.cropland_fraction = Some(mask.cropland_fraction());
    let ctx = EventContext {
        config,
        event,
        output_dir,
        grid,
        mask,
        previews: Previews::new(config.visualization_dir(event), config.previews),
        scratch,
    };
    ctx.previews.cropland_mask(event, &ctx.mask);

    let total = layout.dates.len();
    let pb = progress_bar(total, config.progress);
    for (ordinal, (date, products)) in layout.dates.iter().enumerate() {
        pb.set_message(date.clone());
        info!("Processing timestep {}/{} (Date: {})", ordinal + 1, total, date);
        match process_date(&ctx, date, ordinal, products) {
            Ok(stats) if stats.kept > 0 => {
                summary.dates_with_patches.push(date.clone());
                summary.patches_written += stats.kept;
            }
            Ok(stats) => {
                let cause = format!(
                    "none of {} candidate tiles passed the cropland-density gate",
                    stats.candidates
                );
                warn!("  Skipping {}: {}", date, cause);
                summary.dates_skipped.push(SkippedDate {
                    date: date.clone(),
                    cause,
                });
            }
            Err(e) => match contain_date_failure(&mut summary, date, e) {
                Ok(Containment::Date) => {}
                Ok(Containment::Event) => {
                    pb.abandon_with_message(format!("{} skipped", event));
                    return Ok(summary);
                }
                Err(e) => {
                    pb.abandon_with_message(format!("{} aborted", event));
                    return Err(e);
                }
            },
        }
        pb.inc(1);
    }
    pb.finish_with_message(format!("{} done", event));
    Ok(summary)
}

enum Containment {
    Date,
    Event,
}

/// Record a failed date at the scope its error belongs to. Run-scoped
/// errors come back as `Err`.
fn contain_date_failure(
    summary: &mut EventSummary,
    date: &str,
    e: PipelineError,
) -> Result<Containment> {
    match e.scope() {
        FailureScope::Run => Err(e),
        FailureScope::Event => {
            warn!("Skipping rest of event {} at {}: {}", summary.event, date, e);
            summary.status = EventStatus::Skipped {
                cause: e.to_string(),
            };
            Ok(Containment::Event)
        }
        FailureScope::Date | FailureScope::Product => {
            if e.is_skip() {
                warn!("  Skipping {}: {}", date, e);
            } else {
                error!("  Date {} failed: {}", date, e);
            }
            summary.dates_skipped.push(SkippedDate {
                date: date.to_string(),
                cause: e.to_string(),
            });
            Ok(Containment::Date)
        }
    }
}

fn process_date(
    ctx: &EventContext<'_>,
    date: &str,
    ordinal: usize,
    products: &[Product],
) -> Result<PatchStats> {
    let mosaic = accumulate(products, &ctx.grid, date)?
        .ok_or_else(|| PipelineError::NoData(date.to_string()))?;
    ctx.previews.composite(date, "01_before_mask", &mosaic.data);

    let mut after = None;
    let raster = finalize_with(mosaic, &ctx.mask, |stack| {
        after = ctx.previews.composite(date, "02_after_mask", stack);
    })?;
    log_stats(raster.data(), &format!("{} final (6 channels)", date));

    let arena = ctx.scratch.date_arena(ctx.event, date)?;
    let bands = arena.store(&raster)?;
    drop(raster);

    let p = ctx.config.patch_size;
    let writer = PatchWriter::new(ctx.config.output_layout, &ctx.output_dir, date, ordinal, p);
    let (stats, kept) = extract_and_write(&bands, p, ctx.config.density_threshold, writer, date)?;
    if ctx.previews.is_enabled() && stats.kept > 0 {
        ctx.previews.patch_grid(date, after, p, &stats, &kept);
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_serializes_status_inline() {
        let mut processed = EventSummary::new("Haryana-RiceBlast");
        processed.dates_with_patches.push("2023-10-01".to_string());
        processed.patches_written = 4;
        let skipped = EventSummary::skipped(
            "Una-yellowRust",
            &PipelineError::MissingEventDir(PathBuf::from("/raw/Una-yellowRust")),
        );
        let summary = RunSummary {
            events: vec![processed, skipped],
        };
        assert_eq!(summary.total_patches(), 4);
        let json: serde_json::Value = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["events"][0]["status"], "processed");
        assert_eq!(json["events"][1]["status"], "skipped");
        assert!(json["events"][1]["cause"].as_str().unwrap().contains("Una-yellowRust"));
    }

    #[test]
    fn missing_event_is_skipped_not_fatal() {
        let root = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            raw_data_dir: root.path().join("raw"),
            processed_data_dir: root.path().join("processed"),
            events: vec!["Nowhere".to_string()],
            previews: false,
            progress: false,
            ..PipelineConfig::default()
        };
        let summary = run_with(&config, &NoLandCover).unwrap();
        assert!(matches!(summary.events[0].status, EventStatus::Skipped { .. }));
        assert!(root.path().join("processed").join(SUMMARY_FILE).exists());
        assert!(!root.path().join("processed/temp_bands").exists());
    }

    #[test]
    fn date_failures_are_contained_by_scope() {
        let mut summary = EventSummary::new("Haryana-RiceBlast");
        let kept = contain_date_failure(
            &mut summary,
            "2023-11-01",
            PipelineError::NoData("2023-11-01".to_string()),
        );
        assert!(matches!(kept, Ok(Containment::Date)));
        let kept = contain_date_failure(
            &mut summary,
            "2023-11-02",
            PipelineError::ShapeMismatch("mask (3, 3) vs (2, 2)".to_string()),
        );
        assert!(matches!(kept, Ok(Containment::Date)));
        assert_eq!(summary.dates_skipped.len(), 2);
        assert_eq!(summary.status, EventStatus::Processed);

        let stop = contain_date_failure(
            &mut summary,
            "2023-11-03",
            PipelineError::NoReferenceBands(PathBuf::from("/raw/Haryana-RiceBlast")),
        );
        assert!(matches!(stop, Ok(Containment::Event)));
        assert!(matches!(summary.status, EventStatus::Skipped { .. }));
        assert_eq!(summary.dates_skipped.len(), 2);

        let fatal = contain_date_failure(
            &mut summary,
            "2023-11-04",
            PipelineError::Config("patch_size must be at least 1".to_string()),
        );
        assert!(matches!(fatal, Err(PipelineError::Config(_))));
        assert_eq!(summary.dates_skipped.len(), 2);
    }

    #[test]
    fn empty_event_list_aborts_the_run() {
        let err = run_with(&PipelineConfig::default(), &NoLandCover).unwrap_err();
        assert_eq!(err.scope(), crate::error::FailureScope::Run);
    }
}
