//! Scratch space for intermediate band files.
//!
//! A `ScratchArea` exists for the whole run and a `DateArena` for one
//! (event, date). Both delete their directories when dropped, which covers
//! normal completion, early error returns and panics that unwind. Runs that
//! were killed outright leave `run_*` directories behind; the next
//! `ScratchArea::create` under the same parent removes them.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use memmap2::Mmap;
use ndarray::{Array2, ArrayView2};
use ndarray_npy::{read_npy, write_npy, ViewNpyExt};
use tempfile::TempDir;

use crate::error::{PipelineError, Result};
use crate::normalize::{Channel, DailyRaster};
use crate::patches::PatchSource;

const RUN_PREFIX: &str = "run_";

pub struct ScratchArea {
    dir: Option<TempDir>,
    parent: PathBuf,
    created_parent: bool,
}

impl ScratchArea {
    /// Fresh uniquely named directory under `parent`, after clearing the
    /// leftovers of abandoned runs.
    pub fn create(parent: &Path) -> Result<Self> {
        let created_parent = !parent.exists();
        if created_parent {
            fs::create_dir_all(parent)?;
        } else {
            let removed = purge_stale(parent);
            if removed > 0 {
                info!("Removed {} stale scratch area(s) under {:?}", removed, parent);
            }
        }
        let dir = tempfile::Builder::new().prefix(RUN_PREFIX).tempdir_in(parent)?;
        debug!("Scratch area at {:?}", dir.path());
        Ok(ScratchArea {
            dir: Some(dir),
            parent: parent.to_path_buf(),
            created_parent,
        })
    }

    pub fn path(&self) -> &Path {
        match &self.dir {
            Some(dir) => dir.path(),
            None => &self.parent,
        }
    }

    /// Directory for land-cover downloads.
    pub fn downloads(&self) -> Result<PathBuf> {
        let dir = self.path().join("downloads");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn date_arena(&self, event: &str, date: &str) -> Result<DateArena> {
        let dir = self.path().join(format!("{}_{}", event, date));
        fs::create_dir_all(&dir)?;
        Ok(DateArena { dir })
    }
}

impl Drop for ScratchArea {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!("Removed scratch area {:?}", path),
                Err(e) => warn!("Could not remove scratch area {:?}: {}", path, e),
            }
        }
        if self.created_parent {
            // Fails while another run still uses the parent.
            let _ = fs::remove_dir(&self.parent);
        }
    }
}

/// Delete every `run_*` directory under `parent` and return how many went.
/// Used at start-up and from the interrupt handler, so errors are only logged.
pub fn purge_stale(parent: &Path) -> usize {
    let entries = match fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot list scratch parent {:?}: {}", parent, e);
            return 0;
        }
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_run = entry.file_name().to_string_lossy().starts_with(RUN_PREFIX);
        if !is_run || !path.is_dir() {
            continue;
        }
        match fs::remove_dir_all(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Could not remove stale scratch area {:?}: {}", path, e),
        }
    }
    removed
}

/// Per-date subdirectory holding the six finalized channels.
pub struct DateArena {
    dir: PathBuf,
}

impl DateArena {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Persist each channel as `<channel>.npy` and map them back.
    pub fn store(&self, raster: &DailyRaster) -> Result<BandFiles> {
        for channel in Channel::ALL {
            let band = raster.channel(channel);
            write_npy(self.band_path(channel), &band.as_standard_layout())?;
        }
        BandFiles::open(&self.dir)
    }

    fn band_path(&self, channel: Channel) -> PathBuf {
        band_path(&self.dir, channel)
    }
}

impl Drop for DateArena {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            warn!("Could not remove date arena {:?}: {}", self.dir, e);
        }
    }
}

fn band_path(dir: &Path, channel: Channel) -> PathBuf {
    dir.join(format!("{}.npy", channel.name()))
}

enum BandData {
    Mapped(Mmap),
    Loaded(Array2<f32>),
}

/// The six channel files of a date, memory-mapped so that cutting one tile
/// only touches the pages it covers.
pub struct BandFiles {
    bands: Vec<BandData>,
    shape: (usize, usize),
}

impl BandFiles {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut bands = Vec::with_capacity(Channel::COUNT);
        let mut shape: Option<(usize, usize)> = None;
        for channel in Channel::ALL {
            let path = band_path(dir, channel);
            let file = File::open(&path)?;
            // The arena owns these files and nothing rewrites them while mapped.
            let mmap = unsafe { Mmap::map(&file)? };
            let (data, dim) = match ArrayView2::<f32>::view_npy(&mmap[..]) {
                Ok(view) => {
                    let dim = view.dim();
                    (BandData::Mapped(mmap), dim)
                }
                Err(e) => {
                    debug!("Cannot map {:?} ({}), reading it instead", path, e);
                    let array: Array2<f32> = read_npy(&path)?;
                    let dim = array.dim();
                    (BandData::Loaded(array), dim)
                }
            };
            match shape {
                None => shape = Some(dim),
                Some(s) if s != dim => {
                    return Err(PipelineError::ShapeMismatch(format!(
                        "band {} is {:?}, expected {:?}",
                        channel, dim, s
                    )))
                }
                Some(_) => {}
            }
            bands.push(data);
        }
        Ok(BandFiles {
            bands,
            shape: shape.unwrap_or((0, 0)),
        })
    }
}

impl PatchSource for BandFiles {
    fn shape(&self) -> (usize, usize) {
        self.shape
    }

    fn channel(&self, channel: Channel) -> Result<ArrayView2<'_, f32>> {
        match &self.bands[channel.index()] {
            BandData::Mapped(mmap) => Ok(ArrayView2::<f32>::view_npy(&mmap[..])?),
            BandData::Loaded(array) => Ok(array.view()),
        }
    }
}
