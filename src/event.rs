//! `event_dir/date_dir/product_dir` layout discovery.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::sensor::Product;

/// Products of one event grouped by date folder, dates in lexical order.
#[derive(Debug, Clone)]
pub struct EventLayout {
    pub name: String,
    pub root: PathBuf,
    pub dates: BTreeMap<String, Vec<Product>>,
}

impl EventLayout {
    pub fn products(&self) -> impl Iterator<Item = &Product> {
        self.dates.values().flatten()
    }

    pub fn product_count(&self) -> usize {
        self.dates.values().map(Vec::len).sum()
    }
}

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry_r in fs::read_dir(dir)? {
        let entry = match entry_r {
            Ok(en) => en,
            Err(e) => {
                warn!("Skipping an entry of {:?} due to read_dir error: {:?}", dir, e);
                continue;
            }
        };
        if entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
            out.push(entry.path());
        } else {
            debug!("Skipping non-dir {:?}", entry.path());
        }
    }
    out.sort();
    Ok(out)
}

/// Enumerate every date folder and its recognised product folders.
pub fn scan_event(name: &str, event_dir: &Path) -> Result<EventLayout> {
    if !event_dir.is_dir() {
        return Err(PipelineError::MissingEventDir(event_dir.to_path_buf()));
    }
    let mut dates = BTreeMap::new();
    for date_dir in subdirectories(event_dir)? {
        let date = date_dir
            .file_name()
            .map(|os| os.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut products = Vec::new();
        let candidates = match subdirectories(&date_dir) {
            Ok(c) => c,
            Err(e) => {
                warn!("Cannot read date folder {:?}: {}", date_dir, e);
                continue;
            }
        };
        for candidate in candidates {
            match Product::from_path(candidate.clone()) {
                Some(p) => products.push(p),
                None => debug!("Skipping {:?}, not a recognised product folder", candidate),
            }
        }
        dates.insert(date, products);
    }
    debug!(
        "event {}: {} dates, {} products",
        name,
        dates.len(),
        dates.values().map(Vec::len).sum::<usize>()
    );
    Ok(EventLayout {
        name: name.to_string(),
        root: event_dir.to_path_buf(),
        dates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::SensorFamily;

    #[test]
    fn dates_are_sorted_and_unknown_folders_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Ropar-wheatRust");
        fs::create_dir_all(root.join("2024-02-10/LC09_L2SP_148039_20240210_02_T1")).unwrap();
        fs::create_dir_all(root.join("2024-01-05/S2B_MSIL2A_20240105.SAFE")).unwrap();
        fs::create_dir_all(root.join("2024-01-05/thumbnails")).unwrap();
        fs::write(root.join("README.txt"), "x").unwrap();

        let layout = scan_event("Ropar-wheatRust", &root).unwrap();
        let dates: Vec<_> = layout.dates.keys().cloned().collect();
        assert_eq!(dates, vec!["2024-01-05", "2024-02-10"]);
        assert_eq!(layout.product_count(), 2);
        assert_eq!(layout.dates["2024-01-05"][0].family, SensorFamily::Sentinel2);
    }

    #[test]
    fn missing_event_dir_is_event_scoped() {
        let err = scan_event("nope", Path::new("/definitely/not/here")).unwrap_err();
        assert_eq!(err.scope(), crate::error::FailureScope::Event);
    }
}
