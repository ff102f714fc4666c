//! Non-overlapping tiling of a finalized date, the cropland-density gate and
//! patch persistence.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use log::{debug, info};
use ndarray::{s, Array2, Array3, Array4, ArrayView2};
use ndarray_npy::{write_npy, NpzWriter};

use crate::config::OutputLayout;
use crate::error::{PipelineError, Result};
use crate::normalize::{Channel, DailyRaster};
use crate::raster::try_zeros_3d;

/// Anything a date's six channels can be sliced from: the in-memory raster
/// or the memory-mapped band files of a date arena.
pub trait PatchSource {
    fn shape(&self) -> (usize, usize);
    fn channel(&self, channel: Channel) -> Result<ArrayView2<'_, f32>>;
}

impl PatchSource for DailyRaster {
    fn shape(&self) -> (usize, usize) {
        DailyRaster::shape(self)
    }

    fn channel(&self, channel: Channel) -> Result<ArrayView2<'_, f32>> {
        Ok(DailyRaster::channel(self, channel))
    }
}

/// One `[P, P, 6]` tile at tile-grid offset (`row_index`, `col_index`).
#[derive(Debug, Clone)]
pub struct Patch {
    pub row_index: usize,
    pub col_index: usize,
    pub data: Array3<f32>,
}

/// Fraction of non-zero pixels in a tile.
pub fn nonzero_fraction(tile: ArrayView2<'_, f32>) -> f64 {
    if tile.is_empty() {
        return 0.0;
    }
    tile.iter().filter(|&&v| v != 0.0).count() as f64 / tile.len() as f64
}

/// Lazy row-major walk over the tile grid. The nir sub-region decides
/// whether a tile is kept; the six channels are sliced only for kept tiles.
pub struct PatchExtractor<'a, S: PatchSource + ?Sized> {
    source: &'a S,
    patch_size: usize,
    threshold: f64,
    rows: usize,
    cols: usize,
    next: usize,
    kept: usize,
    discarded: usize,
}

impl<'a, S: PatchSource + ?Sized> PatchExtractor<'a, S> {
    pub fn new(source: &'a S, patch_size: usize, threshold: f64) -> Result<Self> {
        let (height, width) = source.shape();
        let (rows, cols) = if patch_size == 0 {
            (0, 0)
        } else {
            (height / patch_size, width / patch_size)
        };
        if rows * cols == 0 {
            return Err(PipelineError::NoTiles {
                height,
                width,
                patch_size,
            });
        }
        Ok(PatchExtractor {
            source,
            patch_size,
            threshold,
            rows,
            cols,
            next: 0,
            kept: 0,
            discarded: 0,
        })
    }

    /// `(H / P) * (W / P)`, the number of tiles before the density gate.
    pub fn candidate_count(&self) -> usize {
        self.rows * self.cols
    }

    pub fn tile_grid(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn kept(&self) -> usize {
        self.kept
    }

    pub fn discarded(&self) -> usize {
        self.discarded
    }

    fn is_dense(&self, row: usize, col: usize) -> Result<bool> {
        let p = self.patch_size;
        let nir = self.source.channel(Channel::Nir)?;
        let tile = nir.slice(s![row * p..(row + 1) * p, col * p..(col + 1) * p]);
        Ok(nonzero_fraction(tile) >= self.threshold)
    }

    fn materialize(&self, row: usize, col: usize) -> Result<Patch> {
        let p = self.patch_size;
        let mut data = try_zeros_3d((p, p, Channel::COUNT), "patch")?;
        for channel in Channel::ALL {
            let band = self.source.channel(channel)?;
            data.slice_mut(s![.., .., channel.index()])
                .assign(&band.slice(s![row * p..(row + 1) * p, col * p..(col + 1) * p]));
        }
        Ok(Patch {
            row_index: row,
            col_index: col,
            data,
        })
    }
}

impl<'a, S: PatchSource + ?Sized> Iterator for PatchExtractor<'a, S> {
    type Item = Result<Patch>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.candidate_count() {
            let (row, col) = (self.next / self.cols, self.next % self.cols);
            self.next += 1;
            match self.is_dense(row, col) {
                Ok(true) => {
                    self.kept += 1;
                    return Some(self.materialize(row, col));
                }
                Ok(false) => self.discarded += 1,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

/// Eager form of [`PatchExtractor`]: every kept tile in row-major order.
pub fn extract<S: PatchSource + ?Sized>(
    source: &S,
    patch_size: usize,
    threshold: f64,
) -> Result<Vec<Patch>> {
    PatchExtractor::new(source, patch_size, threshold)?.collect()
}

/// Where and how a date's patches are written.
pub enum PatchWriter {
    Individual {
        dir: PathBuf,
        written: usize,
    },
    Batched {
        path: PathBuf,
        patch_size: usize,
        data: Vec<f32>,
        offsets: Vec<i64>,
    },
}

impl PatchWriter {
    /// `individual`: `<event_dir>/<date>/patch_<row>_<col>.npy`;
    /// `batched`: `<event_dir>/patches_<date>_<ordinal:02>.npz`.
    pub fn new(
        layout: OutputLayout,
        event_dir: &Path,
        date: &str,
        ordinal: usize,
        patch_size: usize,
    ) -> Self {
        match layout {
            OutputLayout::Individual => PatchWriter::Individual {
                dir: event_dir.join(date),
                written: 0,
            },
            OutputLayout::Batched => PatchWriter::Batched {
                path: event_dir.join(format!("patches_{}_{:02}.npz", date, ordinal)),
                patch_size,
                data: Vec::new(),
                offsets: Vec::new(),
            },
        }
    }

    pub fn push(&mut self, patch: &Patch) -> Result<()> {
        match self {
            PatchWriter::Individual { dir, written } => {
                if *written == 0 {
                    fs::create_dir_all(&*dir)?;
                }
                let path = dir.join(format!("patch_{}_{}.npy", patch.row_index, patch.col_index));
                write_npy(&path, &patch.data)?;
                *written += 1;
            }
            PatchWriter::Batched { data, offsets, .. } => {
                let n = patch.data.len();
                data.try_reserve(n).map_err(|_| PipelineError::Allocation {
                    what: "patch batch".to_string(),
                    bytes: (data.len() + n) * std::mem::size_of::<f32>(),
                })?;
                data.extend(patch.data.iter().copied());
                offsets.push(patch.row_index as i64);
                offsets.push(patch.col_index as i64);
            }
        }
        Ok(())
    }

    /// Flush and return the number of patches persisted. A batched writer
    /// with nothing pushed writes no file.
    pub fn finish(self) -> Result<usize> {
        match self {
            PatchWriter::Individual { dir, written } => {
                if written > 0 {
                    debug!("Wrote {} patch files to {:?}", written, dir);
                }
                Ok(written)
            }
            PatchWriter::Batched {
                path,
                patch_size,
                data,
                offsets,
            } => {
                let n = offsets.len() / 2;
                if n == 0 {
                    return Ok(0);
                }
                let patches = Array4::from_shape_vec((n, patch_size, patch_size, Channel::COUNT), data)?;
                let offsets = Array2::from_shape_vec((n, 2), offsets)?;
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut npz = NpzWriter::new_compressed(BufWriter::new(File::create(&path)?));
                npz.add_array("patches", &patches)?;
                npz.add_array("offsets", &offsets)?;
                npz.finish()?;
                debug!("Wrote {} patches to {:?}", n, path);
                Ok(n)
            }
        }
    }
}

/// Outcome of cutting one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchStats {
    pub rows: usize,
    pub cols: usize,
    pub candidates: usize,
    pub kept: usize,
}

/// Stream every kept tile of `source` into `writer`.
pub fn extract_and_write<S: PatchSource + ?Sized>(
    source: &S,
    patch_size: usize,
    threshold: f64,
    mut writer: PatchWriter,
    date: &str,
) -> Result<(PatchStats, Vec<(usize, usize)>)> {
    info!("Slicing {} data into {}x{} patches", date, patch_size, patch_size);
    let mut extractor = PatchExtractor::new(source, patch_size, threshold)?;
    let mut kept_tiles = Vec::new();
    for patch in extractor.by_ref() {
        let patch = patch?;
        writer.push(&patch)?;
        kept_tiles.push((patch.row_index, patch.col_index));
    }
    let (rows, cols) = extractor.tile_grid();
    let written = writer.finish()?;
    info!(
        "  Filtered {} of {} candidate tiles, saved {} cropland patches for {}",
        extractor.kept(),
        extractor.candidate_count(),
        written,
        date
    );
    Ok((
        PatchStats {
            rows,
            cols,
            candidates: extractor.candidate_count(),
            kept: written,
        },
        kept_tiles,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Axis};
    use ndarray_npy::{read_npy, NpzReader};
    use std::cell::Cell;

    fn raster(h: usize, w: usize, nir: f32) -> DailyRaster {
        let mut data = Array3::from_elem((h, w, 6), 0.5f32);
        data.index_axis_mut(Axis(2), Channel::Nir.index()).fill(nir);
        DailyRaster::from_array(data).unwrap()
    }

    struct CountingSource {
        inner: DailyRaster,
        reads: Cell<usize>,
    }

    impl PatchSource for CountingSource {
        fn shape(&self) -> (usize, usize) {
            self.inner.shape()
        }

        fn channel(&self, channel: Channel) -> Result<ArrayView2<'_, f32>> {
            if channel != Channel::Nir {
                self.reads.set(self.reads.get() + 1);
            }
            Ok(self.inner.channel(channel))
        }
    }

    #[test]
    fn full_nir_keeps_every_tile() {
        let r = raster(512, 512, 100.0);
        let ex = PatchExtractor::new(&r, 256, 0.1).unwrap();
        assert_eq!(ex.candidate_count(), 4);
        let patches: Vec<_> = ex.collect::<Result<_>>().unwrap();
        assert_eq!(patches.len(), 4);
        let order: Vec<_> = patches.iter().map(|p| (p.row_index, p.col_index)).collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        assert_eq!(patches[0].data.dim(), (256, 256, 6));
    }

    #[test]
    fn sparse_corner_is_discarded() {
        let mut r = raster(512, 512, 0.0).data().clone();
        r.slice_mut(s![..10, ..10, Channel::Nir.index()]).fill(100.0);
        let r = DailyRaster::from_array(r).unwrap();
        assert!(extract(&r, 256, 0.1).unwrap().is_empty());
    }

    #[test]
    fn density_exactly_at_threshold_is_kept() {
        let mut data = raster(10, 20, 0.0).data().clone();
        // left tile: 10 of 100 pixels, right tile: 9 of 100
        data.slice_mut(s![0, ..10, Channel::Nir.index()]).fill(1.0);
        data.slice_mut(s![0, 10..19, Channel::Nir.index()]).fill(1.0);
        let r = DailyRaster::from_array(data).unwrap();
        let kept = extract(&r, 10, 0.1).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!((kept[0].row_index, kept[0].col_index), (0, 0));
    }

    #[test]
    fn remainder_is_dropped_and_candidates_counted() {
        for (h, w, p) in [(700, 300, 256), (255, 1000, 256), (64, 64, 16), (100, 37, 9)] {
            let r = raster(h, w, 1.0);
            match PatchExtractor::new(&r, p, 0.1) {
                Ok(ex) => {
                    let expected = (h / p) * (w / p);
                    assert_eq!(ex.candidate_count(), expected);
                    assert_eq!(ex.count(), expected);
                }
                Err(e) => {
                    assert!(matches!(e, PipelineError::NoTiles { .. }));
                    assert_eq!((h / p) * (w / p), 0);
                }
            }
        }
    }

    #[test]
    fn discarded_tiles_never_read_other_channels() {
        let mut data = raster(20, 20, 0.0).data().clone();
        data.slice_mut(s![..10, ..10, Channel::Nir.index()]).fill(1.0);
        let source = CountingSource {
            inner: DailyRaster::from_array(data).unwrap(),
            reads: Cell::new(0),
        };
        let mut ex = PatchExtractor::new(&source, 10, 0.1).unwrap();
        assert!(ex.next().unwrap().is_ok());
        assert_eq!(source.reads.get(), 5);
        assert!(ex.next().is_none());
        assert_eq!(ex.discarded(), 3);
        assert_eq!(source.reads.get(), 5);
    }

    #[test]
    fn individual_layout_writes_one_file_per_patch() {
        let dir = tempfile::tempdir().unwrap();
        let r = raster(8, 12, 1.0);
        let writer = PatchWriter::new(OutputLayout::Individual, dir.path(), "2024-03-01", 0, 4);
        let (stats, kept) = extract_and_write(&r, 4, 0.1, writer, "2024-03-01").unwrap();
        assert_eq!(stats.candidates, 6);
        assert_eq!(stats.kept, 6);
        assert_eq!(kept.len(), 6);
        let p: Array3<f32> = read_npy(dir.path().join("2024-03-01/patch_1_2.npy")).unwrap();
        assert_eq!(p.dim(), (4, 4, 6));
        assert_eq!(p[[0, 0, Channel::Nir.index()]], 1.0);
    }

    #[test]
    fn batched_layout_writes_patches_and_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = raster(8, 8, 0.0).data().clone();
        data.slice_mut(s![4.., ..4, Channel::Nir.index()]).fill(2.0);
        let r = DailyRaster::from_array(data).unwrap();
        let writer = PatchWriter::new(OutputLayout::Batched, dir.path(), "2024-03-01", 3, 4);
        let (stats, _) = extract_and_write(&r, 4, 0.1, writer, "2024-03-01").unwrap();
        assert_eq!(stats.kept, 1);

        let file = File::open(dir.path().join("patches_2024-03-01_03.npz")).unwrap();
        let mut npz = NpzReader::new(file).unwrap();
        let patches: Array4<f32> = npz.by_name("patches").unwrap();
        let offsets: Array2<i64> = npz.by_name("offsets").unwrap();
        assert_eq!(patches.dim(), (1, 4, 4, 6));
        assert_eq!(offsets, ndarray::array![[1i64, 0]]);
    }

    #[test]
    fn empty_batch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PatchWriter::new(OutputLayout::Batched, dir.path(), "d", 0, 4);
        assert_eq!(writer.finish().unwrap(), 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
