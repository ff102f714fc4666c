use std::path::PathBuf;

use thiserror::Error;

use crate::sensor::BandRole;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Unit of work a failure is contained in.
///
/// Failures never propagate past their scope: a product failure drops the
/// product from the day's mosaic, a date failure skips the date, an event
/// failure skips the event. Only `Run` failures stop the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureScope {
    Product,
    Date,
    Event,
    Run,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no reference bands found under {0:?}, cannot build a common grid")]
    NoReferenceBands(PathBuf),

    #[error("event directory {0:?} does not exist")]
    MissingEventDir(PathBuf),

    #[error("product {product:?} is missing bands {missing:?}")]
    MissingBands {
        product: PathBuf,
        missing: Vec<BandRole>,
    },

    #[error("no product contributed data on {0}")]
    NoData(String),

    #[error("raster of {height}x{width} px holds no full {patch_size}px tile")]
    NoTiles {
        height: usize,
        width: usize,
        patch_size: usize,
    },

    #[error("band {path:?} unusable: {source}")]
    BandRead {
        path: PathBuf,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("array shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("cannot allocate {bytes} bytes for {what}")]
    Allocation { what: String, bytes: usize },

    #[error("land-cover catalog: {0}")]
    LandCover(String),

    #[error("unsupported georeferencing in {path:?}: {reason}")]
    Georeference { path: PathBuf, reason: String },

    #[error("coordinate transform failed: {0}")]
    Projection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("failed to read npy: {0}")]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    #[error("failed to map npy: {0}")]
    ViewNpy(#[from] ndarray_npy::ViewNpyError),

    #[error("failed to write npy: {0}")]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),

    #[error("failed to write npz: {0}")]
    WriteNpz(#[from] ndarray_npy::WriteNpzError),

    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("preview rendering failed: {0}")]
    Preview(#[from] image::ImageError),
}

impl PipelineError {
    pub fn scope(&self) -> FailureScope {
        match self {
            PipelineError::Config(_) => FailureScope::Run,
            PipelineError::NoReferenceBands(_) | PipelineError::MissingEventDir(_) => {
                FailureScope::Event
            }
            PipelineError::MissingBands { .. }
            | PipelineError::BandRead { .. }
            | PipelineError::Georeference { .. } => FailureScope::Product,
            // Allocation failures abort the date that asked for the memory.
            _ => FailureScope::Date,
        }
    }

    /// True for the soft per-date outcomes that are expected during a run.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            PipelineError::NoData(_) | PipelineError::NoTiles { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_follow_taxonomy() {
        assert_eq!(PipelineError::Config("x".into()).scope(), FailureScope::Run);
        assert_eq!(
            PipelineError::NoReferenceBands(PathBuf::from("e")).scope(),
            FailureScope::Event
        );
        assert_eq!(
            PipelineError::MissingBands {
                product: PathBuf::from("p"),
                missing: vec![BandRole::Nir],
            }
            .scope(),
            FailureScope::Product
        );
        assert_eq!(PipelineError::NoData("2024-01-01".into()).scope(), FailureScope::Date);
        assert_eq!(PipelineError::ShapeMismatch("3x3 vs 2x2".into()).scope(), FailureScope::Date);
        let unreadable = PipelineError::BandRead {
            path: PathBuf::from("LC08_SR_B5.TIF"),
            source: Box::new(PipelineError::Io(std::io::ErrorKind::UnexpectedEof.into())),
        };
        assert_eq!(unreadable.scope(), FailureScope::Product);
        assert!(PipelineError::NoData("d".into()).is_skip());
        assert!(!PipelineError::LandCover("down".into()).is_skip());
    }
}
