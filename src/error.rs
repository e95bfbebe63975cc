use std::path::PathBuf;

use thiserror::Error;

use crate::types::Band;

/// Run-level failures. Per-pixel problems are reported through
/// [`crate::types::FitStatus`] instead and never abort a sweep.
#[derive(Error, Debug)]
pub enum DustMapError {
    #[error("{band:?} image is {found:?} (rows, cols) but expected {expected:?}")]
    InputShapeMismatch {
        band: Band,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("header NAXIS1/NAXIS2 say {expected:?} (cols, rows) but data is {found:?}")]
    MetadataMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid FITS file: {0}")]
    InvalidFits(String),
    #[error("failed to write {path}: {source}")]
    OutputWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DustMapError>;
