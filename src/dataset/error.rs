use std::path::PathBuf;

use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Error, Debug)]
pub enum DatasetError {
    // Configuration errors, raised before any image is touched
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    // Per-file errors
    #[error("Failed to decode image {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Image {} has {found} channel(s) but the patch shape expects {expected}", .path.display())]
    ShapeMismatch {
        path: PathBuf,
        expected: usize,
        found: usize,
    },

    // Phase store errors
    #[error("Row counts disagree in {}: img={img}, label={label}, filename={filename}", .path.display())]
    RowCountMismatch {
        path: PathBuf,
        img: u64,
        label: u64,
        filename: u64,
    },

    #[error("Batch layout does not match array '{array}': expected {expected}, found {found}")]
    LayoutMismatch {
        array: &'static str,
        expected: String,
        found: String,
    },

    #[error("Corrupt phase store {}: {reason}", .path.display())]
    CorruptStore { path: PathBuf, reason: String },

    #[error("Phase store {} was never finalized", .0.display())]
    StoreNotFinalized(PathBuf),

    #[error("Phase store {} has no array named '{name}'", .path.display())]
    UnknownArray { path: PathBuf, name: String },

    #[error("Row {index} is out of range for array '{array}' in {} ({rows} rows)", .path.display())]
    RowOutOfRange {
        path: PathBuf,
        array: String,
        index: u64,
        rows: u64,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Manifest error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Failed to build worker pool: {0}")]
    ThreadPoolError(#[from] rayon::ThreadPoolBuildError),
}

impl DatasetError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        DatasetError::InvalidConfiguration(msg.into())
    }
}
