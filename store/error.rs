use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failures reading or writing a store's files.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("'{path}' is corrupt or was never sealed: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error(
        "bucket {bucket} of contig '{contig}' arrived after bucket {previous}; buckets must be written in strictly ascending order"
    )]
    BucketOrder {
        contig: String,
        previous: u32,
        bucket: u32,
    },
    #[error("variant '{variant}' does not belong to the '{contig}' store")]
    ContigMismatch { contig: String, variant: String },
    #[error("mask for variant '{variant}' has width {found}, but the store holds {expected} patients")]
    MaskWidth {
        variant: String,
        expected: usize,
        found: usize,
    },
    #[error("store manifest '{path}' could not be parsed: {source}")]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("store manifest could not be serialized: {0}")]
    ManifestWrite(#[from] toml::ser::Error),
    #[error("info index payload is invalid: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store at '{path}' is inconsistent: {reason}")]
    Inconsistent { path: PathBuf, reason: String },
}

impl StoreError {
    pub fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Attaches the offending path to a raw I/O error.
pub trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T, StoreError>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T, StoreError> {
        self.map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
