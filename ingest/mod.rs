// ========================================================================================
//
//                                  Store construction
//
// ========================================================================================
//
// Builds a sealed store from a manifest of per-sample variant-call files: one walker
// per file, a k-way merge over their sorted records, per-bucket accumulation of zygosity
// calls, and a dedicated persistence worker that writes finished buckets in order.

pub mod accumulator;
pub mod annotations;
pub mod contigs;
pub mod flip;
pub mod manifest;
pub mod merge;
pub mod walker;

pub use manifest::{ManifestEntry, SampleBinding, read_manifest, roster_from_manifest};
pub use merge::{IngestSummary, ingest, ingest_entries};

use crate::error::StoreError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("manifest '{path}': {reason}")]
    Manifest { path: PathBuf, reason: String },
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("'{path}' line {line}: {reason}")]
    Format {
        path: PathBuf,
        line: u64,
        reason: String,
    },
    #[error("sample '{sample}' listed in the manifest is not a column of '{path}'")]
    SampleMissing { path: PathBuf, sample: String },
    #[error("'{path}' is not sorted: '{current}' follows '{previous}'")]
    Unsorted {
        path: PathBuf,
        previous: String,
        current: String,
    },
    #[error(
        "'{path}' presents contig '{contig}' after that contig was already completed; inputs must share one contig order"
    )]
    ContigOrder { path: PathBuf, contig: String },
    #[error("input files disagree on the order of contigs {}", .contigs.join(", "))]
    ContigConflict { contigs: Vec<String> },
    #[error("the manifest lists no input files")]
    NoInputs,
    #[error("the persistence worker stopped before ingestion finished")]
    PersistenceStopped,
    #[error("the persistence worker panicked")]
    PersistencePanicked,
    #[error("could not start worker threads: {0}")]
    Threads(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
