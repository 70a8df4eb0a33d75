// ========================================================================================
//
//                              Bucket persistence worker
//
// ========================================================================================
//
// The merge scan hands each completed bucket to a single worker over a bounded channel.
// The worker turns per-class call arrays into masks and appends them to the contig's
// chunked store, so writes stay strictly ordered while the scan accumulates the next
// bucket. The channel bound caps how far the scan can run ahead.

use super::IngestError;
use super::accumulator::BucketAccumulator;
use crate::chunked::ChunkedStoreWriter;
use crate::layout::{ContigEntry, FileNames, StoreLayout};
use crossbeam_channel::Receiver;
use flate2::Compression;
use log::{debug, info};
use std::time::Instant;

pub enum PersistCommand {
    Bucket(BucketAccumulator),
    /// Every bucket of the named contig has been sent.
    SealContig(String),
}

struct OpenContig {
    writer: ChunkedStoreWriter,
    file: String,
    buckets: usize,
    variants: usize,
    started: Instant,
}

/// Runs until the sender side closes. Returns one entry per sealed contig, in seal order.
/// The first I/O failure ends the worker; the scan sees a closed channel.
pub fn run_persistence_worker(
    commands: Receiver<PersistCommand>,
    layout: StoreLayout,
    patient_count: usize,
    compression: Compression,
) -> Result<Vec<ContigEntry>, IngestError> {
    let mut sealed = Vec::new();
    let mut open: Option<OpenContig> = None;
    let mut names = FileNames::new();

    for command in commands {
        match command {
            PersistCommand::Bucket(accumulator) => {
                let contig = accumulator.contig.clone();
                let bucket_id = accumulator.bucket_id;
                let switching = open
                    .as_ref()
                    .is_none_or(|state| state.writer.contig() != &*contig);
                if switching {
                    if let Some(previous) = open.take() {
                        sealed.push(seal(previous)?);
                    }
                    let file = names.mask_file(&contig);
                    let writer = ChunkedStoreWriter::create(
                        &layout.resolve(&file),
                        &contig,
                        patient_count,
                        compression,
                    )?;
                    open = Some(OpenContig {
                        writer,
                        file,
                        buckets: 0,
                        variants: 0,
                        started: Instant::now(),
                    });
                }
                let Some(state) = open.as_mut() else {
                    continue;
                };
                let bucket = accumulator.into_bucket();
                if bucket.is_empty() {
                    continue;
                }
                state.variants += bucket.len();
                state.buckets += 1;
                state.writer.put(bucket_id, &bucket)?;
            }
            PersistCommand::SealContig(contig) => match open.take() {
                Some(state) if state.writer.contig() == contig => sealed.push(seal(state)?),
                other => {
                    open = other;
                    debug!("contig '{contig}' produced no variants; nothing to seal");
                }
            },
        }
    }

    if let Some(state) = open.take() {
        sealed.push(seal(state)?);
    }
    Ok(sealed)
}

fn seal(state: OpenContig) -> Result<ContigEntry, IngestError> {
    let name = state.writer.contig().to_string();
    state.writer.seal()?;
    info!(
        "> Sealed contig {name}: {} variants in {} buckets ({:.2?})",
        state.variants,
        state.buckets,
        state.started.elapsed()
    );
    Ok(ContigEntry {
        name,
        file: state.file,
        buckets: state.buckets,
        variants: state.variants,
    })
}
