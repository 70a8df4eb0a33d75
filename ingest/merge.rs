// ========================================================================================
//
//                           K-way merge of variant-call files
//
// ========================================================================================
//
// Every input file is sorted by position within each contig, and a survey of the inputs
// first settles one contig order they all agree with. The store is then built in one
// pass: a min-heap of walker cursors yields keys in that order, walkers sharing the key
// are folded into that variant's accumulator, and a bucket is handed to the persistence
// worker as soon as the scan leaves it. Buckets of a contig therefore leave in strictly
// ascending order, and a contig is sealed the moment the scan moves past it.

use super::IngestError;
use super::accumulator::{BucketAccumulator, ZygosityAccumulator};
use super::annotations::InfoAccumulator;
use super::contigs::ContigRanks;
use super::flip::{PersistCommand, run_persistence_worker};
use super::manifest::{ManifestEntry, read_manifest, roster_from_manifest};
use super::walker::{VcfWalker, WalkerRecord, survey_contigs};
use crate::config::StoreConfig;
use crate::info::InfoColumnEntry;
use crate::layout::{ContigEntry, FileNames, StoreLayout, StoreManifest, write_store_metadata};
use crate::pool::sized_pool;
use crate::spec_index::VariantSpecIndex;
use crate::variant::VariantKey;
use ahash::{AHashMap, AHashSet};
use crossbeam_channel::{Sender, bounded};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Walker groups at least this large fold their genotypes on the thread pool.
const PARALLEL_FOLD_THRESHOLD: usize = 32;

#[derive(Debug, Clone)]
pub struct IngestSummary {
    pub patients: usize,
    pub variants: usize,
    pub records: u64,
    pub contigs: Vec<ContigEntry>,
    pub info_columns: usize,
    pub malformed_info: u64,
    pub elapsed: Duration,
}

/// Reads the manifest at `manifest` and builds a sealed store at `output`.
pub fn ingest(
    manifest: &Path,
    output: &Path,
    config: &StoreConfig,
) -> Result<IngestSummary, IngestError> {
    let entries = read_manifest(manifest)?;
    ingest_entries(&entries, output, config)
}

fn create_progress_bar(message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(10)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(None, draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("> [{elapsed_precise}] {spinner} {human_pos} records {msg}")
    {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb
}

pub fn ingest_entries(
    entries: &[ManifestEntry],
    output: &Path,
    config: &StoreConfig,
) -> Result<IngestSummary, IngestError> {
    let started = Instant::now();
    if entries.is_empty() {
        return Err(IngestError::NoInputs);
    }

    // --- 1. Roster and walkers; every input is validated before the output exists ---
    let roster = roster_from_manifest(entries);
    let mut walkers = entries
        .iter()
        .map(|entry| VcfWalker::open(entry, &roster))
        .collect::<Result<Vec<_>, _>>()?;
    let pool = sized_pool(config.threads()).map_err(|e| IngestError::Threads(e.to_string()))?;
    let per_file = pool.install(|| {
        entries
            .par_iter()
            .map(survey_contigs)
            .collect::<Result<Vec<_>, _>>()
    })?;
    let ranks = ContigRanks::merge(&per_file)?;
    info!("Contig order: {}", ranks.order().join(", "));

    // --- 2. Output layout ---
    let layout = StoreLayout::new(output);
    layout.create()?;
    eprintln!(
        "> Building store at {} for {} patients from {} files",
        output.display(),
        roster.len(),
        entries.len()
    );
    let mut descriptions = AHashMap::new();
    for walker in walkers.iter().filter(|w| w.is_annotated()) {
        for (id, description) in &walker.info_header().descriptions {
            descriptions
                .entry(id.clone())
                .or_insert_with(|| description.clone());
        }
    }

    // --- 3. Scan and persistence, as a two-stage pipeline ---
    let (sender, receiver) = bounded(config.persistence_queue_depth);
    let compression = config.compression();
    let patient_count = roster.len();

    let (scanned, persisted) = thread::scope(|s| {
        let worker = s.spawn({
            let layout = layout.clone();
            move || run_persistence_worker(receiver, layout, patient_count, compression)
        });

        let scan = MergeScan {
            patient_count,
            ranks,
            sender,
            specs: VariantSpecIndex::new(),
            info: InfoAccumulator::new(config, descriptions),
            bucket: None,
            contig: None,
            completed: AHashSet::new(),
        };
        let scanned = scan.run(&mut walkers, &pool);
        let persisted = worker
            .join()
            .map_err(|_| IngestError::PersistencePanicked)
            .and_then(|result| result);
        (scanned, persisted)
    });

    // A stopped worker carries the root cause.
    let (specs, info, records) = match scanned {
        Ok(parts) => parts,
        Err(IngestError::PersistenceStopped) => {
            persisted?;
            return Err(IngestError::PersistenceStopped);
        }
        Err(e) => return Err(e),
    };
    let contigs = persisted?;

    // --- 4. Info indexes and metadata ---
    let malformed_info = info.malformed();
    let columns = info.finish();
    let mut info_entries = Vec::with_capacity(columns.len());
    let mut names = FileNames::new();
    for column in &columns {
        let file = names.info_file(&column.meta.key);
        column.write_to(&layout.resolve(&file))?;
        info_entries.push(InfoColumnEntry {
            file,
            meta: column.meta.clone(),
        });
    }

    let manifest = StoreManifest::new(roster.len(), specs.len(), contigs.clone(), info_entries);
    write_store_metadata(&layout, &roster, &specs, &manifest)?;

    let summary = IngestSummary {
        patients: roster.len(),
        variants: specs.len(),
        records,
        contigs,
        info_columns: columns.len(),
        malformed_info,
        elapsed: started.elapsed(),
    };
    eprintln!(
        "> Store sealed: {} variants over {} contigs, {} info columns ({:.2?})",
        summary.variants,
        summary.contigs.len(),
        summary.info_columns,
        summary.elapsed
    );
    Ok(summary)
}

// ========================================================================================
//                                    The merge scan
// ========================================================================================

struct HeapItem {
    /// Position of the key's contig in the shared contig order.
    rank: usize,
    key: VariantKey,
    walker: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.key == other.key && self.walker == other.walker
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; ties resolve by walker index.
        other
            .rank
            .cmp(&self.rank)
            .then_with(|| other.key.cmp(&self.key))
            .then_with(|| other.walker.cmp(&self.walker))
    }
}

struct MergeScan {
    patient_count: usize,
    ranks: ContigRanks,
    sender: Sender<PersistCommand>,
    specs: VariantSpecIndex,
    info: InfoAccumulator,
    bucket: Option<BucketAccumulator>,
    contig: Option<Arc<str>>,
    completed: AHashSet<Arc<str>>,
}

impl MergeScan {
    fn run(
        mut self,
        walkers: &mut [VcfWalker],
        pool: &rayon::ThreadPool,
    ) -> Result<(VariantSpecIndex, InfoAccumulator, u64), IngestError> {
        let pb = create_progress_bar("merging");
        let mut heap = BinaryHeap::with_capacity(walkers.len());
        for (index, walker) in walkers.iter().enumerate() {
            if let Some(key) = walker.current_key() {
                heap.push(HeapItem {
                    rank: self.ranks.rank(key.contig()),
                    key: key.clone(),
                    walker: index,
                });
            }
        }

        let mut group = Vec::with_capacity(walkers.len());
        let mut records: Vec<WalkerRecord> = Vec::with_capacity(walkers.len());
        while let Some(HeapItem { key, walker, .. }) = heap.pop() {
            group.clear();
            group.push(walker);
            while heap.peek().is_some_and(|top| top.key == key) {
                if let Some(item) = heap.pop() {
                    group.push(item.walker);
                }
            }

            // --- Contig and bucket boundaries ---
            if self.contig.as_deref() != Some(key.contig()) {
                if self.completed.contains(key.contig()) {
                    return Err(IngestError::ContigOrder {
                        path: walkers[walker].path().to_path_buf(),
                        contig: key.contig().to_string(),
                    });
                }
                self.finish_contig()?;
                info!("Merging contig {}", key.contig());
                self.contig = Some(key.contig_arc().clone());
            }
            if !self.bucket.as_ref().is_some_and(|b| b.holds(&key)) {
                self.flush_bucket()?;
                self.bucket = Some(BucketAccumulator::new(
                    key.contig_arc().clone(),
                    key.bucket(),
                ));
            }

            // --- Consume every walker positioned at this key ---
            records.clear();
            for &index in &group {
                if let Some(record) = walkers[index].take_and_advance()? {
                    records.push(record);
                }
                if let Some(next) = walkers[index].current_key() {
                    heap.push(HeapItem {
                        rank: self.ranks.rank(next.contig()),
                        key: next.clone(),
                        walker: index,
                    });
                }
            }
            self.fold(&key, &records, pool);
            pb.inc(records.len() as u64);
        }

        self.finish_contig()?;
        pb.finish_and_clear();
        let read: u64 = walkers.iter().map(VcfWalker::records_read).sum();
        Ok((self.specs, self.info, read))
    }

    fn fold(&mut self, key: &VariantKey, records: &[WalkerRecord], pool: &rayon::ThreadPool) {
        let patient_count = self.patient_count;
        let folded = if records.len() >= PARALLEL_FOLD_THRESHOLD {
            pool.install(|| {
                records
                    .par_iter()
                    .fold(ZygosityAccumulator::new, |mut acc, record| {
                        for &(slot, class) in &record.calls {
                            acc.record(slot, class, patient_count);
                        }
                        acc
                    })
                    .reduce(ZygosityAccumulator::new, |mut a, b| {
                        a.merge(b);
                        a
                    })
            })
        } else {
            let mut acc = ZygosityAccumulator::new();
            for record in records {
                for &(slot, class) in &record.calls {
                    acc.record(slot, class, patient_count);
                }
            }
            acc
        };
        if let Some(bucket) = self.bucket.as_mut() {
            bucket.variant(key).merge(folded);
        }
        for info in records.iter().filter_map(|r| r.info.as_ref()) {
            self.info.record(key, info);
        }
    }

    /// Assigns ids to the bucket's called variants in key order and hands it off.
    fn flush_bucket(&mut self) -> Result<(), IngestError> {
        let Some(mut bucket) = self.bucket.take() else {
            return Ok(());
        };
        bucket.retain_called();
        if bucket.is_empty() {
            return Ok(());
        }
        for key in bucket.keys() {
            self.specs.push(key.clone());
        }
        debug!(
            "{}: bucket {} complete with {} variants",
            bucket.contig,
            bucket.bucket_id,
            bucket.len()
        );
        self.sender
            .send(PersistCommand::Bucket(bucket))
            .map_err(|_| IngestError::PersistenceStopped)
    }

    fn finish_contig(&mut self) -> Result<(), IngestError> {
        self.flush_bucket()?;
        let Some(contig) = self.contig.take() else {
            return Ok(());
        };
        self.info.flush_contig(&self.specs);
        self.sender
            .send(PersistCommand::SealContig(contig.to_string()))
            .map_err(|_| IngestError::PersistenceStopped)?;
        self.completed.insert(contig);
        Ok(())
    }
}
