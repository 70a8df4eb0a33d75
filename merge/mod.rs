// ========================================================================================
//
//                                   Dataset merger
//
// ========================================================================================
//
// Combines two sealed stores over disjoint populations into one: rosters and masks are
// concatenated (first store's patients, then the second's), variant lists reconciled,
// and info indexes unioned after translating the second store's variant ids.

use crate::chunked::ChunkedStoreWriter;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::info::{InfoColumnEntry, InfoColumnIndex};
use crate::layout::{
    ContigEntry, FileNames, GenomicStore, StoreLayout, StoreManifest, write_store_metadata,
};
use crate::mask::{Bucket, MaskRecord};
use crate::pool::{log_and_wait, processor_pool};
use crate::spec_index::{VariantId, VariantSpecIndex};
use flate2::Compression;
use log::{info, warn};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(
        "stores cover different chromosomes (only in the first: {only_first:?}; only in the second: {only_second:?})"
    )]
    ChromosomeMismatch {
        only_first: Vec<String>,
        only_second: Vec<String>,
    },
    #[error("could not start worker threads: {0}")]
    Threads(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct MergeSummary {
    pub patients: usize,
    pub variants: usize,
    pub overlapping_patients: usize,
    pub contigs: Vec<ContigEntry>,
    pub elapsed: Duration,
}

/// Fails unless both stores hold exactly the same contigs.
pub fn check_chromosomes(first: &GenomicStore, second: &GenomicStore) -> Result<(), MergeError> {
    let a: BTreeSet<&str> = first.contigs().collect();
    let b: BTreeSet<&str> = second.contigs().collect();
    if a == b {
        return Ok(());
    }
    Err(MergeError::ChromosomeMismatch {
        only_first: a.difference(&b).map(|c| c.to_string()).collect(),
        only_second: b.difference(&a).map(|c| c.to_string()).collect(),
    })
}

pub fn merge_stores(
    first: &Path,
    second: &Path,
    output: &Path,
    config: &StoreConfig,
) -> Result<MergeSummary, MergeError> {
    let started = Instant::now();

    // --- 1. Open both inputs and check preconditions before touching the output ---
    let a = GenomicStore::open(first, config)?;
    let b = GenomicStore::open(second, config)?;
    check_chromosomes(&a, &b)?;

    // --- 2. Roster ---
    let overlap = a.roster().overlap(b.roster());
    if !overlap.is_empty() {
        warn!(
            "{} patient ids appear in both stores (e.g. {}); they will hold two bit positions",
            overlap.len(),
            overlap[0]
        );
    }
    let roster = a.roster().concat(b.roster());

    // --- 3. Variant specs ---
    let (specs, remap) = VariantSpecIndex::reconcile(a.specs(), b.specs());
    info!(
        "Merging {} + {} patients, {} + {} variants into {} variants",
        a.patient_count(),
        b.patient_count(),
        a.specs().len(),
        b.specs().len(),
        specs.len()
    );

    let layout = StoreLayout::new(output);
    layout.create()?;

    // --- 4. Contigs, merged in parallel under a log-and-wait monitor ---
    let contigs = merge_contigs(&a, &b, &layout, config)?;

    // --- 5. Info indexes ---
    let info_entries = merge_info(&a, &b, &remap, &layout)?;

    // --- 6. Metadata ---
    let manifest = StoreManifest::new(roster.len(), specs.len(), contigs.clone(), info_entries);
    write_store_metadata(&layout, &roster, &specs, &manifest)?;

    let summary = MergeSummary {
        patients: roster.len(),
        variants: specs.len(),
        overlapping_patients: overlap.len(),
        contigs,
        elapsed: started.elapsed(),
    };
    eprintln!(
        "> Merged store sealed: {} patients, {} variants ({:.2?})",
        summary.patients, summary.variants, summary.elapsed
    );
    Ok(summary)
}

fn merge_contigs(
    a: &GenomicStore,
    b: &GenomicStore,
    layout: &StoreLayout,
    config: &StoreConfig,
) -> Result<Vec<ContigEntry>, MergeError> {
    let mut files = FileNames::new();
    let names: Vec<(&str, String)> = a
        .contigs()
        .map(|name| (name, files.mask_file(name)))
        .collect();
    let pool = processor_pool().map_err(|e| MergeError::Threads(e.to_string()))?;
    let compression = config.compression();

    let results: Vec<Result<ContigEntry, MergeError>> =
        log_and_wait("contigs merged", names.len(), |completed| {
            pool.install(|| {
                names
                    .par_iter()
                    .map(|(name, file)| {
                        let result = merge_contig(name, file, a, b, layout, compression);
                        completed.fetch_add(1, Ordering::Relaxed);
                        result
                    })
                    .collect()
            })
        });
    results.into_iter().collect()
}

fn merge_contig(
    name: &str,
    file: &str,
    a: &GenomicStore,
    b: &GenomicStore,
    layout: &StoreLayout,
    compression: Compression,
) -> Result<ContigEntry, MergeError> {
    let a_len = a.patient_count();
    let b_len = b.patient_count();
    let left = a.chunked(name);
    let right = b.chunked(name);

    let bucket_ids: BTreeSet<u32> = left
        .into_iter()
        .flat_map(|s| s.bucket_ids())
        .chain(right.into_iter().flat_map(|s| s.bucket_ids()))
        .collect();

    let mut writer = ChunkedStoreWriter::create(&layout.resolve(file), name, a_len + b_len, compression)?;
    let mut variants = 0;
    let mut buckets = 0;
    for bucket_id in bucket_ids {
        let from_a = match left {
            Some(store) => store.get(bucket_id)?,
            None => None,
        };
        let from_b = match right {
            Some(store) => store.get(bucket_id)?,
            None => None,
        };
        let merged = concat_buckets(from_a.as_ref(), from_b.as_ref(), a_len, b_len);
        if merged.is_empty() {
            continue;
        }
        variants += merged.len();
        buckets += 1;
        writer.put(bucket_id, &merged)?;
    }
    writer.seal()?;

    Ok(ContigEntry {
        name: name.to_string(),
        file: file.to_string(),
        buckets,
        variants,
    })
}

/// Concatenates the masks of every variant found on either side.
pub fn concat_buckets(
    left: Option<&Bucket>,
    right: Option<&Bucket>,
    left_len: usize,
    right_len: usize,
) -> Bucket {
    let keys: BTreeSet<_> = left
        .into_iter()
        .flat_map(|b| b.keys())
        .chain(right.into_iter().flat_map(|b| b.keys()))
        .collect();
    keys.into_iter()
        .map(|key| {
            let record = MaskRecord::concat(
                left.and_then(|b| b.get(key)),
                right.and_then(|b| b.get(key)),
                left_len,
                right_len,
            );
            (key.clone(), record)
        })
        .collect()
}

fn merge_info(
    a: &GenomicStore,
    b: &GenomicStore,
    remap: &[VariantId],
    layout: &StoreLayout,
) -> Result<Vec<InfoColumnEntry>, MergeError> {
    let columns: BTreeSet<String> = a
        .info()
        .columns()
        .chain(b.info().columns())
        .map(|meta| meta.key.clone())
        .collect();

    let mut entries = Vec::with_capacity(columns.len());
    let mut files = FileNames::new();
    for column in &columns {
        let merged: Option<InfoColumnIndex> =
            match (a.info().load_column(column)?, b.info().load_column(column)?) {
                (Some(left), Some(right)) => Some(left.merge_remapped(&right, remap)),
                (Some(left), None) => Some((*left).clone()),
                (None, Some(right)) => Some(right.remapped(remap)),
                (None, None) => None,
            };
        let Some(merged) = merged else { continue };
        let file = files.info_file(column);
        merged.write_to(&layout.resolve(&file))?;
        entries.push(InfoColumnEntry {
            file,
            meta: merged.meta.clone(),
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::PatientMask;
    use crate::variant::{MaskClass, VariantKey};

    fn record(len: usize, het: &[usize]) -> MaskRecord {
        let mut mask = PatientMask::empty(len);
        het.iter().for_each(|&i| mask.set(i));
        let mut record = MaskRecord::new();
        record.set(MaskClass::Heterozygous, mask);
        record
    }

    #[test]
    fn one_sided_variants_get_zero_segments() {
        let shared = VariantKey::new("1", 10, "A", "T");
        let only_left = VariantKey::new("1", 20, "A", "T");
        let only_right = VariantKey::new("1", 30, "A", "T");

        let mut left = Bucket::new();
        left.insert(shared.clone(), record(2, &[0]));
        left.insert(only_left.clone(), record(2, &[0, 1]));
        let mut right = Bucket::new();
        right.insert(shared.clone(), record(3, &[2]));
        right.insert(only_right.clone(), record(3, &[1]));

        let merged = concat_buckets(Some(&left), Some(&right), 2, 3);
        assert_eq!(merged.len(), 3);
        let het = |k: &VariantKey| {
            merged[k]
                .get(MaskClass::Heterozygous)
                .unwrap()
                .iter_ones()
                .collect::<Vec<_>>()
        };
        assert_eq!(het(&shared), vec![0, 4]);
        assert_eq!(het(&only_left), vec![0, 1]);
        assert_eq!(het(&only_right), vec![3]);
        assert_eq!(merged[&only_left].get(MaskClass::Heterozygous).unwrap().len(), 5);
        assert!(merged[&shared].get(MaskClass::Homozygous).is_none());
    }

    #[test]
    fn missing_bucket_on_one_side_is_zero_filled() {
        let key = VariantKey::new("1", 10, "A", "T");
        let mut right = Bucket::new();
        right.insert(key.clone(), record(2, &[1]));
        let merged = concat_buckets(None, Some(&right), 4, 2);
        let het = merged[&key].get(MaskClass::Heterozygous).unwrap();
        assert_eq!(het.len(), 6);
        assert_eq!(het.iter_ones().collect::<Vec<_>>(), vec![5]);
    }
}
