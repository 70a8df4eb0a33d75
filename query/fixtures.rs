//! Small hand-built stores for query tests.

use crate::chunked::ChunkedStoreWriter;
use crate::config::StoreConfig;
use crate::info::{InfoColumnEntry, InfoColumnIndex, InfoColumnMeta};
use crate::layout::{
    ContigEntry, FileNames, GenomicStore, StoreLayout, StoreManifest, write_store_metadata,
};
use crate::mask::{Bucket, MaskRecord, PatientMask};
use crate::roster::{PatientId, PatientRoster};
use crate::spec_index::VariantSpecIndex;
use crate::variant::{MaskClass, VariantKey};
use flate2::Compression;
use std::collections::BTreeMap;
use std::path::Path;

pub struct FixtureVariant {
    pub key: &'static str,
    pub het: &'static [usize],
    pub hom: &'static [usize],
    pub het_no_call: &'static [usize],
    pub gene: &'static str,
    pub depth: u32,
}

pub const fn variant(
    key: &'static str,
    het: &'static [usize],
    hom: &'static [usize],
    gene: &'static str,
    depth: u32,
) -> FixtureVariant {
    FixtureVariant {
        key,
        het,
        hom,
        het_no_call: &[],
        gene,
        depth,
    }
}

fn mask(len: usize, ones: &[usize]) -> PatientMask {
    let mut mask = PatientMask::empty(len);
    ones.iter().for_each(|&i| mask.set(i));
    mask
}

/// Writes a sealed store with `GENE` and `DP` info columns and opens it.
pub fn build_store(root: &Path, patients: &[PatientId], variants: &[FixtureVariant]) -> GenomicStore {
    let len = patients.len();
    let layout = StoreLayout::new(root);
    layout.create().unwrap();

    let mut by_contig: BTreeMap<VariantKey, &FixtureVariant> = BTreeMap::new();
    for v in variants {
        by_contig.insert(v.key.parse().unwrap(), v);
    }

    let mut specs = VariantSpecIndex::new();
    let mut gene = InfoColumnIndex::new(InfoColumnMeta::new("GENE", Some("Gene symbol".into())));
    let mut depth = InfoColumnIndex::new(InfoColumnMeta::new("DP", None));
    let mut buckets: BTreeMap<(String, u32), Bucket> = BTreeMap::new();
    for (key, v) in &by_contig {
        let id = specs.push(key.clone());
        gene.add(v.gene, id);
        depth.add(&v.depth.to_string(), id);
        let mut record = MaskRecord::new();
        record.set(MaskClass::Heterozygous, mask(len, v.het));
        record.set(MaskClass::Homozygous, mask(len, v.hom));
        record.set(MaskClass::HeterozygousNoCall, mask(len, v.het_no_call));
        buckets
            .entry((key.contig().to_string(), key.bucket()))
            .or_default()
            .insert(key.clone(), record);
    }

    let mut names = FileNames::new();
    let mut contigs: Vec<ContigEntry> = Vec::new();
    let mut writer: Option<ChunkedStoreWriter> = None;
    for ((contig, bucket_id), bucket) in buckets {
        if writer.as_ref().is_none_or(|w| w.contig() != contig) {
            if let Some(done) = writer.take() {
                done.seal().unwrap();
            }
            let file = names.mask_file(&contig);
            writer = Some(
                ChunkedStoreWriter::create(&layout.resolve(&file), &contig, len, Compression::fast())
                    .unwrap(),
            );
            contigs.push(ContigEntry {
                name: contig.clone(),
                file,
                buckets: 0,
                variants: 0,
            });
        }
        let entry = contigs.last_mut().unwrap();
        entry.buckets += 1;
        entry.variants += bucket.len();
        writer.as_mut().unwrap().put(bucket_id, &bucket).unwrap();
    }
    if let Some(done) = writer.take() {
        done.seal().unwrap();
    }

    let mut info_entries = Vec::new();
    for mut column in [depth, gene] {
        column.finalize_meta();
        let file = names.info_file(&column.meta.key);
        column.write_to(&layout.resolve(&file)).unwrap();
        info_entries.push(InfoColumnEntry {
            file,
            meta: column.meta.clone(),
        });
    }

    let roster = PatientRoster::new(patients.to_vec());
    let manifest = StoreManifest::new(len, specs.len(), contigs, info_entries);
    write_store_metadata(&layout, &roster, &specs, &manifest).unwrap();
    GenomicStore::open(root, &StoreConfig::default()).unwrap()
}
