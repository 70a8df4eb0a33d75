mod common;

use common::{Input, build_store, config};
use std::fs;
use std::path::Path;
use tempfile::tempdir;
use varmask::merge::merge_stores;
use varmask::query::{
    FederationSpec, GenomicProcessor, GenomicQuery, InfoFilter, LeafProcessor, VariantFilter,
};

const FIRST_ROWS: [&str; 3] = [
    "1 100 . A T . . GENE=BRCA1;DP=40 GT 0/1 1/1 0/0",
    "1 5000 . G C . . GENE=APOE;DP=8 GT 0/1 0/0 0/1",
    "2 300 . T G . . GENE=MYH7;DP=22 GT 0/0 0/0 1/1",
];
const SECOND_ROWS: [&str; 3] = [
    "1 5000 . G C . . GENE=APOE;DP=8 GT 0/0 1/1",
    "1 7000 . C T . . GENE=TP53;DP=60 GT 0/1 0/0",
    "2 300 . T G . . GENE=MYH7;DP=22 GT 0/1 0/1",
];

fn queries() -> Vec<GenomicQuery> {
    let variant = |text: &str| text.parse::<VariantFilter>().unwrap();
    vec![
        GenomicQuery::new().with_variant(variant("1,5000,G,C")),
        GenomicQuery::new().with_variant(variant("1,5000,G,C:hom")),
        GenomicQuery::new()
            .with_variant(variant("1,5000,G,C"))
            .with_variant(variant("2,300,T,G")),
        GenomicQuery::new().with_info(InfoFilter::new().with_values("GENE", ["BRCA1", "TP53"])),
        GenomicQuery::new().with_info("DP=20..50".parse().unwrap()),
        GenomicQuery::new()
            .with_info("GENE=MYH7".parse().unwrap())
            .with_patients(vec![3, 5]),
    ]
}

fn answers(processor: &dyn GenomicProcessor) -> Vec<(Vec<u32>, Vec<String>)> {
    queries()
        .iter()
        .map(|query| {
            let ids = processor.mask_to_ids(&processor.patient_mask(query).unwrap());
            let keys = processor
                .variant_list(query)
                .unwrap()
                .iter()
                .map(ToString::to_string)
                .collect();
            (ids, keys)
        })
        .collect()
}

fn write_description(path: &Path, text: &str) {
    fs::write(path, text).unwrap();
}

#[test]
fn patient_federation_answers_like_a_merged_store() {
    let dir = tempdir().unwrap();
    let (first, _) = build_store(
        dir.path(),
        "a",
        &[Input::plain("a.vcf", &[("S1", 1), ("S2", 2), ("S3", 3)], &FIRST_ROWS)],
    );
    let (second, _) = build_store(
        dir.path(),
        "b",
        &[Input::plain("b.vcf", &[("S4", 4), ("S5", 5)], &SECOND_ROWS)],
    );
    let merged = dir.path().join("merged");
    merge_stores(&first, &second, &merged, &config()).unwrap();

    let description = dir.path().join("patients.toml");
    write_description(
        &description,
        "[root]\nkind = \"patients\"\n\n[[root.children]]\nkind = \"leaf\"\npath = \"a\"\n\n\
         [[root.children]]\nkind = \"leaf\"\npath = \"b\"\n",
    );
    let federation = FederationSpec::from_toml_path(&description)
        .unwrap()
        .build(&config())
        .unwrap();
    let store = LeafProcessor::open(&merged, &config()).unwrap();

    assert_eq!(federation.roster().ids(), store.roster().ids());
    assert_eq!(answers(federation.as_ref()), answers(&store));
    assert_eq!(
        federation.info_values("GENE").unwrap(),
        store.info_values("GENE").unwrap()
    );
}

#[test]
fn chromosome_federation_answers_like_a_whole_genome_store() {
    let dir = tempdir().unwrap();
    let samples = [("S1", 1), ("S2", 2), ("S3", 3)];
    build_store(dir.path(), "whole", &[Input::plain("a.vcf", &samples, &FIRST_ROWS)]);
    for contig in ["1", "2"] {
        build_store(
            dir.path(),
            &format!("chr{contig}"),
            &[Input {
                name: "a.vcf",
                samples: &samples,
                rows: &FIRST_ROWS,
                contig,
                gzipped: false,
            }],
        );
    }

    let description = dir.path().join("chromosomes.toml");
    write_description(
        &description,
        "[root]\nkind = \"chromosome\"\n\n[[root.children]]\nkind = \"leaf\"\npath = \"chr1\"\n\n\
         [[root.children]]\nkind = \"leaf\"\npath = \"chr2\"\n",
    );
    let federation = FederationSpec::from_toml_path(&description)
        .unwrap()
        .build(&config())
        .unwrap();
    let whole = LeafProcessor::open(&dir.path().join("whole"), &config()).unwrap();

    let mut contigs = federation.contigs();
    contigs.sort();
    assert_eq!(contigs, vec!["1", "2"]);
    assert_eq!(answers(federation.as_ref()), answers(&whole));

    let depth = federation
        .info_columns()
        .into_iter()
        .find(|c| c.key == "DP")
        .unwrap();
    assert_eq!((depth.min, depth.max), (Some(8.0), Some(40.0)));
}

#[test]
fn chromosome_federation_rejects_overlapping_children() {
    let dir = tempdir().unwrap();
    let samples = [("S1", 1)];
    build_store(dir.path(), "x", &[Input::plain("a.vcf", &samples, &["1 100 . A T . . . GT 0/1"])]);
    build_store(dir.path(), "y", &[Input::plain("a.vcf", &samples, &["1 200 . A T . . . GT 0/1"])]);
    let description = dir.path().join("bad.toml");
    write_description(
        &description,
        "[root]\nkind = \"chromosome\"\n\n[[root.children]]\nkind = \"leaf\"\npath = \"x\"\n\n\
         [[root.children]]\nkind = \"leaf\"\npath = \"y\"\n",
    );
    let spec = FederationSpec::from_toml_path(&description).unwrap();
    assert!(spec.build(&config()).is_err());
}
