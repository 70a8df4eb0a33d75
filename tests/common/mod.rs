use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use varmask::config::StoreConfig;
use varmask::ingest::{IngestSummary, ingest};

pub const HEADER_INFO: &str = "##fileformat=VCFv4.2\n\
##INFO=<ID=GENE,Number=1,Type=String,Description=\"Gene symbol\">\n\
##INFO=<ID=DP,Number=1,Type=Integer,Description=\"Read depth\">\n";

/// One input file of a test manifest.
pub struct Input<'a> {
    pub name: &'a str,
    pub samples: &'a [(&'a str, u32)],
    /// Data lines without the sample columns' header: CHROM POS ID REF ALT QUAL FILTER INFO FORMAT GT...
    pub rows: &'a [&'a str],
    pub contig: &'a str,
    pub gzipped: bool,
}

impl<'a> Input<'a> {
    pub fn plain(name: &'a str, samples: &'a [(&'a str, u32)], rows: &'a [&'a str]) -> Self {
        Self {
            name,
            samples,
            rows,
            contig: "ALL",
            gzipped: false,
        }
    }
}

pub fn config() -> StoreConfig {
    StoreConfig {
        worker_threads: Some(2),
        ..StoreConfig::default()
    }
}

fn vcf_text(input: &Input<'_>) -> String {
    let mut text = String::from(HEADER_INFO);
    text.push_str("#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT");
    for (sample, _) in input.samples {
        text.push('\t');
        text.push_str(sample);
    }
    text.push('\n');
    for row in input.rows {
        text.push_str(&row.split_whitespace().collect::<Vec<_>>().join("\t"));
        text.push('\n');
    }
    text
}

/// Writes the inputs and a manifest naming them into `dir`, returning the manifest path.
pub fn write_manifest(dir: &Path, inputs: &[Input<'_>]) -> PathBuf {
    let mut manifest =
        String::from("file_path\tcontig\tis_annotated\tis_gzipped\tsample_ids\tpatient_ids\n");
    for input in inputs {
        let text = vcf_text(input);
        if input.gzipped {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(text.as_bytes()).unwrap();
            fs::write(dir.join(input.name), encoder.finish().unwrap()).unwrap();
        } else {
            fs::write(dir.join(input.name), text).unwrap();
        }
        let samples: Vec<&str> = input.samples.iter().map(|(s, _)| *s).collect();
        let patients: Vec<String> = input.samples.iter().map(|(_, p)| p.to_string()).collect();
        manifest.push_str(&format!(
            "{}\t{}\t1\t{}\t{}\t{}\n",
            input.name,
            input.contig,
            u8::from(input.gzipped),
            samples.join(","),
            patients.join(",")
        ));
    }
    let path = dir.join("manifest.tsv");
    fs::write(&path, manifest).unwrap();
    path
}

/// Ingests `inputs` into `dir/name`, returning the store path and the run summary.
pub fn build_store(dir: &Path, name: &str, inputs: &[Input<'_>]) -> (PathBuf, IngestSummary) {
    let staging = dir.join(format!("{name}-inputs"));
    fs::create_dir_all(&staging).unwrap();
    let manifest = write_manifest(&staging, inputs);
    let output = dir.join(name);
    let summary = ingest(&manifest, &output, &config()).unwrap();
    (output, summary)
}
