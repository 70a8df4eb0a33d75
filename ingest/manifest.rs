use super::IngestError;
use crate::roster::{PatientId, PatientRoster};
use ahash::AHashSet;
use std::path::{Path, PathBuf};

/// Value of the contig column meaning "every contig in the file".
pub const ALL_CONTIGS: &str = "ALL";

const REQUIRED_COLUMNS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBinding {
    pub sample_id: String,
    pub patient_id: PatientId,
}

/// One variant-call file and the samples it contributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: PathBuf,
    /// Restricts the file to one contig; `None` reads all of them.
    pub contig: Option<String>,
    pub annotated: bool,
    pub gzipped: bool,
    pub samples: Vec<SampleBinding>,
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

fn split_list(value: &str) -> Vec<&str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Reads a tab-separated manifest. The first non-comment row is a header; lines starting
/// with `#` are ignored; relative file paths resolve against the manifest's directory.
/// Columns past the sixth are accepted and ignored.
pub fn read_manifest(path: &Path) -> Result<Vec<ManifestEntry>, IngestError> {
    let manifest_error = |reason: String| IngestError::Manifest {
        path: path.to_path_buf(),
        reason,
    };
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .comment(Some(b'#'))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| manifest_error(e.to_string()))?;

    let mut entries = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|e| manifest_error(e.to_string()))?;
        let row_no = row + 1;
        if record.iter().all(str::is_empty) {
            continue;
        }
        if record.len() < REQUIRED_COLUMNS {
            return Err(manifest_error(format!(
                "row {row_no} has {} columns, expected at least {REQUIRED_COLUMNS}",
                record.len()
            )));
        }

        let file = PathBuf::from(&record[0]);
        let file = if file.is_absolute() { file } else { base.join(file) };

        let contig = match &record[1] {
            "" => return Err(manifest_error(format!("row {row_no} has an empty contig"))),
            c if c.eq_ignore_ascii_case(ALL_CONTIGS) => None,
            c => Some(c.to_string()),
        };

        let annotated = parse_flag(&record[2]).ok_or_else(|| {
            manifest_error(format!("row {row_no}: is_annotated '{}' is not a boolean", &record[2]))
        })?;
        let gzipped = parse_flag(&record[3]).ok_or_else(|| {
            manifest_error(format!("row {row_no}: is_gzipped '{}' is not a boolean", &record[3]))
        })?;

        let sample_ids = split_list(&record[4]);
        let patient_ids = split_list(&record[5]);
        if sample_ids.len() != patient_ids.len() {
            return Err(manifest_error(format!(
                "row {row_no} pairs {} sample ids with {} patient ids",
                sample_ids.len(),
                patient_ids.len()
            )));
        }
        if sample_ids.is_empty() {
            return Err(manifest_error(format!("row {row_no} lists no samples")));
        }

        let mut samples = Vec::with_capacity(sample_ids.len());
        for (sample_id, patient) in sample_ids.iter().zip(&patient_ids) {
            let patient_id = patient.parse::<PatientId>().map_err(|e| {
                manifest_error(format!("row {row_no}: patient id '{patient}' is invalid: {e}"))
            })?;
            samples.push(SampleBinding {
                sample_id: sample_id.to_string(),
                patient_id,
            });
        }

        entries.push(ManifestEntry {
            path: file,
            contig,
            annotated,
            gzipped,
            samples,
        });
    }

    if entries.is_empty() {
        return Err(IngestError::NoInputs);
    }
    Ok(entries)
}

/// Patient ids in manifest order, each kept at its first appearance.
pub fn roster_from_manifest(entries: &[ManifestEntry]) -> PatientRoster {
    let mut seen = AHashSet::new();
    let ids = entries
        .iter()
        .flat_map(|e| e.samples.iter().map(|s| s.patient_id))
        .filter(|id| seen.insert(*id))
        .collect();
    PatientRoster::new(ids)
}
