// ========================================================================================
//
//                              Sorted variant-call walker
//
// ========================================================================================
//
// A cursor over one position-sorted variant-call file. It yields one biallelic record per
// alternate allele, ordered by variant key, with each tracked sample's genotype already
// reduced to a zygosity class.

use super::IngestError;
use super::manifest::ManifestEntry;
use crate::roster::{PatientId, PatientRoster};
use crate::shared::files::{TextCompression, TextSource, open_text_source};
use crate::variant::{MaskClass, VariantKey, Zygosity};
use ahash::{AHashMap, AHashSet};
use log::{debug, warn};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const FIXED_COLUMNS: usize = 9;
const MALFORMED_WARNINGS: u64 = 10;

/// One biallelic record with the calls of every tracked sample that fall in a persisted
/// class.
#[derive(Debug, Clone)]
pub struct WalkerRecord {
    pub key: VariantKey,
    /// Raw INFO text when the file is annotated and the field is not `.`.
    pub info: Option<Arc<str>>,
    /// `(roster position, class)` per call.
    pub calls: Vec<(usize, MaskClass)>,
}

/// `##INFO` header metadata.
#[derive(Debug, Clone, Default)]
pub struct InfoHeader {
    pub descriptions: AHashMap<String, String>,
}

/// Rewrites a genotype for one alternate allele of a multi-allelic record: allele
/// `allele` becomes `1`, every other called allele becomes `0`.
pub fn recode_genotype(code: &[u8], allele: usize) -> [u8; 3] {
    let mut out = [0u8; 3];
    for (i, slot) in out.iter_mut().enumerate() {
        let byte = code.get(i).copied().unwrap_or(b'.');
        *slot = if byte.is_ascii_digit() {
            if (byte - b'0') as usize == allele {
                b'1'
            } else {
                b'0'
            }
        } else {
            byte
        };
    }
    out
}

/// Pulls `ID` and `Description` out of a `##INFO=<...>` line.
fn parse_info_header(line: &str) -> Option<(String, String)> {
    let body = line.strip_prefix("##INFO=<")?.strip_suffix('>')?;
    let mut id = None;
    let mut description = String::new();
    let mut rest = body;
    while !rest.is_empty() {
        let (field, value, remainder) = match rest.split_once('=') {
            Some((field, after)) if after.starts_with('"') => {
                let close = after[1..].find('"').map_or(after.len(), |i| i + 1);
                let value = &after[1..close];
                let remainder = after.get(close + 1..).unwrap_or("");
                (field, value, remainder.trim_start_matches(','))
            }
            Some((field, after)) => match after.split_once(',') {
                Some((value, remainder)) => (field, value, remainder),
                None => (field, after, ""),
            },
            None => break,
        };
        match field.trim() {
            "ID" => id = Some(value.to_string()),
            "Description" => description = value.to_string(),
            _ => {}
        }
        rest = remainder;
    }
    id.map(|id| (id, description))
}

/// A manifest flag of `false` still admits gzip content, which is recognised by its magic
/// bytes.
fn open_entry(entry: &ManifestEntry) -> Result<Box<dyn TextSource>, IngestError> {
    let compression = if entry.gzipped {
        TextCompression::Gzip
    } else {
        TextCompression::Detect
    };
    open_text_source(&entry.path, compression).map_err(|source| IngestError::Io {
        path: entry.path.clone(),
        source,
    })
}

/// Lists the contigs of `entry`'s data lines in file order, honouring its contig filter.
/// A contig that comes back after another one fails the survey.
pub fn survey_contigs(entry: &ManifestEntry) -> Result<Vec<String>, IngestError> {
    let mut source = open_entry(entry)?;
    let mut order: Vec<String> = Vec::new();
    let mut seen: AHashSet<String> = AHashSet::new();
    loop {
        let line = match source.next_line() {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                return Err(IngestError::Io {
                    path: entry.path.clone(),
                    source: err,
                });
            }
        };
        if line.is_empty() || line[0] == b'#' {
            continue;
        }
        let chrom = line.split(|&b| b == b'\t').next().unwrap_or_default();
        let Ok(chrom) = std::str::from_utf8(chrom) else {
            continue;
        };
        if entry.contig.as_deref().is_some_and(|c| c != chrom) {
            continue;
        }
        if order.last().is_some_and(|last| last == chrom) {
            continue;
        }
        if !seen.insert(chrom.to_string()) {
            return Err(IngestError::ContigOrder {
                path: entry.path.clone(),
                contig: chrom.to_string(),
            });
        }
        order.push(chrom.to_string());
    }
    debug!("{}: contigs {}", source.describe(), order.join(","));
    Ok(order)
}

pub struct VcfWalker {
    source: Box<dyn TextSource>,
    path: PathBuf,
    contig_filter: Option<String>,
    annotated: bool,
    /// Roster position per sample column; `None` for samples outside the manifest.
    slots: Vec<Option<usize>>,
    header: InfoHeader,
    contigs: AHashMap<String, Arc<str>>,
    finished_contigs: AHashSet<Arc<str>>,
    lookahead: Option<Vec<WalkerRecord>>,
    pending: VecDeque<WalkerRecord>,
    current: Option<WalkerRecord>,
    last_emitted: Option<VariantKey>,
    line_no: u64,
    records_read: u64,
    malformed: u64,
    source_done: bool,
}

impl VcfWalker {
    pub fn open(entry: &ManifestEntry, roster: &PatientRoster) -> Result<Self, IngestError> {
        let source = open_entry(entry)?;

        let mut walker = Self {
            source,
            path: entry.path.clone(),
            contig_filter: entry.contig.clone(),
            annotated: entry.annotated,
            slots: Vec::new(),
            header: InfoHeader::default(),
            contigs: AHashMap::new(),
            finished_contigs: AHashSet::new(),
            lookahead: None,
            pending: VecDeque::new(),
            current: None,
            last_emitted: None,
            line_no: 0,
            records_read: 0,
            malformed: 0,
            source_done: false,
        };
        walker.read_header(entry, roster)?;
        walker.advance()?;
        Ok(walker)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info_header(&self) -> &InfoHeader {
        &self.header
    }

    pub fn is_annotated(&self) -> bool {
        self.annotated
    }

    pub fn current(&self) -> Option<&WalkerRecord> {
        self.current.as_ref()
    }

    pub fn current_key(&self) -> Option<&VariantKey> {
        self.current.as_ref().map(|r| &r.key)
    }

    pub fn is_exhausted(&self) -> bool {
        self.current.is_none()
    }

    /// Data lines consumed so far.
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Moves to the next record.
    pub fn advance(&mut self) -> Result<(), IngestError> {
        self.take_and_advance().map(|_| ())
    }

    /// Returns the current record and moves to the next one.
    pub fn take_and_advance(&mut self) -> Result<Option<WalkerRecord>, IngestError> {
        if self.pending.is_empty() {
            self.fill_pending()?;
        }
        let next = self.pending.pop_front();
        if let Some(record) = &next {
            self.check_order(&record.key)?;
        }
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn read_header(&mut self, entry: &ManifestEntry, roster: &PatientRoster) -> Result<(), IngestError> {
        loop {
            self.line_no += 1;
            let line = match self.source.next_line() {
                Ok(Some(line)) => String::from_utf8_lossy(line).into_owned(),
                Ok(None) => {
                    return Err(IngestError::Format {
                        path: self.path.clone(),
                        line: self.line_no,
                        reason: "missing #CHROM header line".to_string(),
                    });
                }
                Err(source) => {
                    return Err(IngestError::Io {
                        path: self.path.clone(),
                        source,
                    });
                }
            };

            if line.starts_with("##") {
                if let Some((id, description)) = parse_info_header(&line) {
                    self.header.descriptions.insert(id, description);
                }
                continue;
            }
            if !line.starts_with("#CHROM") {
                return Err(IngestError::Format {
                    path: self.path.clone(),
                    line: self.line_no,
                    reason: "expected the #CHROM header line before data".to_string(),
                });
            }

            let columns: Vec<&str> = line.split('\t').collect();
            let sample_names = columns.get(FIXED_COLUMNS..).unwrap_or(&[]);
            let by_name: AHashMap<&str, PatientId> = entry
                .samples
                .iter()
                .map(|s| (s.sample_id.as_str(), s.patient_id))
                .collect();
            for binding in &entry.samples {
                if !sample_names.contains(&binding.sample_id.as_str()) {
                    return Err(IngestError::SampleMissing {
                        path: self.path.clone(),
                        sample: binding.sample_id.clone(),
                    });
                }
            }
            self.slots = sample_names
                .iter()
                .map(|name| {
                    by_name
                        .get(name)
                        .and_then(|&patient| roster.positions_of(patient).first().copied())
                })
                .collect();
            debug!(
                "{}: {} sample columns, {} tracked",
                self.source.describe(),
                self.slots.len(),
                self.slots.iter().flatten().count()
            );
            return Ok(());
        }
    }

    fn check_order(&mut self, key: &VariantKey) -> Result<(), IngestError> {
        if let Some(previous) = &self.last_emitted {
            if previous.contig() != key.contig() {
                self.finished_contigs.insert(previous.contig_arc().clone());
                if self.finished_contigs.contains(key.contig()) {
                    return Err(IngestError::ContigOrder {
                        path: self.path.clone(),
                        contig: key.contig().to_string(),
                    });
                }
            } else if key < previous {
                return Err(IngestError::Unsorted {
                    path: self.path.clone(),
                    previous: previous.to_string(),
                    current: key.to_string(),
                });
            }
        }
        self.last_emitted = Some(key.clone());
        Ok(())
    }

    /// Loads every record at the next position, sorted by key. Files are sorted by
    /// position only, so alleles at one position may appear in any order.
    fn fill_pending(&mut self) -> Result<(), IngestError> {
        let mut group = match self.lookahead.take() {
            Some(records) => records,
            None => match self.next_parsed()? {
                Some(records) => records,
                None => return Ok(()),
            },
        };
        loop {
            match self.next_parsed()? {
                Some(records) => {
                    let same_site = match (group.first(), records.first()) {
                        (Some(a), Some(b)) => {
                            a.key.contig() == b.key.contig() && a.key.position() == b.key.position()
                        }
                        _ => false,
                    };
                    if same_site {
                        group.extend(records);
                    } else {
                        self.lookahead = Some(records);
                        break;
                    }
                }
                None => break,
            }
        }
        group.sort_by(|a, b| a.key.cmp(&b.key));
        self.pending.extend(group);
        Ok(())
    }

    /// Parses data lines until one yields at least one record.
    fn next_parsed(&mut self) -> Result<Option<Vec<WalkerRecord>>, IngestError> {
        while !self.source_done {
            self.line_no += 1;
            let line = match self.source.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.source_done = true;
                    break;
                }
                Err(source) => {
                    return Err(IngestError::Io {
                        path: self.path.clone(),
                        source,
                    });
                }
            };
            if line.is_empty() || line[0] == b'#' {
                continue;
            }
            self.records_read += 1;
            let parsed = parse_record(
                line,
                self.contig_filter.as_deref(),
                self.annotated,
                &self.slots,
                &mut self.contigs,
            );
            match parsed {
                Ok(records) if records.is_empty() => continue,
                Ok(records) => return Ok(Some(records)),
                Err(reason) => {
                    self.malformed += 1;
                    if self.malformed <= MALFORMED_WARNINGS {
                        warn!(
                            "{}:{}: skipping malformed record: {reason}",
                            self.path.display(),
                            self.line_no
                        );
                    }
                }
            }
        }
        if self.malformed > MALFORMED_WARNINGS {
            warn!(
                "{}: {} malformed records skipped in total",
                self.path.display(),
                self.malformed
            );
            self.malformed = 0;
        }
        Ok(None)
    }
}

/// Splits one data line into biallelic records. Lines outside the contig filter, and
/// sites with no alternate allele, yield nothing.
fn parse_record(
    line: &[u8],
    contig_filter: Option<&str>,
    annotated: bool,
    slots: &[Option<usize>],
    contigs: &mut AHashMap<String, Arc<str>>,
) -> Result<Vec<WalkerRecord>, String> {
    let mut fields = line.split(|&b| b == b'\t');
    let empty: &[u8] = &[];
    let mut fixed = [empty; FIXED_COLUMNS];
    for (i, slot) in fixed.iter_mut().enumerate().take(8) {
        *slot = fields
            .next()
            .ok_or_else(|| format!("only {i} of 8 fixed columns present"))?;
    }
    fixed[8] = fields.next().unwrap_or(&[]);

    fn text<'b>(bytes: &'b [u8], name: &str) -> Result<&'b str, String> {
        std::str::from_utf8(bytes).map_err(|_| format!("{name} is not valid UTF-8"))
    }
    let chrom = text(fixed[0], "CHROM")?;
    if contig_filter.is_some_and(|c| c != chrom) {
        return Ok(Vec::new());
    }
    let position = text(fixed[1], "POS")?
        .parse::<u32>()
        .map_err(|e| format!("POS '{}' is invalid: {e}", String::from_utf8_lossy(fixed[1])))?;
    let reference = text(fixed[3], "REF")?;
    let alternates = text(fixed[4], "ALT")?;
    if chrom.is_empty() || reference.is_empty() {
        return Err("empty CHROM or REF".to_string());
    }
    if alternates.is_empty() || alternates == "." {
        return Ok(Vec::new());
    }

    let contig = match contigs.get(chrom) {
        Some(arc) => arc.clone(),
        None => {
            let arc: Arc<str> = Arc::from(chrom);
            contigs.insert(chrom.to_string(), arc.clone());
            arc
        }
    };

    let info = match (annotated, fixed[7]) {
        (false, _) | (true, b"") | (true, b".") => None,
        (true, raw) => Some(Arc::from(String::from_utf8_lossy(raw).as_ref())),
    };

    let genotypes: Vec<&[u8]> = fields.collect();
    let alternates: Vec<&str> = alternates.split(',').collect();
    let multi = alternates.len() > 1;

    let mut records = Vec::with_capacity(alternates.len());
    for (j, alternate) in alternates.iter().enumerate() {
        if alternate.is_empty() || *alternate == "." || *alternate == "*" {
            continue;
        }
        let mut calls = Vec::new();
        for (column, slot) in slots.iter().enumerate() {
            let Some(slot) = slot else { continue };
            let code = genotypes.get(column).copied().unwrap_or(&[]);
            let zygosity = if multi {
                Zygosity::from_genotype(&recode_genotype(code, j + 1))
            } else {
                Zygosity::from_genotype(code)
            };
            if let Some(class) = zygosity.mask_class() {
                calls.push((*slot, class));
            }
        }
        records.push(WalkerRecord {
            key: VariantKey::new(contig.clone(), position, reference, *alternate),
            info: info.clone(),
            calls,
        });
    }
    Ok(records)
}
