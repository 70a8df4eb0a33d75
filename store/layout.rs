// ========================================================================================
//
//                              Store directory & sealed store
//
// ========================================================================================
//
//   <root>/manifest.toml          written last; its presence marks a sealed store
//   <root>/patients.txt           roster, one patient id per line
//   <root>/variant_specs.txt.gz   variant keys in id order
//   <root>/masks/<contig>.vmask   one chunked store per contig
//   <root>/info/<column>.vidx     one value index per INFO column

use crate::cache::BucketCache;
use crate::chunked::ChunkedStore;
use crate::config::StoreConfig;
use crate::error::{IoContext, StoreError};
use crate::info::{InfoColumnEntry, InfoStore};
use crate::mask::{Bucket, MaskRecord};
use crate::roster::PatientRoster;
use crate::spec_index::VariantSpecIndex;
use crate::variant::VariantKey;
use ahash::{AHashMap, AHashSet};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const STORE_MAGIC: &str = "varmask";
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Replaces every character outside `[A-Za-z0-9._-]` so that contig and column names are
/// safe file stems.
pub fn sanitize_file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Hands out manifest-relative file names for one store. Distinct names that sanitize to
/// the same stem, or to stems differing only in case, get a numeric suffix so that no file
/// is written twice.
#[derive(Debug, Default)]
pub struct FileNames {
    taken: AHashSet<String>,
}

impl FileNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// File name for a contig's chunked store.
    pub fn mask_file(&mut self, contig: &str) -> String {
        self.claim("masks", contig, "vmask")
    }

    /// File name for an INFO column's index.
    pub fn info_file(&mut self, column: &str) -> String {
        self.claim("info", column, "vidx")
    }

    fn claim(&mut self, dir: &str, name: &str, extension: &str) -> String {
        let stem = sanitize_file_stem(name);
        let mut candidate = stem.clone();
        let mut suffix = 1;
        while !self
            .taken
            .insert(format!("{dir}/{}", candidate.to_ascii_lowercase()))
        {
            suffix += 1;
            candidate = format!("{stem}-{suffix}");
        }
        if candidate != stem {
            debug!("'{name}' shares the file stem '{stem}'; using '{candidate}'");
        }
        format!("{dir}/{candidate}.{extension}")
    }
}

#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.toml")
    }

    pub fn roster_path(&self) -> PathBuf {
        self.root.join("patients.txt")
    }

    pub fn specs_path(&self) -> PathBuf {
        self.root.join("variant_specs.txt.gz")
    }

    pub fn masks_dir(&self) -> PathBuf {
        self.root.join("masks")
    }

    pub fn info_dir(&self) -> PathBuf {
        self.root.join("info")
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Creates the directory tree of a new store. An existing sealed store is never
    /// overwritten.
    pub fn create(&self) -> Result<(), StoreError> {
        let manifest = self.manifest_path();
        if manifest.exists() {
            return Err(StoreError::Inconsistent {
                path: self.root.clone(),
                reason: "a sealed store already exists here".to_string(),
            });
        }
        for dir in [self.root.clone(), self.masks_dir(), self.info_dir()] {
            fs::create_dir_all(&dir).at(&dir)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContigEntry {
    pub name: String,
    pub file: String,
    pub buckets: usize,
    pub variants: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreManifest {
    pub magic: String,
    pub format_version: u32,
    pub patient_count: usize,
    pub variant_count: usize,
    #[serde(default)]
    pub contigs: Vec<ContigEntry>,
    #[serde(default)]
    pub info_columns: Vec<InfoColumnEntry>,
}

impl StoreManifest {
    pub fn new(
        patient_count: usize,
        variant_count: usize,
        contigs: Vec<ContigEntry>,
        info_columns: Vec<InfoColumnEntry>,
    ) -> Self {
        Self {
            magic: STORE_MAGIC.to_string(),
            format_version: STORE_FORMAT_VERSION,
            patient_count,
            variant_count,
            contigs,
            info_columns,
        }
    }

    pub fn read_from(path: &Path) -> Result<Self, StoreError> {
        let text = fs::read_to_string(path).at(path)?;
        let manifest: StoreManifest =
            toml::from_str(&text).map_err(|source| StoreError::ManifestParse {
                path: path.to_path_buf(),
                source,
            })?;
        if manifest.magic != STORE_MAGIC {
            return Err(StoreError::corrupt(path, format!("unexpected magic '{}'", manifest.magic)));
        }
        if manifest.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::corrupt(
                path,
                format!(
                    "unsupported store format version {} (expected {STORE_FORMAT_VERSION})",
                    manifest.format_version
                ),
            ));
        }
        Ok(manifest)
    }

    pub fn contig_names(&self) -> impl Iterator<Item = &str> {
        self.contigs.iter().map(|c| c.name.as_str())
    }
}

/// Writes the roster, spec list and finally the manifest, which seals the store.
pub fn write_store_metadata(
    layout: &StoreLayout,
    roster: &PatientRoster,
    specs: &VariantSpecIndex,
    manifest: &StoreManifest,
) -> Result<(), StoreError> {
    let roster_path = layout.roster_path();
    roster.write_to(&roster_path).at(&roster_path)?;
    specs.write_to(&layout.specs_path())?;

    let manifest_path = layout.manifest_path();
    let staging = manifest_path.with_extension("toml.partial");
    fs::write(&staging, toml::to_string_pretty(manifest)?).at(&staging)?;
    fs::rename(&staging, &manifest_path).at(&manifest_path)?;
    Ok(())
}

struct ContigHandle {
    store: ChunkedStore,
    cache: BucketCache<Bucket>,
}

/// A sealed store opened for concurrent reads.
pub struct GenomicStore {
    layout: StoreLayout,
    manifest: StoreManifest,
    roster: Arc<PatientRoster>,
    specs: Arc<VariantSpecIndex>,
    contigs: AHashMap<String, ContigHandle>,
    info: InfoStore,
}

impl GenomicStore {
    pub fn open(root: &Path, config: &StoreConfig) -> Result<Self, StoreError> {
        let layout = StoreLayout::new(root);
        let manifest = StoreManifest::read_from(&layout.manifest_path())?;
        let inconsistent = |reason: String| StoreError::Inconsistent {
            path: root.to_path_buf(),
            reason,
        };

        let roster_path = layout.roster_path();
        let roster = PatientRoster::read_from(&roster_path).at(&roster_path)?;
        if roster.len() != manifest.patient_count {
            return Err(inconsistent(format!(
                "roster lists {} patients, manifest declares {}",
                roster.len(),
                manifest.patient_count
            )));
        }

        let specs = VariantSpecIndex::read_from(&layout.specs_path())?;
        if specs.len() != manifest.variant_count {
            return Err(inconsistent(format!(
                "spec list holds {} variants, manifest declares {}",
                specs.len(),
                manifest.variant_count
            )));
        }

        let mut contigs = AHashMap::with_capacity(manifest.contigs.len());
        for entry in &manifest.contigs {
            let store = ChunkedStore::open(&layout.resolve(&entry.file))?;
            if store.contig() != entry.name || store.patient_count() != roster.len() {
                return Err(inconsistent(format!(
                    "'{}' holds contig '{}' over {} patients, expected '{}' over {}",
                    entry.file,
                    store.contig(),
                    store.patient_count(),
                    entry.name,
                    roster.len()
                )));
            }
            contigs.insert(
                entry.name.clone(),
                ContigHandle {
                    store,
                    cache: BucketCache::new(),
                },
            );
        }

        let info = InfoStore::new(
            layout.root(),
            &manifest.info_columns,
            specs.len(),
            config.sparse_threshold,
            config.info_cache_weight,
        );

        info!(
            "Opened store {} ({} patients, {} variants, {} contigs)",
            root.display(),
            roster.len(),
            specs.len(),
            contigs.len()
        );

        Ok(Self {
            layout,
            manifest,
            roster: Arc::new(roster),
            specs: Arc::new(specs),
            contigs,
            info,
        })
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn manifest(&self) -> &StoreManifest {
        &self.manifest
    }

    pub fn roster(&self) -> &Arc<PatientRoster> {
        &self.roster
    }

    pub fn specs(&self) -> &Arc<VariantSpecIndex> {
        &self.specs
    }

    pub fn patient_count(&self) -> usize {
        self.roster.len()
    }

    /// Contig names in the order they were built.
    pub fn contigs(&self) -> impl Iterator<Item = &str> {
        self.manifest.contig_names()
    }

    pub fn has_contig(&self, contig: &str) -> bool {
        self.contigs.contains_key(contig)
    }

    pub fn chunked(&self, contig: &str) -> Option<&ChunkedStore> {
        self.contigs.get(contig).map(|h| &h.store)
    }

    /// Fetches one bucket through the contig's last-bucket cache. Unknown contigs and
    /// unwritten buckets are `None`.
    pub fn bucket(&self, contig: &str, bucket_id: u32) -> Result<Option<Arc<Bucket>>, StoreError> {
        let Some(handle) = self.contigs.get(contig) else {
            return Ok(None);
        };
        handle
            .cache
            .get_or_load(bucket_id, || handle.store.get(bucket_id))
    }

    /// The masks stored for `key`, or `None` when the store has never seen it.
    pub fn record(&self, key: &VariantKey) -> Result<Option<MaskRecord>, StoreError> {
        Ok(self
            .bucket(key.contig(), key.bucket())?
            .and_then(|bucket| bucket.get(key).cloned()))
    }

    pub fn info(&self) -> &InfoStore {
        &self.info
    }
}
