// ========================================================================================
//
//                              Variant annotation index
//
// ========================================================================================
//
// For every indexed INFO column, a map from each observed value to the ids of the
// variants carrying it. Values are opaque strings; a column whose every value parses as
// a number is flagged continuous and also answers numeric range lookups.

use crate::cache::WeightedCache;
use crate::error::{IoContext, StoreError};
use crate::spec_index::VariantId;
use crate::value_index::VariantIndex;
use ahash::AHashMap;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::debug;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const INFO_MAGIC: &[u8; 4] = b"VIDX";
const INFO_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoColumnMeta {
    pub key: String,
    #[serde(default)]
    pub description: Option<String>,
    pub continuous: bool,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl InfoColumnMeta {
    pub fn new(key: impl Into<String>, description: Option<String>) -> Self {
        Self {
            key: key.into(),
            description,
            continuous: false,
            min: None,
            max: None,
        }
    }

    /// Metadata for a column observed in two stores: a description from either side,
    /// continuous only if both agree, numeric bounds widened.
    pub fn merged_with(&self, other: &InfoColumnMeta) -> InfoColumnMeta {
        let continuous = self.continuous && other.continuous;
        let widen = |x: Option<f64>, y: Option<f64>, pick: fn(f64, f64) -> f64| match (x, y) {
            (Some(x), Some(y)) => Some(pick(x, y)),
            (x, y) => x.or(y),
        };
        InfoColumnMeta {
            key: self.key.clone(),
            description: self.description.clone().or_else(|| other.description.clone()),
            continuous,
            min: continuous.then(|| widen(self.min, other.min, f64::min)).flatten(),
            max: continuous.then(|| widen(self.max, other.max, f64::max)).flatten(),
        }
    }
}

/// Where a column's index lives inside the store, as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoColumnEntry {
    pub file: String,
    pub meta: InfoColumnMeta,
}

fn numeric(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoColumnIndex {
    pub meta: InfoColumnMeta,
    values: BTreeMap<String, RoaringBitmap>,
}

impl InfoColumnIndex {
    pub fn new(meta: InfoColumnMeta) -> Self {
        Self {
            meta,
            values: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, value: &str, id: VariantId) {
        match self.values.get_mut(value) {
            Some(ids) => {
                ids.insert(id);
            }
            None => {
                let mut ids = RoaringBitmap::new();
                ids.insert(id);
                self.values.insert(value.to_string(), ids);
            }
        }
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &RoaringBitmap)> {
        self.values.iter().map(|(v, ids)| (v.as_str(), ids))
    }

    pub fn ids_for(&self, value: &str) -> Option<&RoaringBitmap> {
        self.values.get(value)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Recomputes `continuous`, `min` and `max` from the observed values.
    pub fn finalize_meta(&mut self) {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut continuous = !self.values.is_empty();
        for value in self.values.keys() {
            match numeric(value) {
                Some(v) => {
                    min = min.min(v);
                    max = max.max(v);
                }
                None => {
                    continuous = false;
                    break;
                }
            }
        }
        self.meta.continuous = continuous;
        if continuous {
            self.meta.min = Some(min);
            self.meta.max = Some(max);
        } else {
            self.meta.min = None;
            self.meta.max = None;
        }
    }

    /// A copy with every variant id translated through `remap`.
    pub fn remapped(&self, remap: &[VariantId]) -> InfoColumnIndex {
        let mut out = InfoColumnIndex::new(self.meta.clone());
        for (value, ids) in &self.values {
            let translated: RoaringBitmap = ids
                .iter()
                .filter_map(|id| remap.get(id as usize).copied())
                .collect();
            out.values.insert(value.clone(), translated);
        }
        out
    }

    /// Unions `other` into a copy of `self`, translating `other`'s variant ids through
    /// `remap`.
    pub fn merge_remapped(&self, other: &InfoColumnIndex, remap: &[VariantId]) -> InfoColumnIndex {
        let mut merged = self.clone();
        for (value, ids) in other.remapped(remap).values {
            *merged.values.entry(value).or_default() |= ids;
        }
        merged.meta = self.meta.merged_with(&other.meta);
        merged
    }

    pub fn write_to(&self, path: &Path) -> Result<(), StoreError> {
        let file = File::create(path).at(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(INFO_MAGIC).at(path)?;
        writer.write_all(&[INFO_VERSION]).at(path)?;
        let mut encoder = GzEncoder::new(writer, Compression::default());
        serde_json::to_writer(&mut encoder, self)?;
        let mut writer = encoder.finish().at(path)?;
        writer.flush().at(path)
    }

    pub fn read_from(path: &Path) -> Result<Self, StoreError> {
        let mut reader = BufReader::new(File::open(path).at(path)?);
        let mut header = [0u8; 5];
        reader.read_exact(&mut header).at(path)?;
        if &header[..4] != INFO_MAGIC {
            return Err(StoreError::corrupt(path, "missing info index magic"));
        }
        if header[4] != INFO_VERSION {
            return Err(StoreError::corrupt(
                path,
                format!("unsupported info index version {}", header[4]),
            ));
        }
        Ok(serde_json::from_reader(GzDecoder::new(reader))?)
    }
}

// ========================================================================================
//                                 Read-side column store
// ========================================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Lookup {
    Value(String),
    Range(u64, u64),
}

/// Lazily loads column indexes of a sealed store and caches resolved lookups.
pub struct InfoStore {
    dir: PathBuf,
    columns: BTreeMap<String, InfoColumnEntry>,
    loaded: Mutex<AHashMap<String, Arc<InfoColumnIndex>>>,
    lookups: WeightedCache<(String, Lookup), Arc<VariantIndex>>,
    total_variants: usize,
    sparse_threshold: f64,
}

impl InfoStore {
    pub fn new(
        dir: &Path,
        entries: &[InfoColumnEntry],
        total_variants: usize,
        sparse_threshold: f64,
        cache_weight: usize,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            columns: entries
                .iter()
                .map(|e| (e.meta.key.clone(), e.clone()))
                .collect(),
            loaded: Mutex::new(AHashMap::new()),
            lookups: WeightedCache::new(cache_weight),
            total_variants,
            sparse_threshold,
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &InfoColumnMeta> {
        self.columns.values().map(|e| &e.meta)
    }

    pub fn meta(&self, column: &str) -> Option<&InfoColumnMeta> {
        self.columns.get(column).map(|e| &e.meta)
    }

    pub fn load_column(&self, column: &str) -> Result<Option<Arc<InfoColumnIndex>>, StoreError> {
        let Some(entry) = self.columns.get(column) else {
            return Ok(None);
        };
        if let Some(index) = self.lock_loaded().get(column) {
            return Ok(Some(index.clone()));
        }
        let path = self.dir.join(&entry.file);
        let index = Arc::new(InfoColumnIndex::read_from(&path)?);
        debug!("loaded info column '{column}' from {}", path.display());
        self.lock_loaded()
            .insert(column.to_string(), index.clone());
        Ok(Some(index))
    }

    /// Distinct values of `column`, in sorted string order. Unknown columns have none.
    pub fn column_values(&self, column: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .load_column(column)?
            .map(|index| index.values().map(|(v, _)| v.to_string()).collect())
            .unwrap_or_default())
    }

    /// Variants whose `column` equals `value`.
    pub fn lookup(&self, column: &str, value: &str) -> Result<Arc<VariantIndex>, StoreError> {
        let key = (column.to_string(), Lookup::Value(value.to_string()));
        self.lookups.get_or_try_insert_with(
            key,
            || -> Result<_, StoreError> {
                let ids = self
                    .load_column(column)?
                    .and_then(|index| index.ids_for(value).cloned())
                    .unwrap_or_default();
                Ok(Arc::new(self.represent(ids)))
            },
            |index| index.weight(),
        )
    }

    /// Variants whose `column` equals any of `values`.
    pub fn lookup_any(&self, column: &str, values: &[String]) -> Result<VariantIndex, StoreError> {
        let mut acc = VariantIndex::empty();
        for value in values {
            acc = acc.union(&*self.lookup(column, value)?);
        }
        Ok(acc)
    }

    /// Variants whose numeric `column` value lies in `min..=max`. Non-numeric values never
    /// match.
    pub fn lookup_range(&self, column: &str, min: f64, max: f64) -> Result<Arc<VariantIndex>, StoreError> {
        let key = (column.to_string(), Lookup::Range(min.to_bits(), max.to_bits()));
        self.lookups.get_or_try_insert_with(
            key,
            || -> Result<_, StoreError> {
                let mut ids = RoaringBitmap::new();
                if let Some(index) = self.load_column(column)? {
                    for (value, value_ids) in index.values() {
                        if numeric(value).is_some_and(|v| v >= min && v <= max) {
                            ids |= value_ids;
                        }
                    }
                }
                Ok(Arc::new(self.represent(ids)))
            },
            |index| index.weight(),
        )
    }

    fn represent(&self, ids: RoaringBitmap) -> VariantIndex {
        VariantIndex::from_ids(ids, self.total_variants, self.sparse_threshold)
    }

    fn lock_loaded(&self) -> std::sync::MutexGuard<'_, AHashMap<String, Arc<InfoColumnIndex>>> {
        self.loaded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn column(key: &str, pairs: &[(&str, u32)]) -> InfoColumnIndex {
        let mut index = InfoColumnIndex::new(InfoColumnMeta::new(key, None));
        for (value, id) in pairs {
            index.add(value, *id);
        }
        index.finalize_meta();
        index
    }

    #[test]
    fn numeric_columns_are_continuous_with_bounds() {
        let af = column("AF", &[("0.5", 0), ("0.01", 1), ("1e-3", 2)]);
        assert!(af.meta.continuous);
        assert_eq!(af.meta.min, Some(0.001));
        assert_eq!(af.meta.max, Some(0.5));

        let gene = column("GENE", &[("BRCA1", 0), ("3", 1)]);
        assert!(!gene.meta.continuous);
        assert_eq!(gene.meta.min, None);
    }

    #[test]
    fn merge_remaps_ids_and_widens_metadata() {
        let a = column("DP", &[("10", 0), ("20", 1)]);
        let mut b = column("DP", &[("20", 0), ("40", 1)]);
        b.meta.description = Some("Read depth".into());
        let merged = a.merge_remapped(&b, &[1, 5]);
        assert_eq!(merged.ids_for("20").unwrap().iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(merged.ids_for("40").unwrap().iter().collect::<Vec<_>>(), vec![5]);
        assert_eq!(merged.meta.min, Some(10.0));
        assert_eq!(merged.meta.max, Some(40.0));
        assert_eq!(merged.meta.description.as_deref(), Some("Read depth"));

        let text = column("DP", &[("high", 0)]);
        assert!(!a.merge_remapped(&text, &[0]).meta.continuous);
    }

    #[test]
    fn store_lookups_and_ranges() {
        let dir = tempdir().unwrap();
        let af = column("AF", &[("0.1", 0), ("0.2", 1), ("0.9", 2), ("0.2", 3)]);
        af.write_to(&dir.path().join("AF.vidx")).unwrap();
        assert_eq!(InfoColumnIndex::read_from(&dir.path().join("AF.vidx")).unwrap(), af);

        let entries = vec![InfoColumnEntry {
            file: "AF.vidx".into(),
            meta: af.meta.clone(),
        }];
        let store = InfoStore::new(dir.path(), &entries, 4, 0.1, 1_000);

        assert_eq!(store.columns().count(), 1);
        assert_eq!(store.column_values("AF").unwrap(), vec!["0.1", "0.2", "0.9"]);
        assert_eq!(store.lookup("AF", "0.2").unwrap().to_ids().iter().collect::<Vec<_>>(), vec![1, 3]);
        assert!(store.lookup("AF", "0.3").unwrap().is_empty());
        assert!(store.lookup("GENE", "x").unwrap().is_empty());
        assert_eq!(
            store.lookup_range("AF", 0.15, 1.0).unwrap().to_ids().iter().collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let any = store
            .lookup_any("AF", &["0.1".to_string(), "0.9".to_string()])
            .unwrap();
        assert_eq!(any.to_ids().iter().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn foreign_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.vidx");
        std::fs::write(&path, b"NOPE\x01").unwrap();
        assert!(matches!(
            InfoColumnIndex::read_from(&path),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
