use crate::error::{IoContext, StoreError};
use crate::variant::VariantKey;
use ahash::AHashMap;
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Position of a variant in its store's spec list.
pub type VariantId = u32;

/// Every variant key of a store, in id order. Append-only while a store is built.
#[derive(Debug, Clone, Default)]
pub struct VariantSpecIndex {
    specs: Vec<VariantKey>,
    ids: AHashMap<VariantKey, VariantId>,
}

impl VariantSpecIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `key` and returns its id, or returns the id it already has.
    pub fn push(&mut self, key: VariantKey) -> VariantId {
        if let Some(&id) = self.ids.get(&key) {
            return id;
        }
        let id = self.specs.len() as VariantId;
        self.ids.insert(key.clone(), id);
        self.specs.push(key);
        id
    }

    pub fn get(&self, id: VariantId) -> Option<&VariantKey> {
        self.specs.get(id as usize)
    }

    pub fn id_of(&self, key: &VariantKey) -> Option<VariantId> {
        self.ids.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VariantKey> {
        self.specs.iter()
    }

    /// Starts from `a`'s list and appends `b`'s keys that `a` lacks. The returned table
    /// maps each id of `b` to its id in the merged list.
    pub fn reconcile(a: &VariantSpecIndex, b: &VariantSpecIndex) -> (VariantSpecIndex, Vec<VariantId>) {
        let mut merged = a.clone();
        let remap = b.specs.iter().map(|key| merged.push(key.clone())).collect();
        (merged, remap)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), StoreError> {
        let file = File::create(path).at(path)?;
        let mut writer = BufWriter::new(GzEncoder::new(file, Compression::default()));
        for key in &self.specs {
            writeln!(writer, "{key}").at(path)?;
        }
        let encoder = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .at(path)?;
        encoder.finish().at(path)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self, StoreError> {
        let file = File::open(path).at(path)?;
        let reader = BufReader::new(MultiGzDecoder::new(file));
        let mut index = VariantSpecIndex::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.at(path)?;
            if line.is_empty() {
                continue;
            }
            let key = line.parse::<VariantKey>().map_err(|e| {
                StoreError::corrupt(path, format!("line {}: {e}", line_no + 1))
            })?;
            index.push(key);
        }
        Ok(index)
    }
}
