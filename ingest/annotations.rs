use crate::config::StoreConfig;
use crate::info::{InfoColumnIndex, InfoColumnMeta};
use crate::spec_index::VariantSpecIndex;
use crate::variant::VariantKey;
use ahash::AHashMap;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Value indexed for an INFO flag, which carries no `=value` part.
pub const FLAG_VALUE: &str = "true";

/// Splits raw INFO text into `(column, values)` pairs. Multi-valued fields contribute
/// each comma-separated value; missing values (`.`) are dropped.
pub fn parse_info(text: &str) -> Result<Vec<(&str, Vec<&str>)>, String> {
    let mut fields = Vec::new();
    for token in text.split(';').map(str::trim).filter(|t| !t.is_empty()) {
        let (key, values) = match token.split_once('=') {
            Some((key, raw)) => (
                key.trim(),
                raw.split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty() && *v != ".")
                    .collect(),
            ),
            None => (token, vec![FLAG_VALUE]),
        };
        if key.is_empty() {
            return Err(format!("field '{token}' has no key"));
        }
        fields.push((key, values));
    }
    Ok(fields)
}

/// Collects INFO text per contig and folds it into per-column value indexes once the
/// contig's variant ids are known. Each distinct INFO string is parsed once per contig.
pub struct InfoAccumulator {
    config: StoreConfig,
    descriptions: AHashMap<String, String>,
    pending: AHashMap<Arc<str>, Vec<VariantKey>>,
    columns: BTreeMap<String, InfoColumnIndex>,
    malformed: u64,
}

impl InfoAccumulator {
    pub fn new(config: &StoreConfig, descriptions: AHashMap<String, String>) -> Self {
        Self {
            config: config.clone(),
            descriptions,
            pending: AHashMap::new(),
            columns: BTreeMap::new(),
            malformed: 0,
        }
    }

    pub fn record(&mut self, key: &VariantKey, info: &Arc<str>) {
        self.pending.entry(info.clone()).or_default().push(key.clone());
    }

    /// Indexes every INFO string gathered for the finished contig. Variants that never
    /// received an id are ignored.
    pub fn flush_contig(&mut self, specs: &VariantSpecIndex) {
        let pending = std::mem::take(&mut self.pending);
        let unique = pending.len();
        for (text, keys) in pending {
            let fields = match parse_info(&text) {
                Ok(fields) => fields,
                Err(reason) => {
                    self.malformed += 1;
                    warn!("skipping malformed INFO '{text}': {reason}");
                    continue;
                }
            };
            let ids: Vec<u32> = keys.iter().filter_map(|k| specs.id_of(k)).collect();
            if ids.is_empty() {
                continue;
            }
            for (column, values) in fields {
                if !self.config.indexes_column(column) {
                    continue;
                }
                let index = self.columns.entry(column.to_string()).or_insert_with(|| {
                    InfoColumnIndex::new(InfoColumnMeta::new(
                        column,
                        self.descriptions.get(column).cloned(),
                    ))
                });
                for value in &values {
                    for &id in &ids {
                        index.add(value, id);
                    }
                }
            }
        }
        debug!("indexed {unique} distinct INFO strings");
    }

    /// Number of INFO strings skipped as malformed.
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    pub fn finish(self) -> Vec<InfoColumnIndex> {
        self.columns
            .into_values()
            .filter(|index| !index.is_empty())
            .map(|mut index| {
                index.finalize_meta();
                index
            })
            .collect()
    }
}
