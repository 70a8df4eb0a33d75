use crate::value_index::DEFAULT_SPARSE_THRESHOLD;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables shared by ingestion, merging and querying. Every field has a default, so an
/// empty or partial TOML file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Match ratio below which a variant id set is held sparse.
    pub sparse_threshold: f64,
    /// Budget, in stored elements, of each store's resolved-lookup cache.
    pub info_cache_weight: usize,
    /// Completed buckets that may wait for the persistence worker.
    pub persistence_queue_depth: usize,
    /// Worker threads for parallel stages; all logical CPUs when unset.
    pub worker_threads: Option<usize>,
    /// Deflate level (0-9) for bucket payloads.
    pub compression_level: u32,
    /// When set, only these INFO columns are indexed.
    pub info_columns: Option<Vec<String>>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sparse_threshold: DEFAULT_SPARSE_THRESHOLD,
            info_cache_weight: 50_000_000,
            persistence_queue_depth: 4,
            worker_threads: None,
            compression_level: 6,
            info_columns: None,
        }
    }
}

impl StoreConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_path(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Loads `path` when given, otherwise the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_toml_path(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.sparse_threshold > 0.0 && self.sparse_threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "sparse_threshold must lie in (0, 1], got {}",
                self.sparse_threshold
            )));
        }
        if self.persistence_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "persistence_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.worker_threads == Some(0) {
            return Err(ConfigError::Invalid(
                "worker_threads must be at least 1 when set".to_string(),
            ));
        }
        if self.compression_level > 9 {
            return Err(ConfigError::Invalid(format!(
                "compression_level must be between 0 and 9, got {}",
                self.compression_level
            )));
        }
        Ok(())
    }

    pub fn threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn compression(&self) -> Compression {
        Compression::new(self.compression_level)
    }

    /// Whether `column` should be indexed under the allow-list.
    pub fn indexes_column(&self, column: &str) -> bool {
        self.info_columns
            .as_ref()
            .is_none_or(|allowed| allowed.iter().any(|c| c == column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        assert_eq!(StoreConfig::from_toml_str("").unwrap(), StoreConfig::default());
    }

    #[test]
    fn partial_document_overrides_named_fields() {
        let config = StoreConfig::from_toml_str(
            "sparse_threshold = 0.25\nworker_threads = 3\ninfo_columns = [\"AF\", \"GENE\"]\n",
        )
        .unwrap();
        assert_eq!(config.sparse_threshold, 0.25);
        assert_eq!(config.threads(), 3);
        assert!(config.indexes_column("AF"));
        assert!(!config.indexes_column("DP"));
        assert_eq!(config.persistence_queue_depth, 4);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            StoreConfig::from_toml_str("sparse_threshold = 1.5"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            StoreConfig::from_toml_str("persistence_queue_depth = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            StoreConfig::from_toml_str("unknown = 1"),
            Err(ConfigError::TomlParseError(_))
        ));
    }

    #[test]
    fn no_allow_list_indexes_everything() {
        assert!(StoreConfig::default().indexes_column("ANY"));
    }
}
