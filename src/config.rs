//! Index configuration, loadable from TOML.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layers::{Layer, LayerKind};
use crate::pager::{PagerOptions, Synchronous, DEFAULT_PAGE_SIZE};

/// Errors raised while loading or validating an [`IndexConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read index config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for [`IndexConfig`].
    #[error("failed to parse index config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A value is out of range or inconsistent.
    #[error("invalid index config: {0}")]
    Invalid(String),
}

/// Declares one layer of the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Name callers pass to [`crate::FileTransaction::layer`].
    pub id: String,
    /// Edge shape stored for each location.
    pub kind: LayerKind,
}

/// Tunables for opening an index file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Page size in bytes; fixed when the file is created.
    pub page_size: u32,
    /// Capacity of the clean-page LRU cache.
    pub cache_pages: usize,
    /// Capacity of the catalog's id to position cache.
    pub mapping_cache_entries: usize,
    /// WAL fsync policy.
    pub synchronous: Synchronous,
    /// Rejects every mutation when set.
    pub read_only: bool,
    /// Number of pages the file is preallocated to on creation.
    pub initial_pages: u32,
    /// Stores an 8-byte timestamp next to every tree item.
    pub record_timestamps: bool,
    /// Layers in catalog slot order. Changing the list forces a rebuild.
    pub layers: Vec<LayerConfig>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE as u32,
            cache_pages: 1024,
            mapping_cache_entries: 4096,
            synchronous: Synchronous::Full,
            read_only: false,
            initial_pages: 0,
            record_timestamps: false,
            layers: vec![
                LayerConfig {
                    id: "bidirectional-edges".into(),
                    kind: LayerKind::Bidirectional,
                },
                LayerConfig {
                    id: "reverse-edges".into(),
                    kind: LayerKind::Reverse,
                },
            ],
        }
    }
}

impl IndexConfig {
    /// Fsyncs every commit; the default.
    pub fn durable() -> Self {
        Self::default()
    }

    /// Larger caches and no fsync, for bulk rebuilds.
    pub fn fast() -> Self {
        Self {
            page_size: 4096,
            cache_pages: 8192,
            mapping_cache_entries: 65_536,
            synchronous: Synchronous::Off,
            ..Self::default()
        }
    }

    /// Small pages and caches so tests exercise splitting and eviction.
    pub fn testing() -> Self {
        Self {
            page_size: 512,
            cache_pages: 16,
            mapping_cache_entries: 32,
            synchronous: Synchronous::Off,
            ..Self::default()
        }
    }

    /// Parses TOML. `origin` only names the source in errors.
    pub fn from_toml_str(contents: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: IndexConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates the TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents, path)
    }

    /// Checks the page size and the layer declarations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two() || !(512..=32_768).contains(&self.page_size) {
            return Err(ConfigError::Invalid(format!(
                "page_size {} must be a power of two between 512 and 32768",
                self.page_size
            )));
        }
        if self.layers.is_empty() {
            return Err(ConfigError::Invalid("at least one layer is required".into()));
        }
        let mut seen = HashSet::new();
        for layer in &self.layers {
            if layer.id.is_empty() {
                return Err(ConfigError::Invalid("layer id must not be empty".into()));
            }
            if !seen.insert(layer.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "layer '{}' declared twice",
                    layer.id
                )));
            }
        }
        Ok(())
    }

    /// Layers in declaration order; their position decides the catalog slot.
    pub fn layer_list(&self) -> Vec<Layer> {
        self.layers
            .iter()
            .map(|layer| Layer::new(layer.id.clone(), layer.kind))
            .collect()
    }

    /// Pager settings derived from this config.
    pub fn pager_options(&self) -> PagerOptions {
        PagerOptions {
            page_size: self.page_size,
            cache_pages: self.cache_pages,
            synchronous: self.synchronous,
            read_only: self.read_only,
            initial_pages: self.initial_pages,
        }
    }
}
