//! TOML engine configuration.
//!
//! ```toml
//! [cache]
//! block_size = 4096
//! slice_num = 0
//! path = "shard0.blocks"
//!
//! [slice]
//! backfill_cache_priority = 10
//! root_eviction_priority = 100
//! ```
//!
//! Every key is optional; missing keys take the defaults of
//! [`CacheOptions`] and [`SliceOptions`].

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::primitives::cache::{CacheOptions, EvictionPriority, MIN_BLOCK_SIZE};
use crate::storage::SliceOptions;

/// Failure to load or validate an [`EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read engine config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The text is not valid TOML for this schema.
    #[error("failed to parse engine config {origin}: {source}")]
    Parse {
        /// File path, or `<inline>` for in-memory text.
        origin: String,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// The configuration could not be rendered as TOML.
    #[error("failed to serialize engine config: {source}")]
    Serialize {
        /// Underlying error.
        source: toml::ser::Error,
    },
    /// A value parsed but is out of range.
    #[error("engine config key `{key}` is invalid: {reason}")]
    Invalid {
        /// Dotted key name.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawCache {
    #[serde(skip_serializing_if = "Option::is_none")]
    block_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    slice_num: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawSlice {
    #[serde(skip_serializing_if = "Option::is_none")]
    backfill_cache_priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    root_eviction_priority: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    cache: RawCache,
    slice: RawSlice,
}

/// Parsed engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    source: Option<PathBuf>,
    data: RawConfig,
}

impl EngineConfig {
    /// Loads and validates the TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let data = parse(&contents, &path.display().to_string())?;
        debug!(path = %path.display(), "config.load");
        Ok(Self {
            source: Some(path.to_path_buf()),
            data,
        })
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            source: None,
            data: parse(text, "<inline>")?,
        })
    }

    /// Renders the configuration back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(&self.data).map_err(|source| ConfigError::Serialize { source })
    }

    /// File this configuration was loaded from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Cache options with unset keys left at their defaults.
    ///
    /// A relative `path` resolves against the directory of the loaded file.
    pub fn cache_options(&self) -> CacheOptions {
        let raw = &self.data.cache;
        let mut options = CacheOptions::default();
        if let Some(block_size) = raw.block_size {
            options = options.block_size(block_size);
        }
        if let Some(slice_num) = raw.slice_num {
            options = options.slice_num(slice_num);
        }
        if let Some(path) = &raw.path {
            options = options.path(self.resolve(path));
        }
        options
    }

    /// Slice options with unset keys left at their defaults.
    pub fn slice_options(&self) -> SliceOptions {
        let raw = &self.data.slice;
        let mut options = SliceOptions::default();
        if let Some(priority) = raw.backfill_cache_priority {
            options = options.backfill_cache_priority(priority);
        }
        if let Some(priority) = raw.root_eviction_priority {
            options = options.root_eviction_priority(EvictionPriority(priority));
        }
        options
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match self.source.as_deref().and_then(Path::parent) {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }
}

fn parse(text: &str, origin: &str) -> Result<RawConfig, ConfigError> {
    let data: RawConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
        origin: origin.to_string(),
        source,
    })?;
    validate(&data)?;
    Ok(data)
}

fn validate(data: &RawConfig) -> Result<(), ConfigError> {
    if let Some(block_size) = data.cache.block_size {
        if block_size < MIN_BLOCK_SIZE {
            return Err(ConfigError::Invalid {
                key: "cache.block_size",
                reason: format!("{block_size} is below the minimum of {MIN_BLOCK_SIZE}"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::cache::DEFAULT_BLOCK_SIZE;
    use crate::storage::BACKFILL_CACHE_PRIORITY;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_config_uses_defaults() -> Result<(), ConfigError> {
        let config = EngineConfig::from_toml_str("")?;
        let cache = config.cache_options();
        assert_eq!(cache.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(cache.slice_num, 0);
        assert!(cache.path.is_none());
        let slice = config.slice_options();
        assert_eq!(slice.backfill_cache_priority, BACKFILL_CACHE_PRIORITY);
        assert_eq!(slice.root_eviction_priority, EvictionPriority::INITIAL_ROOT);
        Ok(())
    }

    #[test]
    fn sections_override_defaults() -> Result<(), ConfigError> {
        let config = EngineConfig::from_toml_str(
            "[cache]\nblock_size = 8192\nslice_num = 3\n\n[slice]\nbackfill_cache_priority = 2\nroot_eviction_priority = 50\n",
        )?;
        assert_eq!(config.cache_options().block_size, 8192);
        assert_eq!(config.cache_options().slice_num, 3);
        assert_eq!(config.slice_options().backfill_cache_priority, 2);
        assert_eq!(config.slice_options().root_eviction_priority, EvictionPriority(50));
        let again = EngineConfig::from_toml_str(&config.to_toml_string()?)?;
        assert_eq!(again, config);
        Ok(())
    }

    #[test]
    fn small_block_size_is_rejected() {
        let err = EngineConfig::from_toml_str("[cache]\nblock_size = 100\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "cache.block_size", .. }));
    }

    #[test]
    fn unknown_keys_fail_to_parse() {
        let err = EngineConfig::from_toml_str("[cache]\npage_size = 4096\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn relative_paths_resolve_next_to_the_file() -> Result<(), ConfigError> {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[cache]\npath = \"shard.blocks\"").unwrap();
        let config = EngineConfig::load(file.path())?;
        let dir = file.path().parent().unwrap();
        assert_eq!(config.cache_options().path, Some(dir.join("shard.blocks")));
        assert_eq!(config.source(), Some(file.path()));
        Ok(())
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = EngineConfig::load("/nonexistent/slicestore.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
