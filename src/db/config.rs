use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{page, PenumbraError, Result};

/// Database-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Page size for new files; existing files must match.
    pub page_size: u32,
    /// Background index loader workers; 0 uses the available parallelism.
    pub max_num_threads: usize,
    /// Open without ever writing the main, WAL or shadow file.
    pub read_only: bool,
    /// Checkpoint after a commit once the WAL outgrows the threshold.
    pub auto_checkpoint: bool,
    /// WAL size in bytes that triggers an automatic checkpoint.
    pub checkpoint_threshold: u64,
    /// Checkpoint when the database is closed or dropped.
    pub force_checkpoint_on_close: bool,
    /// Fail the open when a WAL record cannot be replayed.
    pub throw_on_wal_replay_failure: bool,
    /// Verify CRCs when reading persisted structures.
    pub enable_checksums: bool,
    /// Capacity of the page cache.
    pub buffer_pool_pages: usize,
    /// Longest string kept inline; longer ones spill to the overflow store.
    pub overflow_inline_limit: usize,
    /// Materialize similarity indexes in the background after open.
    pub background_index_load: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            page_size: page::DEFAULT_PAGE_SIZE,
            max_num_threads: 0,
            read_only: false,
            auto_checkpoint: true,
            checkpoint_threshold: 16 * 1024 * 1024,
            force_checkpoint_on_close: true,
            throw_on_wal_replay_failure: true,
            enable_checksums: true,
            buffer_pool_pages: 1024,
            overflow_inline_limit: 60,
            background_index_load: true,
        }
    }
}

/// Errors loading a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Config file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`SystemConfig`].
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Config file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl SystemConfig {
    /// Loads settings from a TOML file; missing keys keep their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        Ok(config)
    }

    /// Parses settings from TOML text.
    pub fn from_toml_str(contents: &str) -> std::result::Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        Ok(config)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !page::is_valid_page_size(self.page_size) {
            return Err(PenumbraError::InvalidOwned(format!(
                "page size {} must be a power of two between {} and {}",
                self.page_size,
                page::MIN_PAGE_SIZE,
                page::MAX_PAGE_SIZE
            )));
        }
        if self.buffer_pool_pages == 0 {
            return Err(PenumbraError::Invalid("buffer pool needs at least one page"));
        }
        Ok(())
    }

    /// Worker count for the index loader.
    pub fn loader_threads(&self) -> usize {
        if self.max_num_threads > 0 {
            return self.max_num_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Settings for opening an existing file without writing to it.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }
}

/// Returns true for a path that selects an in-memory database.
pub fn is_in_memory_path(path: &Path) -> bool {
    path.as_os_str().is_empty() || path.as_os_str() == ":memory:"
}
