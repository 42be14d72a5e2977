//! Store configuration
//!
//! Everything that used to be process-wide state (pool bound, statement cache
//! sizes, thresholds) lives here and is handed to the manager explicitly.

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Read connections allowed per CPU core
pub const READ_CONNECTIONS_PER_CPU: usize = 16;

/// WAL size (in pages) at which the writer checkpoints synchronously
pub const DEFAULT_CHECKPOINT_BLOCKING_PAGES: u32 = 10_000;

/// Free space required before database files are recreated (5 MiB)
pub const DEFAULT_MIN_FREE_SPACE: u64 = 5 * 1024 * 1024;

/// File size above which a VACUUM is run (4 GiB)
pub const DEFAULT_VACUUM_THRESHOLD: u64 = 4 * 1024 * 1024 * 1024;

/// Store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the main database, graph databases and the marker file
    pub data_dir: PathBuf,

    /// File name of the main database
    pub database_file: String,

    /// File name of the crash marker
    pub marker_file: String,

    /// `PRAGMA cache_size`, applied to main and attached databases
    pub cache_size: i64,

    /// `PRAGMA page_size`; `None` leaves the engine default alone
    pub page_size: Option<u32>,

    /// `PRAGMA journal_size_limit` in bytes
    pub journal_size_limit: i64,

    /// Capacity of the per-connection select statement cache (0 disables it)
    pub select_cache_size: usize,

    /// Capacity of the per-connection update statement cache (0 disables it)
    pub update_cache_size: usize,

    /// Upper bound on pooled read connections
    pub max_read_connections: usize,

    /// WAL pages at which a commit triggers a blocking checkpoint
    pub checkpoint_blocking_pages: u32,

    /// Minimum free bytes required to recreate the database
    pub min_free_space: u64,

    /// Main file size that triggers a VACUUM
    pub vacuum_threshold: u64,

    /// Collation locale; `None` means "whatever the process runs with"
    pub locale: Option<String>,

    /// Tokenizer version recorded alongside the FTS flags
    pub parser_version: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            database_file: "meta.db".to_string(),
            marker_file: ".meta.isrunning".to_string(),
            cache_size: 2000,
            page_size: Some(8192),
            journal_size_limit: 10_240_000,
            select_cache_size: 100,
            update_cache_size: 100,
            max_read_connections: READ_CONNECTIONS_PER_CPU * num_cpus::get(),
            checkpoint_blocking_pages: DEFAULT_CHECKPOINT_BLOCKING_PAGES,
            min_free_space: DEFAULT_MIN_FREE_SPACE,
            vacuum_threshold: DEFAULT_VACUUM_THRESHOLD,
            locale: None,
            parser_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl StoreConfig {
    /// Default configuration rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(contents: &str) -> StoreResult<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Absolute path of the main database file
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    /// Absolute path of the crash marker file
    pub fn marker_path(&self) -> PathBuf {
        self.data_dir.join(&self.marker_file)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> StoreResult<()> {
        if self.database_file.is_empty() {
            return Err(StoreError::Config(
                "database_file must not be empty".to_string(),
            ));
        }

        if self.marker_file.is_empty() || self.marker_file == self.database_file {
            return Err(StoreError::Config(
                "marker_file must be set and differ from database_file".to_string(),
            ));
        }

        if self.max_read_connections == 0 {
            return Err(StoreError::Config(
                "max_read_connections must be greater than 0".to_string(),
            ));
        }

        if self.checkpoint_blocking_pages == 0 {
            return Err(StoreError::Config(
                "checkpoint_blocking_pages must be greater than 0".to_string(),
            ));
        }

        if let Some(page_size) = self.page_size {
            if !(512..=65536).contains(&page_size) || !page_size.is_power_of_two() {
                return Err(StoreError::Config(format!(
                    "page_size must be a power of two between 512 and 65536, got {}",
                    page_size
                )));
            }
        }

        Ok(())
    }
}

/// Full-text tokenizer switches, persisted as the `fts-flags` metadata value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtsFlags {
    pub enable_stemmer: bool,
    pub enable_unaccent: bool,
    pub enable_stop_words: bool,
    pub ignore_numbers: bool,
}

impl FtsFlags {
    const STEMMER: i64 = 1 << 0;
    const UNACCENT: i64 = 1 << 1;
    const STOP_WORDS: i64 = 1 << 2;
    const IGNORE_NUMBERS: i64 = 1 << 3;

    /// Integer form stored in the metadata table
    pub fn bits(&self) -> i64 {
        let mut bits = 0;
        if self.enable_stemmer {
            bits |= Self::STEMMER;
        }
        if self.enable_unaccent {
            bits |= Self::UNACCENT;
        }
        if self.enable_stop_words {
            bits |= Self::STOP_WORDS;
        }
        if self.ignore_numbers {
            bits |= Self::IGNORE_NUMBERS;
        }
        bits
    }

    /// Inverse of [`FtsFlags::bits`]; unknown bits are ignored
    pub fn from_bits(bits: i64) -> Self {
        Self {
            enable_stemmer: bits & Self::STEMMER != 0,
            enable_unaccent: bits & Self::UNACCENT != 0,
            enable_stop_words: bits & Self::STOP_WORDS != 0,
            ignore_numbers: bits & Self::IGNORE_NUMBERS != 0,
        }
    }
}

/// Flags for a single [`DatabaseManager::open`](crate::DatabaseManager::open) call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Direct access: never create, recreate, or write the database
    pub read_only: bool,
    /// Drop and rebuild the database regardless of its state
    pub force_reindex: bool,
    /// Only resolve locations; used before wiping all files
    pub remove_all: bool,
    /// Open connections in serialized (full mutex) threading mode
    pub enable_mutexes: bool,
    /// A backup is being restored: corruption is an error, never a recreate
    pub restoring_backup: bool,
    /// Tokenizer switches requested by the caller
    pub fts: FtsFlags,
}

impl OpenOptions {
    pub fn read_write() -> Self {
        Self::default()
    }

    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn with_force_reindex(mut self, force: bool) -> Self {
        self.force_reindex = force;
        self
    }

    pub fn with_restoring_backup(mut self, restoring: bool) -> Self {
        self.restoring_backup = restoring;
        self
    }

    pub fn with_mutexes(mut self, enabled: bool) -> Self {
        self.enable_mutexes = enabled;
        self
    }

    pub fn with_fts(mut self, fts: FtsFlags) -> Self {
        self.fts = fts;
        self
    }
}
