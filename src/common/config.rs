use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bincode::config as bincode_config;
use serde::{Deserialize, Serialize};

use crate::common::exception::ConfigError;

pub type RecordId = u64; // unique record identifier
pub type ContainerId = u64; // persistence container (job) identifier
pub type LeafId = u32; // storage leaf identifier
pub type Ident = u64; // platform, sensor type and method identifiers

/// Id `0` is never assigned to a record; indexing rejects it.
pub const RESERVED_RECORD_ID: RecordId = 0;

/// Records nested deeper than this are treated as malformed during size calculation.
pub const MAX_NESTING_DEPTH: usize = 256;

/// Marks the start of every index container frame.
pub const INDEX_FRAME_MAGIC: u32 = 0x5046_4958;

/// Magic, body length and body checksum in front of every index container frame.
pub const INDEX_FRAME_HEADER_SIZE: usize = 12;

pub const DATA_FILE_EXTENSION: &str = "data";
pub const INDEX_FILE_EXTENSION: &str = "index";

/// Width of one timestamp bucket used by the default indexing schemes.
pub const DEFAULT_TIME_BUCKET_MS: i64 = 15 * 60 * 1000;

/// How long the analyzer parks when the chain has nothing to analyze.
pub static ANALYZER_IDLE_WAIT: Duration = Duration::from_millis(50);

/// How many times an I/O request retries reopening an evicted handle before giving up.
pub const MAX_REOPEN_ATTEMPTS: usize = 64;

/// Backoff between reopen attempts when every handle slot is busy.
pub static REOPEN_BACKOFF: Duration = Duration::from_millis(2);

/// Configuration of the buffer, eviction and storage data plane.
///
/// Every field has a default, so a TOML file only needs to name the options it changes:
///
/// ```toml
/// max_open_handles = 16
/// buffer_size = 8192
/// eviction_interval_ms = 250
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPlaneConfig {
    /// Upper bound on concurrently open file handles.
    pub max_open_handles: usize,
    /// Size in bytes of every pooled I/O buffer.
    pub buffer_size: usize,
    /// Upper bound on buffers ever created by the pool.
    pub pool_max_capacity: usize,
    /// Idle buffers kept on release; anything above is dropped.
    pub pool_min_capacity: usize,
    /// Evictor cadence.
    pub eviction_interval_ms: u64,
    /// Memory budget of the record chain, in computed footprint bytes.
    pub buffer_max_size: u64,
    /// Occupancy (0..=1) above which the chain starts evicting.
    pub eviction_occupancy_percentage: f32,
    /// Share (0..=1) of `buffer_max_size` released by one eviction pass.
    pub eviction_fragment_size_percentage: f32,
    /// Safety margin added on top of the computed record footprint.
    pub object_expansion_rate: f32,
    /// Directory holding one data and one index container per persistence job.
    pub storage_root: PathBuf,
}

impl Default for DataPlaneConfig {
    fn default() -> Self {
        Self {
            max_open_handles: 64,
            buffer_size: 64 * 1024,
            pool_max_capacity: 256,
            pool_min_capacity: 32,
            eviction_interval_ms: 500,
            buffer_max_size: 64 * 1024 * 1024,
            eviction_occupancy_percentage: 0.8,
            eviction_fragment_size_percentage: 0.1,
            object_expansion_rate: 0.1,
            storage_root: PathBuf::from("./storage"),
        }
    }
}

impl DataPlaneConfig {
    /// Loads and validates a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: DataPlaneConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be positive".into()));
        }
        if self.pool_max_capacity == 0 {
            return Err(ConfigError::Invalid("pool_max_capacity must be positive".into()));
        }
        if self.pool_min_capacity > self.pool_max_capacity {
            return Err(ConfigError::Invalid(format!(
                "pool_min_capacity ({}) exceeds pool_max_capacity ({})",
                self.pool_min_capacity, self.pool_max_capacity
            )));
        }
        if self.eviction_interval_ms == 0 {
            return Err(ConfigError::Invalid("eviction_interval_ms must be positive".into()));
        }
        for (name, value) in [
            ("eviction_occupancy_percentage", self.eviction_occupancy_percentage),
            ("eviction_fragment_size_percentage", self.eviction_fragment_size_percentage),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Invalid(format!("{name} must be within (0, 1], got {value}")));
            }
        }
        if !(self.object_expansion_rate >= 0.0) {
            return Err(ConfigError::Invalid("object_expansion_rate must not be negative".into()));
        }
        Ok(())
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms)
    }
}

/// Bincode configuration for everything written to data and index containers.
///
/// NOTE: Changing this is an on-disk format change.
pub(crate) fn storage_bincode_config() -> impl bincode_config::Config {
    // Pin the policy instead of relying on `standard()` defaults, which may drift across
    // bincode versions: little-endian, fixed-width integers.
    bincode_config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}
