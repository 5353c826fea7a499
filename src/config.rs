// In: src/config.rs

//! The single source of truth for all tabulon engine configuration.
//!
//! `EngineConfig` is created once at the application boundary (e.g. from a JSON
//! file handed over by the bootstrap layer) and then passed down through the
//! system as a shared, read-only `Arc<EngineConfig>`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::TabularError;

//==================================================================================
// I. Parallel Execution
//==================================================================================

/// How the parallel executor fans work out over its workers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum FanOutStrategy {
    /// **Default:** partition the whole table once, submit one job per partition
    /// and merge every result in a single pass.
    SingleLevel,

    /// Recursively split partitions in parallel waves until each one is under
    /// both thresholds, then merge results back in bounded `fan_out`-way waves.
    /// Bounds peak per-worker memory on very large inputs.
    Recursive {
        /// Number of sub-partitions a split produces, and merge arity.
        #[serde(default = "default_fan_out")]
        fan_out: usize,
        /// A partition with more rows than this is split further.
        #[serde(default = "default_max_rows_per_job")]
        max_rows_per_job: usize,
        /// A partition with more distinct groups than this is split further.
        #[serde(default = "default_max_groups_per_job")]
        max_groups_per_job: usize,
    },
}

impl Default for FanOutStrategy {
    fn default() -> Self {
        FanOutStrategy::SingleLevel
    }
}

/// The channel partitions travel through between the coordinator and its workers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Handoff {
    /// **Default:** every partition and every result is written to an encoded
    /// columnar archive in a scratch directory owned by the run.
    #[default]
    Archive,
    /// Partitions are shared as immutable in-memory buffers.
    InMemory,
}

/// Settings for the parallel transform executor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ParallelConfig {
    /// Number of worker threads. `None` means one per available CPU.
    #[serde(default)]
    pub n_jobs: Option<usize>,

    #[serde(default)]
    pub strategy: FanOutStrategy,

    /// Expected rows per group, used to size candidate group batches when
    /// partitioning by a group column.
    #[serde(default = "default_avg_rows_per_group_hint")]
    pub avg_rows_per_group_hint: usize,

    #[serde(default)]
    pub handoff: Handoff,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            n_jobs: None,
            strategy: FanOutStrategy::default(),
            avg_rows_per_group_hint: default_avg_rows_per_group_hint(),
            handoff: Handoff::default(),
        }
    }
}

impl ParallelConfig {
    /// Resolves `n_jobs` against the machine.
    pub fn effective_jobs(&self) -> usize {
        self.n_jobs.filter(|&n| n > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

//==================================================================================
// II. Logging
//==================================================================================

/// Settings consumed by `observability::init_logging`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingConfig {
    /// A `log` level name ("error", "warn", "info", "debug", "trace").
    #[serde(default)]
    pub level: Option<String>,
    /// Append log lines to this file instead of stderr.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

//==================================================================================
// III. The Unified EngineConfig
//==================================================================================

/// The single, unified configuration for the engine.
/// This struct is created once and shared throughout the system via an `Arc`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// **The target number of rows per chunk** for chunked loads and contiguous
    /// partitioning.
    #[serde(default = "default_chunk_size_rows")]
    pub chunk_size_rows: usize,

    /// Local data directory supplied by the bootstrap layer. Scratch files live
    /// under `<data_dir>/tmp`; without it the OS temp directory is used.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Zstd level used when a flat file store is asked to compress.
    #[serde(default = "default_compression_level")]
    pub flat_file_compression_level: i32,

    #[serde(default)]
    pub parallel: ParallelConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size_rows: default_chunk_size_rows(),
            data_dir: None,
            flat_file_compression_level: default_compression_level(),
            parallel: ParallelConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, TabularError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, TabularError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Directory for scratch files, created on demand.
    pub fn temp_dir(&self) -> Result<PathBuf, TabularError> {
        let dir = match &self.data_dir {
            Some(data_dir) => data_dir.join("tmp"),
            None => std::env::temp_dir(),
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn validate(&self) -> Result<(), TabularError> {
        if self.chunk_size_rows == 0 {
            return Err(TabularError::InvalidArgument(
                "chunk_size_rows must be greater than zero".into(),
            ));
        }
        if self.parallel.avg_rows_per_group_hint == 0 {
            return Err(TabularError::InvalidArgument(
                "avg_rows_per_group_hint must be greater than zero".into(),
            ));
        }
        if let FanOutStrategy::Recursive { fan_out, .. } = self.parallel.strategy {
            if fan_out < 2 {
                return Err(TabularError::InvalidArgument(
                    "recursive fan_out must be at least 2".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Provides a sensible default for `chunk_size_rows` for serde.
fn default_chunk_size_rows() -> usize {
    1_048_576
}

fn default_compression_level() -> i32 {
    3
}

fn default_avg_rows_per_group_hint() -> usize {
    10
}

fn default_fan_out() -> usize {
    2
}

fn default_max_rows_per_job() -> usize {
    default_chunk_size_rows()
}

fn default_max_groups_per_job() -> usize {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn parses_recursive_strategy_with_partial_fields() {
        let config = EngineConfig::from_json_str(
            r#"{
                "chunk_size_rows": 500,
                "parallel": {
                    "n_jobs": 4,
                    "strategy": { "strategy": "recursive", "fan_out": 3 },
                    "handoff": "in_memory"
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.chunk_size_rows, 500);
        assert_eq!(config.parallel.effective_jobs(), 4);
        assert_eq!(config.parallel.handoff, Handoff::InMemory);
        assert_eq!(
            config.parallel.strategy,
            FanOutStrategy::Recursive {
                fan_out: 3,
                max_rows_per_job: default_max_rows_per_job(),
                max_groups_per_job: default_max_groups_per_job(),
            }
        );
    }

    #[test]
    fn rejects_degenerate_values() {
        assert!(EngineConfig::from_json_str(r#"{"chunk_size_rows": 0}"#).is_err());
        assert!(EngineConfig::from_json_str(
            r#"{"parallel": {"strategy": {"strategy": "recursive", "fan_out": 1}}}"#
        )
        .is_err());
    }

    #[test]
    fn temp_dir_lives_under_data_dir() {
        let root = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            data_dir: Some(root.path().to_path_buf()),
            ..Default::default()
        };
        let tmp = config.temp_dir().unwrap();
        assert_eq!(tmp, root.path().join("tmp"));
        assert!(tmp.is_dir());
    }
}
