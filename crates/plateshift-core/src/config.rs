//! Transfer engine configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// Smallest chunk size accepted by the copier.
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;

/// Files x chunk-streams above which a sizing warning is logged.
pub const STREAM_BUDGET_GUIDELINE: usize = 64;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Two-level concurrency limits for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Files transferred simultaneously.
    #[serde(default = "default_file_concurrency")]
    pub max_file_concurrency: usize,
    /// Parallel range streams per large file.
    #[serde(default = "default_chunk_concurrency")]
    pub max_chunk_concurrency: usize,
}

fn default_file_concurrency() -> usize {
    4
}

fn default_chunk_concurrency() -> usize {
    4
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_file_concurrency: default_file_concurrency(),
            max_chunk_concurrency: default_chunk_concurrency(),
        }
    }
}

impl WorkerConfig {
    /// Create worker limits.
    pub fn new(max_file_concurrency: usize, max_chunk_concurrency: usize) -> Self {
        Self {
            max_file_concurrency,
            max_chunk_concurrency,
        }
    }

    /// Upper bound on concurrent I/O streams (files x chunk streams).
    pub fn stream_budget(&self) -> usize {
        self.max_file_concurrency
            .saturating_mul(self.max_chunk_concurrency)
    }

    /// Check if the stream budget exceeds the sizing guideline.
    pub fn exceeds_guideline(&self) -> bool {
        self.stream_budget() > STREAM_BUDGET_GUIDELINE
    }

    /// Validate both limits are non-zero.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.max_file_concurrency == 0 {
            return Err(TransferError::invalid_config(
                "max_file_concurrency must be at least 1",
            ));
        }
        if self.max_chunk_concurrency == 0 {
            return Err(TransferError::invalid_config(
                "max_chunk_concurrency must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Whether and how to use a platform bulk-copy tool.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeToolMode {
    /// Always use the built-in chunked copier.
    #[default]
    Disabled,
    /// Detect the platform tool on `PATH`.
    Auto,
    /// Use a specific executable.
    Program(PathBuf),
}

impl NativeToolMode {
    /// Check if native copies may be attempted.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// Configuration for the transfer engine.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct TransferConfig {
    /// Bytes per read/write step; also the cancellation granularity.
    #[builder(default = "default_chunk_size()")]
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Files at or above this size are split into parallel ranges.
    #[builder(default = "default_large_file_threshold()")]
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold: u64,

    /// Ranges are never smaller than this.
    #[builder(default = "default_min_range_size()")]
    #[serde(default = "default_min_range_size")]
    pub min_range_size: u64,

    /// Files smaller than this never go through the native tool.
    #[builder(default = "default_native_min_size()")]
    #[serde(default = "default_native_min_size")]
    pub native_min_size: u64,

    /// Minimum time between progress events, in milliseconds.
    #[builder(default = "default_progress_interval_ms()")]
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Also emit after this many new bytes (0 = time-based only).
    #[builder(default = "0")]
    #[serde(default)]
    pub progress_bytes_step: u64,

    /// Number of failures whose messages are kept in the summary.
    #[builder(default = "default_max_error_details()")]
    #[serde(default = "default_max_error_details")]
    pub max_error_details: usize,

    /// Try a same-filesystem rename before copy+delete on move.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub rename_on_move: bool,

    /// Create missing destination directories.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub create_parent_dirs: bool,

    /// Native bulk-copy tool usage.
    #[builder(default)]
    #[serde(default)]
    pub native_tool: NativeToolMode,

    /// Default concurrency limits (a request may override them).
    #[builder(default)]
    #[serde(default)]
    pub workers: WorkerConfig,
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    MIB as usize
}

fn default_large_file_threshold() -> u64 {
    256 * MIB
}

fn default_min_range_size() -> u64 {
    64 * MIB
}

fn default_native_min_size() -> u64 {
    64 * MIB
}

fn default_progress_interval_ms() -> u64 {
    250
}

fn default_max_error_details() -> usize {
    20
}

fn check_chunking(chunk_size: usize, threshold: u64, min_range: u64) -> Result<(), String> {
    if chunk_size < MIN_CHUNK_SIZE {
        return Err(format!("chunk_size must be at least {MIN_CHUNK_SIZE} bytes"));
    }
    if threshold < chunk_size as u64 {
        return Err("large_file_threshold cannot be smaller than chunk_size".to_string());
    }
    if min_range < chunk_size as u64 {
        return Err("min_range_size cannot be smaller than chunk_size".to_string());
    }
    Ok(())
}

impl TransferConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(workers) = &self.workers {
            workers.validate().map_err(|e| e.to_string())?;
        }
        check_chunking(
            self.chunk_size.unwrap_or_else(default_chunk_size),
            self.large_file_threshold
                .unwrap_or_else(default_large_file_threshold),
            self.min_range_size.unwrap_or_else(default_min_range_size),
        )
    }
}

impl TransferConfig {
    /// Create a new config builder.
    pub fn builder() -> TransferConfigBuilder {
        TransferConfigBuilder::default()
    }

    /// Create a config with default values.
    pub fn new() -> Self {
        Self {
            workers: WorkerConfig::default(),
            chunk_size: default_chunk_size(),
            large_file_threshold: default_large_file_threshold(),
            min_range_size: default_min_range_size(),
            native_tool: NativeToolMode::Disabled,
            native_min_size: default_native_min_size(),
            progress_interval_ms: default_progress_interval_ms(),
            progress_bytes_step: 0,
            max_error_details: default_max_error_details(),
            rename_on_move: true,
            create_parent_dirs: true,
        }
    }

    /// Validate a config that did not come through the builder.
    pub fn validate(&self) -> Result<(), TransferError> {
        self.workers.validate()?;
        check_chunking(
            self.chunk_size,
            self.large_file_threshold,
            self.min_range_size,
        )
        .map_err(TransferError::invalid_config)
    }

    /// Copy of this config with different worker limits.
    pub fn with_workers(&self, workers: WorkerConfig) -> Self {
        Self {
            workers,
            ..self.clone()
        }
    }

    /// Minimum time between progress events.
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Parse a TOML config document.
    pub fn from_toml_str(content: &str) -> Result<Self, TransferError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TransferError::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as a TOML document.
    pub fn to_toml_string(&self) -> Result<String, TransferError> {
        toml::to_string_pretty(self).map_err(|e| TransferError::invalid_config(e.to_string()))
    }

    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, TransferError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(TransferError::io(path, e)),
        }
    }

    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("plateshift").join("config.toml"))
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self::new()
    }
}
