//! Copy strategy selection.

use plateshift_core::TransferConfig;

use crate::native::NativeTool;

/// How a single file's bytes get moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyStrategy {
    /// Shell out to a platform copy tool, falling back on failure.
    Native(NativeTool),
    /// Single-stream chunked copy.
    Chunked,
    /// Parallel ranged copy with this many streams.
    Ranged { streams: usize },
}

impl CopyStrategy {
    /// Pick a strategy from the file size, configuration and tool availability.
    pub fn select(size: u64, config: &TransferConfig, native: Option<&NativeTool>) -> Self {
        match native {
            Some(tool) if config.native_tool.is_enabled() && size >= config.native_min_size => {
                Self::Native(tool.clone())
            }
            _ => Self::local(size, config),
        }
    }

    /// Strategy to use after the native tool failed.
    pub fn fallback(&self, size: u64, config: &TransferConfig) -> Self {
        match self {
            Self::Native(_) => Self::local(size, config),
            other => other.clone(),
        }
    }

    fn local(size: u64, config: &TransferConfig) -> Self {
        let max_streams = config.workers.max_chunk_concurrency;
        if max_streams > 1 && size >= config.large_file_threshold {
            let by_size = size.div_ceil(config.min_range_size.max(1));
            let streams = (max_streams as u64).min(by_size) as usize;
            if streams >= 2 {
                return Self::Ranged { streams };
            }
        }
        Self::Chunked
    }

    /// Check if this is the native tool path.
    pub fn is_native(&self) -> bool {
        matches!(self, Self::Native(_))
    }
}
