//! Error types for transfer operations.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operation::OperationId;

/// Errors that can occur while transferring files.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Generic I/O error on a specific file.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Path not found.
    #[error("Path not found: {path}")]
    NotFound { path: PathBuf },

    /// Operation stopped because its batch was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Post-copy size check did not match the source.
    #[error("Verification failed for {path}: expected {expected} bytes, found {actual}")]
    Verification {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// The native copy tool could not be started.
    #[error("Native copy tool unavailable: {tool}")]
    NativeToolUnavailable { tool: String },

    /// The native copy tool ran but reported failure.
    #[error("Native copy tool {tool} failed: {message}")]
    NativeToolFailed { tool: String, message: String },

    /// Invalid configuration.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Malformed batch request.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// A batch with this id is already live.
    #[error("Batch already exists: {batch_id}")]
    DuplicateBatch { batch_id: String },

    /// No batch with this id is known.
    #[error("Unknown batch: {batch_id}")]
    UnknownBatch { batch_id: String },

    /// A worker task panicked.
    #[error("Transfer task panicked: {message}")]
    TaskPanicked { message: String },
}

impl TransferError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Io { path, source },
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Classify this error for reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } | Self::NotFound { .. } => ErrorKind::IoFailure,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Verification { .. } => ErrorKind::VerificationFailure,
            Self::NativeToolUnavailable { .. } => ErrorKind::NativeToolUnavailable,
            Self::NativeToolFailed { .. } => ErrorKind::NativeToolFailure,
            Self::InvalidConfig { .. }
            | Self::InvalidRequest { .. }
            | Self::DuplicateBatch { .. }
            | Self::UnknownBatch { .. } => ErrorKind::InvalidConfig,
            Self::TaskPanicked { .. } => ErrorKind::Internal,
        }
    }

    /// Check if this error represents user cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Reporting category of a [`TransferError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    IoFailure,
    Cancelled,
    VerificationFailure,
    NativeToolUnavailable,
    NativeToolFailure,
    InvalidConfig,
    Internal,
}

/// Kind of transfer warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Move copied and verified the file but could not delete the source.
    SourceDeleteFailed,
    /// The native tool failed and the chunked copier took over.
    NativeToolFallback,
    /// A partial destination could not be removed.
    CleanupFailed,
}

/// Non-fatal warning attached to an operation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferWarning {
    /// Operation the warning belongs to.
    pub operation_id: OperationId,
    /// Path where the warning occurred.
    pub path: PathBuf,
    /// Human-readable message.
    pub message: String,
    /// Kind of warning.
    pub kind: WarningKind,
}

impl TransferWarning {
    /// Create a new transfer warning.
    pub fn new(
        operation_id: OperationId,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        kind: WarningKind,
    ) -> Self {
        Self {
            operation_id,
            path: path.into(),
            message: message.into(),
            kind,
        }
    }

    /// Create a source-delete warning for a move.
    pub fn source_delete_failed(
        operation_id: OperationId,
        path: impl Into<PathBuf>,
        error: &std::io::Error,
    ) -> Self {
        let path = path.into();
        Self {
            operation_id,
            message: format!("Copied, but failed to remove source {}: {error}", path.display()),
            path,
            kind: WarningKind::SourceDeleteFailed,
        }
    }

    /// Create a warning for a partial destination that could not be removed.
    pub fn cleanup_failed(
        operation_id: OperationId,
        path: impl Into<PathBuf>,
        error: &std::io::Error,
    ) -> Self {
        let path = path.into();
        Self {
            operation_id,
            message: format!("Failed to remove partial destination {}: {error}", path.display()),
            path,
            kind: WarningKind::CleanupFailed,
        }
    }

    /// Create a fallback warning after the native tool failed.
    pub fn native_fallback(
        operation_id: OperationId,
        path: impl Into<PathBuf>,
        error: &TransferError,
    ) -> Self {
        Self::new(
            operation_id,
            path,
            format!("Native copy failed, used chunked copy: {error}"),
            WarningKind::NativeToolFallback,
        )
    }
}
