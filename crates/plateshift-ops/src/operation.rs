//! Per-operation state and results.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use plateshift_core::{ErrorKind, OperationId, TransferError, TransferStatus, TransferWarning};

/// Runtime state of one operation.
///
/// Written only by the task executing the operation; other threads read it
/// through [`snapshot`](Self::snapshot).
#[derive(Debug)]
pub struct TransferState {
    bytes_copied: AtomicU64,
    total_bytes: AtomicU64,
    status: AtomicU8,
    started_at: Mutex<Option<Instant>>,
    error_message: Mutex<Option<String>>,
}

/// Point-in-time copy of a [`TransferState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferStateSnapshot {
    pub bytes_copied: u64,
    pub total_bytes: u64,
    pub status: TransferStatus,
    pub started_at: Option<Instant>,
    pub error_message: Option<String>,
}

impl TransferState {
    /// Create a queued state.
    pub fn new(total_bytes: u64) -> Self {
        Self {
            bytes_copied: AtomicU64::new(0),
            total_bytes: AtomicU64::new(total_bytes),
            status: AtomicU8::new(TransferStatus::Queued.as_u8()),
            started_at: Mutex::new(None),
            error_message: Mutex::new(None),
        }
    }

    pub(crate) fn start(&self, total_bytes: u64) {
        *self.started_at.lock() = Some(Instant::now());
        self.total_bytes.store(total_bytes, Ordering::Relaxed);
        self.set_status(TransferStatus::Copying);
    }

    pub(crate) fn set_status(&self, status: TransferStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    pub(crate) fn add_bytes(&self, bytes: u64) {
        self.bytes_copied.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn reset_bytes(&self) -> u64 {
        self.bytes_copied.swap(0, Ordering::Relaxed)
    }

    pub(crate) fn fail(&self, error: &TransferError) {
        let status = if error.is_cancelled() {
            TransferStatus::Cancelled
        } else {
            *self.error_message.lock() = Some(error.to_string());
            TransferStatus::Error
        };
        self.set_status(status);
    }

    /// Bytes copied so far.
    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied.load(Ordering::Relaxed)
    }

    /// Current status.
    pub fn status(&self) -> TransferStatus {
        TransferStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Read a consistent-enough view for progress reporting.
    pub fn snapshot(&self) -> TransferStateSnapshot {
        TransferStateSnapshot {
            bytes_copied: self.bytes_copied(),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            status: self.status(),
            started_at: *self.started_at.lock(),
            error_message: self.error_message.lock().clone(),
        }
    }
}

/// Outcome of one operation.
#[derive(Debug)]
pub struct TransferResult {
    /// Operation this result belongs to.
    pub operation_id: OperationId,
    /// Final status: `Done`, `Cancelled` or `Error`.
    pub status: TransferStatus,
    /// Bytes written to the destination.
    pub bytes: u64,
    /// Error for cancelled or failed operations.
    pub error: Option<TransferError>,
    /// Non-fatal problems, including leftovers of a failed operation.
    pub warnings: Vec<TransferWarning>,
    /// Source and destination, recorded for undo bookkeeping.
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl TransferResult {
    /// Create a successful result.
    pub fn done(
        operation_id: OperationId,
        bytes: u64,
        source: PathBuf,
        destination: PathBuf,
        warnings: Vec<TransferWarning>,
    ) -> Self {
        Self {
            operation_id,
            status: TransferStatus::Done,
            bytes,
            error: None,
            warnings,
            source,
            destination,
        }
    }

    /// Attach warnings to a result.
    pub fn with_warnings(mut self, warnings: Vec<TransferWarning>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    /// Create a failed or cancelled result.
    pub fn from_error(
        operation_id: OperationId,
        error: TransferError,
        source: PathBuf,
        destination: PathBuf,
    ) -> Self {
        let status = if error.is_cancelled() {
            TransferStatus::Cancelled
        } else {
            TransferStatus::Error
        };
        Self {
            operation_id,
            status,
            bytes: 0,
            error: Some(error),
            warnings: Vec::new(),
            source,
            destination,
        }
    }

    /// Check if the operation succeeded (possibly with warnings).
    pub fn is_success(&self) -> bool {
        self.status == TransferStatus::Done
    }

    /// Check if the operation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.status == TransferStatus::Cancelled
    }

    /// Reporting category of the error, if any.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(TransferError::kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_lifecycle() {
        let state = TransferState::new(100);
        assert_eq!(state.status(), TransferStatus::Queued);

        state.start(120);
        state.add_bytes(60);
        let snap = state.snapshot();
        assert_eq!(snap.status, TransferStatus::Copying);
        assert_eq!(snap.bytes_copied, 60);
        assert_eq!(snap.total_bytes, 120);
        assert!(snap.started_at.is_some());

        state.fail(&TransferError::Cancelled);
        assert_eq!(state.status(), TransferStatus::Cancelled);
        assert!(state.snapshot().error_message.is_none());
    }

    #[test]
    fn test_state_error_message() {
        let state = TransferState::new(10);
        state.fail(&TransferError::NotFound {
            path: "/gone".into(),
        });
        let snap = state.snapshot();
        assert_eq!(snap.status, TransferStatus::Error);
        assert!(snap.error_message.unwrap().contains("/gone"));
    }

    #[test]
    fn test_result_constructors() {
        let ok = TransferResult::done(OperationId(1), 5, "/a".into(), "/b".into(), vec![]);
        assert!(ok.is_success());
        assert!(ok.error_kind().is_none());

        let cancelled = TransferResult::from_error(
            OperationId(2),
            TransferError::Cancelled,
            "/a".into(),
            "/b".into(),
        );
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.error_kind(), Some(ErrorKind::Cancelled));
    }
}
