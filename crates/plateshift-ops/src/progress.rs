//! Progress reporting types for transfer batches.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use plateshift_core::{BatchId, BatchStatus, ErrorKind, OperationId, TransferMode, TransferWarning};
use serde::{Deserialize, Serialize};

use crate::operation::TransferResult;

/// Progress information for a batch, in the shape the UI consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub batch_id: BatchId,
    /// Operations finished, whatever their outcome.
    pub files_processed: usize,
    pub total_files: usize,
    pub bytes_processed: u64,
    pub total_bytes: u64,
    /// 0.0 to 100.0.
    pub percentage: f64,
    pub current_file: Option<PathBuf>,
    pub status: BatchStatus,
    pub eta_seconds: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Event pushed to a progress sink.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Rate-limited progress update.
    Progress(ProgressSnapshot),
    /// The batch reached a terminal state.
    Finished(BatchSummary),
}

/// Shared, lock-free progress counters for one batch.
#[derive(Debug)]
pub struct BatchTracker {
    total_files: usize,
    total_bytes: AtomicU64,
    bytes_done: AtomicU64,
    files_succeeded: AtomicUsize,
    files_failed: AtomicUsize,
    files_cancelled: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    current_file: RwLock<Option<PathBuf>>,
    started: Instant,
    gate: EmitGate,
}

impl BatchTracker {
    /// Create a tracker for a batch.
    pub fn new(total_files: usize, total_bytes: u64, gate: EmitGate) -> Self {
        Self {
            total_files,
            total_bytes: AtomicU64::new(total_bytes),
            bytes_done: AtomicU64::new(0),
            files_succeeded: AtomicUsize::new(0),
            files_failed: AtomicUsize::new(0),
            files_cancelled: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            current_file: RwLock::new(None),
            started: Instant::now(),
            gate,
        }
    }

    /// Record bytes written.
    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_done.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Take back bytes of an operation that did not complete.
    pub fn remove_bytes(&self, bytes: u64) {
        // Saturating: never underflow if callers disagree on totals.
        let _ = self
            .bytes_done
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |done| {
                Some(done.saturating_sub(bytes))
            });
    }

    /// Replace a planned operation size with the size found on disk.
    pub fn adjust_total(&self, planned: u64, actual: u64) {
        if planned == actual {
            return;
        }
        let _ = self
            .total_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
                Some(total.saturating_sub(planned).saturating_add(actual))
            });
    }

    /// Mark a task as started and holding file handles.
    pub fn task_started(&self, path: &Path) {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
        *self.current_file.write() = Some(path.to_path_buf());
    }

    /// Mark a task as no longer holding file handles.
    pub fn task_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Count a finished operation.
    pub fn record_outcome(&self, result: &TransferResult) {
        let counter = if result.is_success() {
            &self.files_succeeded
        } else if result.is_cancelled() {
            &self.files_cancelled
        } else {
            &self.files_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Tasks currently holding file handles.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of simultaneous tasks observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Acquire)
    }

    /// Bytes written so far.
    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::Relaxed)
    }

    /// Operations finished so far.
    pub fn files_processed(&self) -> usize {
        self.files_succeeded.load(Ordering::Relaxed)
            + self.files_failed.load(Ordering::Relaxed)
            + self.files_cancelled.load(Ordering::Relaxed)
    }

    /// Check if a progress event is due, claiming the slot if so.
    pub fn should_emit(&self) -> bool {
        self.gate.try_claim(self.bytes_done())
    }

    /// Time since the batch started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Build a snapshot for `batch_id` in `status`.
    pub fn snapshot(&self, batch_id: &BatchId, status: BatchStatus) -> ProgressSnapshot {
        let bytes_processed = self.bytes_done();
        let total_bytes = self.total_bytes.load(Ordering::Relaxed);
        let files_processed = self.files_processed();

        let percentage = if total_bytes > 0 {
            (bytes_processed as f64 / total_bytes as f64 * 100.0).min(100.0)
        } else if self.total_files > 0 {
            files_processed as f64 / self.total_files as f64 * 100.0
        } else {
            100.0
        };

        let eta_seconds = if status.is_terminal() {
            None
        } else {
            estimate_eta(bytes_processed, total_bytes, self.elapsed())
        };

        ProgressSnapshot {
            batch_id: batch_id.clone(),
            files_processed,
            total_files: self.total_files,
            bytes_processed,
            total_bytes,
            percentage,
            current_file: self.current_file.read().clone(),
            status,
            eta_seconds,
            timestamp: Utc::now(),
        }
    }
}

/// Estimate remaining seconds from the average throughput so far.
pub fn estimate_eta(done: u64, total: u64, elapsed: Duration) -> Option<u64> {
    let secs = elapsed.as_secs_f64();
    if done == 0 || secs <= 0.0 || total <= done {
        return None;
    }
    let rate = done as f64 / secs;
    Some(((total - done) as f64 / rate).ceil() as u64)
}

const NEVER: u64 = u64::MAX;

/// Rate limit for progress events shared by all tasks of a batch.
///
/// At most one caller wins each interval; a byte step, when set, also opens
/// the gate once that many new bytes were written since the last emission.
#[derive(Debug)]
pub struct EmitGate {
    interval_ms: u64,
    byte_step: u64,
    origin: Instant,
    last_ms: AtomicU64,
    last_bytes: AtomicU64,
}

impl EmitGate {
    /// Create a gate.
    pub fn new(interval: Duration, byte_step: u64) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            byte_step,
            origin: Instant::now(),
            last_ms: AtomicU64::new(NEVER),
            last_bytes: AtomicU64::new(0),
        }
    }

    /// Claim the right to emit if an event is due.
    pub fn try_claim(&self, bytes_done: u64) -> bool {
        let now = self.origin.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Acquire);

        let time_due = last == NEVER || now.saturating_sub(last) >= self.interval_ms;
        let bytes_due = self.byte_step > 0
            && bytes_done.saturating_sub(self.last_bytes.load(Ordering::Relaxed)) >= self.byte_step;
        if !time_due && !bytes_due {
            return false;
        }

        if self
            .last_ms
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.last_bytes.store(bytes_done, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

/// A failed operation in a batch summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedOperation {
    pub operation_id: OperationId,
    pub kind: ErrorKind,
    /// Error message, kept for the first failures only.
    pub error: Option<String>,
}

/// Terminal result of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: BatchId,
    pub mode: TransferMode,
    pub status: BatchStatus,
    pub succeeded: Vec<OperationId>,
    pub failed: Vec<FailedOperation>,
    pub cancelled_count: usize,
    pub bytes_transferred: u64,
    pub warnings: Vec<TransferWarning>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchSummary {
    /// Aggregate task results into a summary.
    ///
    /// The status is `Cancelled` when any operation was cancelled, `Failed`
    /// when nothing succeeded and something failed, otherwise `Completed`.
    pub fn from_results(
        batch_id: BatchId,
        mode: TransferMode,
        results: &[TransferResult],
        max_error_details: usize,
        started_at: DateTime<Utc>,
    ) -> Self {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut cancelled_count = 0;
        let mut bytes_transferred = 0;
        let mut warnings = Vec::new();

        for result in results {
            warnings.extend(result.warnings.iter().cloned());
            if result.is_success() {
                succeeded.push(result.operation_id);
                bytes_transferred += result.bytes;
            } else if result.is_cancelled() {
                cancelled_count += 1;
            } else {
                let detail = failed.len() < max_error_details;
                failed.push(FailedOperation {
                    operation_id: result.operation_id,
                    kind: result.error_kind().unwrap_or(ErrorKind::Internal),
                    error: result
                        .error
                        .as_ref()
                        .filter(|_| detail)
                        .map(ToString::to_string),
                });
            }
        }

        let status = if cancelled_count > 0 {
            BatchStatus::Cancelled
        } else if succeeded.is_empty() && !failed.is_empty() {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };

        Self {
            batch_id,
            mode,
            status,
            succeeded,
            failed,
            cancelled_count,
            bytes_transferred,
            warnings,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Check if every operation succeeded.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.cancelled_count == 0
    }

    /// Total operations covered by this summary.
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.cancelled_count
    }

    /// Human-readable one-line summary.
    pub fn summary_line(&self) -> String {
        format!(
            "{} succeeded, {} failed, {} cancelled",
            self.succeeded.len(),
            self.failed.len(),
            self.cancelled_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plateshift_core::TransferError;

    fn ok(id: u64, bytes: u64) -> TransferResult {
        TransferResult::done(OperationId(id), bytes, "/s".into(), "/d".into(), vec![])
    }

    fn err(id: u64, error: TransferError) -> TransferResult {
        TransferResult::from_error(OperationId(id), error, "/s".into(), "/d".into())
    }

    #[test]
    fn test_gate_time_interval() {
        let gate = EmitGate::new(Duration::from_secs(3600), 0);
        assert!(gate.try_claim(0));
        assert!(!gate.try_claim(1_000_000));
    }

    #[test]
    fn test_gate_byte_step() {
        let gate = EmitGate::new(Duration::from_secs(3600), 100);
        assert!(gate.try_claim(0));
        assert!(!gate.try_claim(50));
        assert!(gate.try_claim(150));
        assert!(!gate.try_claim(200));
    }

    #[test]
    fn test_gate_zero_interval_always_open() {
        let gate = EmitGate::new(Duration::ZERO, 0);
        assert!(gate.try_claim(0));
        assert!(gate.try_claim(0));
    }

    #[test]
    fn test_tracker_counts_and_peak() {
        let tracker = BatchTracker::new(3, 300, EmitGate::new(Duration::ZERO, 0));
        tracker.task_started(Path::new("/a"));
        tracker.task_started(Path::new("/b"));
        assert_eq!(tracker.in_flight(), 2);

        tracker.add_bytes(100);
        tracker.task_finished();
        tracker.record_outcome(&ok(0, 100));
        tracker.add_bytes(40);
        tracker.remove_bytes(40);
        tracker.task_finished();
        tracker.record_outcome(&err(1, TransferError::Cancelled));
        tracker.record_outcome(&err(2, TransferError::Cancelled));

        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.peak_in_flight(), 2);
        assert_eq!(tracker.files_processed(), 3);

        let snap = tracker.snapshot(&BatchId::new("b"), BatchStatus::Running);
        assert_eq!(snap.bytes_processed, 100);
        assert!((snap.percentage - 100.0 / 3.0).abs() < 0.01);
        assert_eq!(snap.current_file, Some(PathBuf::from("/b")));
    }

    #[test]
    fn test_adjust_total() {
        let tracker = BatchTracker::new(2, 100, EmitGate::new(Duration::ZERO, 0));
        tracker.adjust_total(0, 250);
        tracker.adjust_total(100, 100);
        let snap = tracker.snapshot(&BatchId::new("b"), BatchStatus::Running);
        assert_eq!(snap.total_bytes, 350);
    }

    #[test]
    fn test_eta() {
        assert_eq!(estimate_eta(50, 100, Duration::from_secs(10)), Some(10));
        assert_eq!(estimate_eta(0, 100, Duration::from_secs(10)), None);
        assert_eq!(estimate_eta(100, 100, Duration::from_secs(10)), None);
    }

    #[test]
    fn test_summary_statuses() {
        let started = Utc::now();
        let id = BatchId::new("b");

        let summary = BatchSummary::from_results(
            id.clone(),
            TransferMode::Copy,
            &[ok(0, 10), err(1, TransferError::NotFound { path: "/x".into() })],
            20,
            started,
        );
        assert_eq!(summary.status, BatchStatus::Completed);
        assert_eq!(summary.summary_line(), "1 succeeded, 1 failed, 0 cancelled");
        assert_eq!(summary.failed[0].kind, ErrorKind::IoFailure);

        let summary = BatchSummary::from_results(
            id.clone(),
            TransferMode::Copy,
            &[err(0, TransferError::NotFound { path: "/x".into() })],
            20,
            started,
        );
        assert_eq!(summary.status, BatchStatus::Failed);

        let summary = BatchSummary::from_results(
            id,
            TransferMode::Move,
            &[ok(0, 10), err(1, TransferError::Cancelled)],
            20,
            started,
        );
        assert_eq!(summary.status, BatchStatus::Cancelled);
        assert_eq!(summary.cancelled_count, 1);
        assert_eq!(summary.total(), 2);
    }

    #[test]
    fn test_summary_keeps_warnings_of_failures() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let failed = err(0, TransferError::NotFound { path: "/x".into() }).with_warnings(vec![
            TransferWarning::cleanup_failed(OperationId(0), "/d", &io),
        ]);
        let summary = BatchSummary::from_results(
            BatchId::new("b"),
            TransferMode::Copy,
            &[failed, ok(1, 4)],
            20,
            Utc::now(),
        );
        assert_eq!(summary.warnings.len(), 1);
        assert_eq!(summary.warnings[0].kind, plateshift_core::WarningKind::CleanupFailed);
    }

    #[test]
    fn test_summary_limits_error_details() {
        let results: Vec<_> = (0..5)
            .map(|i| err(i, TransferError::NotFound { path: "/x".into() }))
            .collect();
        let summary = BatchSummary::from_results(
            BatchId::new("b"),
            TransferMode::Copy,
            &results,
            2,
            Utc::now(),
        );
        assert_eq!(summary.failed.len(), 5);
        assert_eq!(summary.failed.iter().filter(|f| f.error.is_some()).count(), 2);
    }
}
