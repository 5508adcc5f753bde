//! Execution of a single transfer operation.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use plateshift_core::{
    BatchId, BatchStatus, Operation, OperationId, TransferConfig, TransferError, TransferMode,
    TransferStatus, TransferWarning,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunked::{ChunkedCopier, discard_partial, remove_partial};
use crate::move_op::{remove_source, same_file, try_rename};
use crate::native::NativeTool;
use crate::operation::{TransferResult, TransferState, TransferStateSnapshot};
use crate::progress::{BatchTracker, TransferEvent};
use crate::sink::{NullSink, ProgressSink};
use crate::strategy::CopyStrategy;

/// Everything the tasks of one batch share.
pub struct TaskContext {
    pub(crate) batch_id: BatchId,
    pub(crate) mode: TransferMode,
    pub(crate) config: Arc<TransferConfig>,
    pub(crate) native: Option<NativeTool>,
    pub(crate) sink: Arc<dyn ProgressSink>,
    pub(crate) tracker: Arc<BatchTracker>,
    pub(crate) status: Arc<RwLock<BatchStatus>>,
    operations: DashMap<OperationId, Arc<TransferState>>,
}

impl TaskContext {
    /// Create a context with no native tool and a discarding sink.
    pub fn new(
        batch_id: BatchId,
        mode: TransferMode,
        config: Arc<TransferConfig>,
        tracker: Arc<BatchTracker>,
    ) -> Self {
        Self {
            batch_id,
            mode,
            config,
            native: None,
            sink: Arc::new(NullSink),
            tracker,
            status: Arc::new(RwLock::new(BatchStatus::Running)),
            operations: DashMap::new(),
        }
    }

    /// Send progress events to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Use `native` for files the strategy routes to it.
    pub fn with_native_tool(mut self, native: Option<NativeTool>) -> Self {
        self.native = native;
        self
    }

    /// Share the batch status cell reported in progress events.
    pub fn with_status(mut self, status: Arc<RwLock<BatchStatus>>) -> Self {
        self.status = status;
        self
    }

    /// Batch progress counters.
    pub fn tracker(&self) -> &Arc<BatchTracker> {
        &self.tracker
    }

    /// State of an operation whose task has been created.
    pub fn operation_state(&self, id: OperationId) -> Option<TransferStateSnapshot> {
        self.operations.get(&id).map(|state| state.snapshot())
    }

    fn record_progress(&self, bytes: u64) {
        self.tracker.add_bytes(bytes);
        self.emit_progress();
    }

    /// Send a progress event if the rate limit allows one.
    pub(crate) fn emit_progress(&self) {
        if self.tracker.should_emit() {
            let status = *self.status.read();
            self.sink.send(TransferEvent::Progress(
                self.tracker.snapshot(&self.batch_id, status),
            ));
        }
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("batch_id", &self.batch_id)
            .field("mode", &self.mode)
            .field("native", &self.native)
            .finish_non_exhaustive()
    }
}

/// Bytes and warnings of a finished operation.
struct Transferred {
    bytes: u64,
    warnings: Vec<TransferWarning>,
}

/// One operation bound to its batch context.
#[derive(Debug)]
pub struct TransferTask {
    operation: Operation,
    state: Arc<TransferState>,
    ctx: Arc<TaskContext>,
    writing: AtomicBool,
}

impl TransferTask {
    /// Create a queued task and register its state with the context.
    pub fn new(operation: Operation, ctx: Arc<TaskContext>) -> Self {
        let state = Arc::new(TransferState::new(operation.size_bytes));
        ctx.operations.insert(operation.id, Arc::clone(&state));
        Self {
            operation,
            state,
            ctx,
            writing: AtomicBool::new(false),
        }
    }

    /// The operation this task executes.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Live state of the operation.
    pub fn state(&self) -> Arc<TransferState> {
        Arc::clone(&self.state)
    }

    /// Run the operation to completion, cancellation or failure.
    ///
    /// Never panics on I/O problems; every outcome is a [`TransferResult`].
    /// A task whose signal is already set returns `Cancelled` without
    /// touching the filesystem. A failure after the destination was
    /// written removes it, or warns when it cannot.
    pub async fn execute(self, cancel: CancellationToken) -> TransferResult {
        if cancel.is_cancelled() {
            return self.finish(Err(TransferError::Cancelled), None);
        }

        let outcome = {
            let _in_flight = InFlight::enter(&self.ctx.tracker, &self.operation.source);
            self.run(&cancel).await
        };

        let leftover = if outcome.is_err() && self.writing.load(Ordering::Acquire) {
            let (id, destination) = (self.operation.id, self.operation.destination.clone());
            blocking(move || Ok(cleanup_destination(id, &destination)))
                .await
                .unwrap_or_default()
        } else {
            None
        };
        self.finish(outcome, leftover)
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<Transferred, TransferError> {
        let op = &self.operation;
        let config = Arc::clone(&self.ctx.config);
        let mode = self.ctx.mode;

        let prepared = {
            let op = op.clone();
            let config = Arc::clone(&config);
            blocking(move || prepare(&op, mode, &config)).await?
        };
        let len = prepared.len;
        self.ctx.tracker.adjust_total(op.size_bytes, len);
        self.state.start(len);

        if prepared.renamed {
            self.state.add_bytes(len);
            self.ctx.record_progress(len);
            return Ok(Transferred {
                bytes: len,
                warnings: Vec::new(),
            });
        }

        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        self.writing.store(true, Ordering::Release);

        let mut warnings = Vec::new();
        let mut strategy = CopyStrategy::select(len, &config, self.ctx.native.as_ref());
        let mut copied = None;

        let native = match &strategy {
            CopyStrategy::Native(tool) => Some(tool.clone()),
            _ => None,
        };
        if let Some(tool) = native {
            match tool.try_copy(&op.source, &op.destination, cancel).await {
                Ok(()) => {
                    self.state.add_bytes(len);
                    self.ctx.record_progress(len);
                    copied = Some(len);
                }
                Err(TransferError::Cancelled) => return Err(TransferError::Cancelled),
                Err(e) => {
                    warn!("{}: {}, falling back to chunked copy", op.source.display(), e);
                    warnings.push(TransferWarning::native_fallback(op.id, &op.source, &e));
                    strategy = strategy.fallback(len, &config);
                }
            }
        }

        let bytes = match copied {
            Some(bytes) => bytes,
            None => self.copy_local(strategy, cancel).await?,
        };

        self.state.set_status(TransferStatus::Verifying);
        {
            let destination = op.destination.clone();
            blocking(move || verify(&destination, len, bytes)).await?;
        }

        if mode == TransferMode::Move {
            let (id, source) = (op.id, op.source.clone());
            if let Some(warning) = blocking(move || Ok(remove_source(id, &source))).await? {
                warnings.push(warning);
            }
        }

        Ok(Transferred { bytes, warnings })
    }

    async fn copy_local(
        &self,
        strategy: CopyStrategy,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        let copier = ChunkedCopier::new(self.ctx.config.chunk_size);
        let source = self.operation.source.clone();
        let destination = self.operation.destination.clone();
        let cancel = cancel.clone();
        let state = Arc::clone(&self.state);
        let ctx = Arc::clone(&self.ctx);

        debug!("{:?} {}", strategy, source.display());

        blocking(move || {
            let on_progress = |bytes: u64| {
                state.add_bytes(bytes);
                ctx.record_progress(bytes);
            };
            match strategy {
                CopyStrategy::Ranged { streams } => {
                    copier.copy_ranged(&source, &destination, streams, &cancel, on_progress)
                }
                _ => copier.copy(&source, &destination, &cancel, on_progress),
            }
        })
        .await
    }

    fn finish(
        &self,
        outcome: Result<Transferred, TransferError>,
        leftover: Option<TransferWarning>,
    ) -> TransferResult {
        let op = &self.operation;
        let result = match outcome {
            Ok(done) => {
                self.state.set_status(TransferStatus::Done);
                debug!("{} done: {} bytes", op.id, done.bytes);
                TransferResult::done(
                    op.id,
                    done.bytes,
                    op.source.clone(),
                    op.destination.clone(),
                    done.warnings,
                )
            }
            Err(error) => {
                self.ctx.tracker.remove_bytes(self.state.reset_bytes());
                self.state.fail(&error);
                if error.is_cancelled() {
                    debug!("{} cancelled", op.id);
                } else {
                    warn!("{} failed: {}", op.id, error);
                }
                TransferResult::from_error(op.id, error, op.source.clone(), op.destination.clone())
                    .with_warnings(leftover.into_iter().collect())
            }
        };

        self.ctx.tracker.record_outcome(&result);
        self.ctx.emit_progress();
        result
    }
}

/// Keeps the tracker's in-flight count while alive.
struct InFlight<'a>(&'a BatchTracker);

impl<'a> InFlight<'a> {
    fn enter(tracker: &'a BatchTracker, path: &Path) -> Self {
        tracker.task_started(path);
        Self(tracker)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.task_finished();
    }
}

struct Prepared {
    len: u64,
    renamed: bool,
}

fn prepare(
    op: &Operation,
    mode: TransferMode,
    config: &TransferConfig,
) -> Result<Prepared, TransferError> {
    let metadata = fs::metadata(&op.source).map_err(|e| TransferError::io(&op.source, e))?;
    if !metadata.is_file() {
        return Err(TransferError::io(
            &op.source,
            io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
        ));
    }
    if same_file(&op.source, &op.destination) {
        return Err(TransferError::io(
            &op.destination,
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "source and destination are the same file",
            ),
        ));
    }

    if config.create_parent_dirs {
        if let Some(parent) = op.destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| TransferError::io(parent, e))?;
        }
    }

    let renamed =
        mode == TransferMode::Move && config.rename_on_move && try_rename(&op.source, &op.destination);

    Ok(Prepared {
        len: metadata.len(),
        renamed,
    })
}

/// Check the destination against the size read from the source.
fn verify(destination: &Path, expected: u64, written: u64) -> Result<(), TransferError> {
    let actual = fs::metadata(destination)
        .map_err(|e| TransferError::io(destination, e))?
        .len();
    if actual == expected && written == expected {
        return Ok(());
    }

    discard_partial(destination);
    Err(TransferError::Verification {
        path: destination.to_path_buf(),
        expected,
        actual: if actual != expected { actual } else { written },
    })
}

/// Remove what a failed operation left at `destination`.
fn cleanup_destination(operation_id: OperationId, destination: &Path) -> Option<TransferWarning> {
    match remove_partial(destination) {
        Ok(()) => None,
        Err(e) => {
            warn!("{} left behind at {}: {}", operation_id, destination.display(), e);
            Some(TransferWarning::cleanup_failed(operation_id, destination, &e))
        }
    }
}

/// Run blocking filesystem work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, TransferError>
where
    F: FnOnce() -> Result<T, TransferError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TransferError::TaskPanicked {
            message: e.to_string(),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::EmitGate;
    use plateshift_core::{NativeToolMode, WarningKind};
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    fn context(mode: TransferMode, config: TransferConfig) -> Arc<TaskContext> {
        let tracker = Arc::new(BatchTracker::new(1, 0, EmitGate::new(Duration::ZERO, 0)));
        Arc::new(TaskContext::new(
            BatchId::new("task-test"),
            mode,
            Arc::new(config),
            tracker,
        ))
    }

    fn small_chunks() -> TransferConfig {
        TransferConfig::builder()
            .chunk_size(4096usize)
            .build()
            .unwrap()
    }

    fn source(dir: &TempDir, len: usize) -> PathBuf {
        let path = dir.path().join("in").join("plate.0001.exr");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, vec![3u8; len]).unwrap();
        path
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_copy_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir, 20_000);
        let dst = dir.path().join("out/shot/plate.0001.exr");

        let ctx = context(TransferMode::Copy, small_chunks());
        let task = TransferTask::new(Operation::file(0, &src, &dst, 0), ctx.clone());
        let state = task.state();
        let result = task.execute(CancellationToken::new()).await;

        assert!(result.is_success());
        assert_eq!(result.bytes, 20_000);
        assert_eq!(fs::read(&dst).unwrap().len(), 20_000);
        assert!(src.exists());
        assert_eq!(state.status(), TransferStatus::Done);
        assert_eq!(ctx.tracker().bytes_done(), 20_000);
        assert_eq!(ctx.tracker().files_processed(), 1);
        assert_eq!(ctx.tracker().in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_precancelled_task_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir, 100);
        let dst = dir.path().join("out/plate.0001.exr");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = context(TransferMode::Move, small_chunks());
        let result = TransferTask::new(Operation::file(1, &src, &dst, 100), ctx.clone())
            .execute(cancel)
            .await;

        assert!(result.is_cancelled());
        assert!(src.exists());
        assert!(!dst.parent().unwrap().exists());
        assert_eq!(ctx.tracker().peak_in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_move_by_rename() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir, 5_000);
        let dst = dir.path().join("out/plate.0001.exr");

        let result = TransferTask::new(
            Operation::file(2, &src, &dst, 0),
            context(TransferMode::Move, small_chunks()),
        )
        .execute(CancellationToken::new())
        .await;

        assert!(result.is_success());
        assert_eq!(result.bytes, 5_000);
        assert!(!src.exists());
        assert!(dst.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_move_by_copy_and_delete() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir, 9_000);
        let dst = dir.path().join("out/plate.0001.exr");

        let mut config = small_chunks();
        config.rename_on_move = false;
        let result = TransferTask::new(
            Operation::file(3, &src, &dst, 0),
            context(TransferMode::Move, config),
        )
        .execute(CancellationToken::new())
        .await;

        assert!(result.is_success());
        assert!(result.warnings.is_empty());
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap().len(), 9_000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_source_fails() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("missing.exr");
        let dst = dir.path().join("out/missing.exr");

        let ctx = context(TransferMode::Copy, small_chunks());
        let result = TransferTask::new(Operation::file(4, &src, &dst, 10), ctx.clone())
            .execute(CancellationToken::new())
            .await;

        assert!(!result.is_success());
        assert!(!result.is_cancelled());
        assert_eq!(result.error_kind(), Some(plateshift_core::ErrorKind::IoFailure));
        assert!(!dst.exists());
        assert_eq!(ctx.tracker().bytes_done(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_copy_onto_itself_is_rejected() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir, 1_000);

        let result = TransferTask::new(
            Operation::file(5, &src, &src, 0),
            context(TransferMode::Copy, small_chunks()),
        )
        .execute(CancellationToken::new())
        .await;

        assert!(!result.is_success());
        assert_eq!(fs::read(&src).unwrap().len(), 1_000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_native_failure_falls_back() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir, 12_000);
        let dst = dir.path().join("out/plate.0001.exr");

        let mut config = small_chunks();
        config.native_tool = NativeToolMode::Auto;
        config.native_min_size = 0;
        let tracker = Arc::new(BatchTracker::new(1, 0, EmitGate::new(Duration::ZERO, 0)));
        let ctx = TaskContext::new(BatchId::new("native"), TransferMode::Copy, Arc::new(config), tracker)
            .with_native_tool(Some(NativeTool::new(dir.path().join("no-such-copy-tool"))));

        let result = TransferTask::new(Operation::file(6, &src, &dst, 0), Arc::new(ctx))
            .execute(CancellationToken::new())
            .await;

        assert!(result.is_success());
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].kind, WarningKind::NativeToolFallback);
        assert_eq!(fs::read(&dst).unwrap().len(), 12_000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_hard_linked_destination_is_rejected() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir, 50_000);
        let link = dir.path().join("in/plate.linked.exr");
        fs::hard_link(&src, &link).unwrap();

        for (id, mode) in [(7, TransferMode::Copy), (8, TransferMode::Move)] {
            let result = TransferTask::new(
                Operation::file(id, &src, &link, 0),
                context(mode, small_chunks()),
            )
            .execute(CancellationToken::new())
            .await;

            assert!(!result.is_success(), "{mode} onto a hard link succeeded");
            assert_eq!(result.error_kind(), Some(plateshift_core::ErrorKind::IoFailure));
            assert_eq!(fs::metadata(&src).unwrap().len(), 50_000);
            assert_eq!(fs::metadata(&link).unwrap().len(), 50_000);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_operation_state_is_visible_through_context() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir, 6_000);
        let dst = dir.path().join("out/plate.0001.exr");

        let ctx = context(TransferMode::Copy, small_chunks());
        let task = TransferTask::new(Operation::file(9, &src, &dst, 0), ctx.clone());
        assert_eq!(
            ctx.operation_state(OperationId(9)).unwrap().status,
            TransferStatus::Queued
        );
        assert!(ctx.operation_state(OperationId(10)).is_none());

        task.execute(CancellationToken::new()).await;
        let state = ctx.operation_state(OperationId(9)).unwrap();
        assert_eq!(state.status, TransferStatus::Done);
        assert_eq!(state.bytes_copied, 6_000);
        assert_eq!(state.total_bytes, 6_000);
    }

    #[cfg(unix)]
    fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_unremovable_leftover_is_reported() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir, 12_000);
        let dst = dir.path().join("out/plate.0001.exr");
        // Leaves a directory where the file should go, which the
        // fallback copy cannot open and cleanup cannot remove.
        let tool = script(&dir, "dir-cp", r#"mkdir -p "$3/junk"; exit 1"#);

        let mut config = small_chunks();
        config.native_tool = NativeToolMode::Auto;
        config.native_min_size = 0;
        let tracker = Arc::new(BatchTracker::new(1, 0, EmitGate::new(Duration::ZERO, 0)));
        let ctx = TaskContext::new(BatchId::new("leftover"), TransferMode::Copy, Arc::new(config), tracker)
            .with_native_tool(Some(NativeTool::new(tool)));

        let result = TransferTask::new(Operation::file(11, &src, &dst, 0), Arc::new(ctx))
            .execute(CancellationToken::new())
            .await;

        assert!(!result.is_success());
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].kind, WarningKind::CleanupFailed);
        assert_eq!(result.warnings[0].path, dst);
        assert!(src.exists());
    }

    /// Replaces the source path with a directory once its copy has started.
    #[cfg(unix)]
    struct SwapSource {
        source: PathBuf,
        swapped: AtomicBool,
    }

    #[cfg(unix)]
    impl ProgressSink for SwapSource {
        fn send(&self, _event: TransferEvent) {
            if !self.swapped.swap(true, Ordering::SeqCst) {
                fs::rename(&self.source, self.source.with_extension("held")).unwrap();
                fs::create_dir(&self.source).unwrap();
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_move_keeps_success_when_source_delete_fails() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir, 20_000);
        let dst = dir.path().join("out/plate.0001.exr");

        let mut config = small_chunks();
        config.rename_on_move = false;
        let tracker = Arc::new(BatchTracker::new(1, 0, EmitGate::new(Duration::ZERO, 0)));
        let ctx = TaskContext::new(BatchId::new("stuck"), TransferMode::Move, Arc::new(config), tracker)
            .with_sink(Arc::new(SwapSource {
                source: src.clone(),
                swapped: AtomicBool::new(false),
            }));

        let result = TransferTask::new(Operation::file(12, &src, &dst, 0), Arc::new(ctx))
            .execute(CancellationToken::new())
            .await;

        assert!(result.is_success());
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].kind, WarningKind::SourceDeleteFailed);
        assert_eq!(fs::read(&dst).unwrap().len(), 20_000);
        assert!(src.is_dir());
    }

    #[test]
    fn test_verify_mismatch_removes_destination() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("short.exr");
        fs::write(&dst, vec![0u8; 10]).unwrap();

        let err = verify(&dst, 20, 10).unwrap_err();
        assert!(matches!(
            err,
            TransferError::Verification {
                expected: 20,
                actual: 10,
                ..
            }
        ));
        assert!(!dst.exists());
        assert!(verify(&dir.path().join("gone.exr"), 0, 0).is_err());
    }
}
