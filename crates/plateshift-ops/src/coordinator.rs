//! Batch lifecycle: start, cancel, status queries and finalization.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use plateshift_core::{
    Batch, BatchId, BatchRequest, BatchStatus, Operation, OperationId, TransferConfig,
    TransferError, TransferMode, WorkerConfig,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancel::CancellationRegistry;
use crate::native::NativeTool;
use crate::operation::TransferStateSnapshot;
use crate::pool::WorkerPool;
use crate::progress::{BatchSummary, BatchTracker, EmitGate, ProgressSnapshot, TransferEvent};
use crate::sink::{NullSink, ProgressSink};
use crate::task::TaskContext;
use crate::undo::{UndoEntry, UndoLog, UndoReport, UndoableOperation};

/// Shared view of one live or finished batch.
struct BatchHandle {
    mode: TransferMode,
    status: Arc<RwLock<BatchStatus>>,
    tracker: Arc<BatchTracker>,
    ctx: Arc<TaskContext>,
    final_snapshot: OnceLock<ProgressSnapshot>,
    done: watch::Sender<Option<BatchSummary>>,
}

/// Owns every batch's lifecycle.
///
/// `start` returns as soon as the batch is registered; the work runs on a
/// spawned driver task. Status queries never block on the work and may be
/// issued from any thread. Cloning is cheap and clones share all batches.
#[derive(Clone)]
pub struct BatchCoordinator {
    config: Arc<TransferConfig>,
    registry: Arc<CancellationRegistry>,
    sink: Arc<dyn ProgressSink>,
    native: Option<NativeTool>,
    batches: Arc<DashMap<BatchId, Arc<BatchHandle>>>,
    undo: Arc<Mutex<UndoLog>>,
}

impl BatchCoordinator {
    /// Create a coordinator.
    ///
    /// The native tool is resolved from the configured mode.
    pub fn new(config: TransferConfig) -> Result<Self, TransferError> {
        config.validate()?;
        let native = NativeTool::from_mode(&config.native_tool);
        if config.native_tool.is_enabled() && native.is_none() {
            warn!("native copy tool requested but none found, using chunked copy");
        }
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(CancellationRegistry::new()),
            sink: Arc::new(NullSink),
            native,
            batches: Arc::new(DashMap::new()),
            undo: Arc::new(Mutex::new(UndoLog::default())),
        })
    }

    /// Share a cancellation registry with other components.
    pub fn with_registry(mut self, registry: Arc<CancellationRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Send progress events to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Override the native tool resolved from the configuration.
    pub fn with_native_tool(mut self, native: Option<NativeTool>) -> Self {
        self.native = native;
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// The registry holding every batch's cancellation signal.
    pub fn registry(&self) -> &Arc<CancellationRegistry> {
        &self.registry
    }

    /// Start `batch` with the configured worker limits.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, batch: Batch) -> Result<BatchId, TransferError> {
        self.launch(batch, self.config.workers, true)
    }

    /// Start a parsed batch-apply request.
    ///
    /// The request's worker limits, when present, override the configured ones.
    pub fn start_request(&self, request: BatchRequest) -> Result<BatchId, TransferError> {
        let workers = request.worker_config.unwrap_or(self.config.workers);
        let batch = request.into_batch()?;
        self.launch(batch, workers, true)
    }

    fn launch(
        &self,
        batch: Batch,
        workers: WorkerConfig,
        record_undo: bool,
    ) -> Result<BatchId, TransferError> {
        workers.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TransferError::invalid_config("batches must start inside a Tokio runtime"))?;

        let config = Arc::new(self.config.with_workers(workers));
        let batch_id = batch.batch_id.clone();
        let tracker = Arc::new(BatchTracker::new(
            batch.len(),
            batch.total_bytes(),
            EmitGate::new(config.progress_interval(), config.progress_bytes_step),
        ));
        let status = Arc::new(RwLock::new(BatchStatus::Pending));
        let ctx = Arc::new(
            TaskContext::new(batch_id.clone(), batch.mode, config, Arc::clone(&tracker))
                .with_sink(Arc::clone(&self.sink))
                .with_native_tool(self.native.clone())
                .with_status(Arc::clone(&status)),
        );
        let (done, _) = watch::channel(None);
        let handle = Arc::new(BatchHandle {
            mode: batch.mode,
            status,
            tracker,
            ctx: Arc::clone(&ctx),
            final_snapshot: OnceLock::new(),
            done,
        });

        match self.batches.entry(batch_id.clone()) {
            Entry::Occupied(_) => {
                return Err(TransferError::DuplicateBatch {
                    batch_id: batch_id.to_string(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
            }
        }
        let cancel = self.registry.register(&batch_id);

        info!(
            "batch {}: {} {} files ({} bytes), {} files x {} chunks",
            batch_id,
            batch.mode,
            batch.len(),
            batch.total_bytes(),
            workers.max_file_concurrency,
            workers.max_chunk_concurrency
        );

        let driver = self.clone();
        runtime.spawn(async move {
            driver
                .drive(batch, handle, ctx, workers, cancel, record_undo)
                .await;
        });

        Ok(batch_id)
    }

    async fn drive(
        self,
        mut batch: Batch,
        handle: Arc<BatchHandle>,
        ctx: Arc<TaskContext>,
        workers: WorkerConfig,
        cancel: CancellationToken,
        record_undo: bool,
    ) {
        let started_at = Utc::now();
        {
            let mut status = handle.status.write();
            if *status == BatchStatus::Pending {
                *status = BatchStatus::Running;
            }
        }
        fill_missing_sizes(&mut batch, &handle.tracker).await;
        ctx.emit_progress();

        let results = WorkerPool::new(workers)
            .submit_batch(batch.scheduling_order(), ctx, cancel)
            .await;

        let summary = BatchSummary::from_results(
            batch.batch_id.clone(),
            batch.mode,
            &results,
            self.config.max_error_details,
            started_at,
        );

        if record_undo {
            if let Some(operation) = UndoableOperation::from_results(batch.mode, &results) {
                self.undo.lock().record(batch.batch_id.clone(), operation);
            }
        }

        let snapshot = handle.tracker.snapshot(&batch.batch_id, summary.status);
        let _ = handle.final_snapshot.set(snapshot.clone());
        *handle.status.write() = summary.status;

        info!(
            "batch {} {}: {}",
            batch.batch_id,
            summary.status,
            summary.summary_line()
        );

        self.sink.send(TransferEvent::Progress(snapshot));
        self.sink.send(TransferEvent::Finished(summary.clone()));
        handle.done.send_replace(Some(summary));
    }

    fn handle(&self, batch_id: &BatchId) -> Option<Arc<BatchHandle>> {
        self.batches.get(batch_id).map(|h| Arc::clone(h.value()))
    }

    /// Request cancellation of a batch.
    ///
    /// Returns `false` only for unknown ids. Cancelling a finished batch
    /// sets its signal but leaves its status alone.
    pub fn cancel(&self, batch_id: &BatchId) -> bool {
        let signalled = self.registry.cancel(batch_id);
        let Some(handle) = self.handle(batch_id) else {
            return signalled;
        };

        let mut status = handle.status.write();
        if !status.is_terminal() {
            *status = BatchStatus::Cancelling;
            info!("batch {} cancelling", batch_id);
        }
        true
    }

    /// Check whether cancellation was requested for a batch.
    pub fn is_cancelled(&self, batch_id: &BatchId) -> bool {
        self.registry.is_cancelled(batch_id)
    }

    /// Current progress of a batch.
    ///
    /// Once the batch is terminal the same snapshot is returned every time.
    pub fn get_status(&self, batch_id: &BatchId) -> Option<ProgressSnapshot> {
        let handle = self.handle(batch_id)?;
        if let Some(snapshot) = handle.final_snapshot.get() {
            return Some(snapshot.clone());
        }
        let status = *handle.status.read();
        Some(handle.tracker.snapshot(batch_id, status))
    }

    /// State of one operation of a batch.
    ///
    /// `None` for unknown batches and for operations that never started.
    pub fn operation_status(
        &self,
        batch_id: &BatchId,
        operation_id: OperationId,
    ) -> Option<TransferStateSnapshot> {
        self.handle(batch_id)?.ctx.operation_state(operation_id)
    }

    /// Mode of a known batch.
    pub fn mode(&self, batch_id: &BatchId) -> Option<TransferMode> {
        self.handle(batch_id).map(|h| h.mode)
    }

    /// Summary of a finished batch.
    pub fn summary(&self, batch_id: &BatchId) -> Option<BatchSummary> {
        let handle = self.handle(batch_id)?;
        let summary = handle.done.borrow().clone();
        summary
    }

    /// Wait until a batch reaches a terminal state.
    pub async fn wait(&self, batch_id: &BatchId) -> Option<BatchSummary> {
        let handle = self.handle(batch_id)?;
        let mut rx = handle.done.subscribe();
        let summary = rx.wait_for(Option::is_some).await.ok().and_then(|s| (*s).clone());
        summary
    }

    /// Forget a finished batch and its cancellation signal.
    ///
    /// Returns `false` if the batch is unknown or still running.
    pub fn clear(&self, batch_id: &BatchId) -> bool {
        let removed = self
            .batches
            .remove_if(batch_id, |_, handle| handle.status.read().is_terminal())
            .is_some();
        if removed {
            self.registry.clear(batch_id);
            debug!("batch {} cleared", batch_id);
        }
        removed
    }

    /// Ids of batches that have not reached a terminal state.
    pub fn active_batches(&self) -> Vec<BatchId> {
        self.batches
            .iter()
            .filter(|entry| !entry.value().status.read().is_terminal())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Recorded batch effects, oldest first.
    pub fn undo_log(&self) -> Vec<UndoEntry> {
        self.undo.lock().iter().cloned().collect()
    }

    /// Revert the recorded effects of a finished batch.
    ///
    /// Copies are deleted; moves run as a reverse move batch.
    pub async fn undo(&self, batch_id: &BatchId) -> Result<UndoReport, TransferError> {
        let entry = self
            .undo
            .lock()
            .take(batch_id)
            .ok_or_else(|| TransferError::UnknownBatch {
                batch_id: batch_id.to_string(),
            })?;
        info!("undo batch {}: {}", batch_id, entry.operation.undo_description());

        match entry.operation {
            UndoableOperation::FilesCopied { created } => {
                tokio::task::spawn_blocking(move || remove_copies(created))
                    .await
                    .map_err(|e| TransferError::TaskPanicked {
                        message: e.to_string(),
                    })
            }
            UndoableOperation::FilesMoved { moves } => {
                let current: Vec<PathBuf> = moves.iter().map(|(_, to)| to.clone()).collect();
                let operations = moves
                    .into_iter()
                    .enumerate()
                    .map(|(i, (from, to))| Operation::file(i as u64, to, from, 0))
                    .collect();
                let undo_id = BatchId::new(format!("{}-undo-{}", batch_id, entry.id));
                let batch = Batch::new(undo_id.clone(), operations, TransferMode::Move)?;
                self.launch(batch, self.config.workers, false)?;

                let summary = self
                    .wait(&undo_id)
                    .await
                    .ok_or_else(|| TransferError::UnknownBatch {
                        batch_id: undo_id.to_string(),
                    })?;
                self.clear(&undo_id);
                Ok(report_from_summary(&summary, &current))
            }
        }
    }
}

impl std::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("config", &self.config)
            .field("native", &self.native)
            .field("batches", &self.batches.len())
            .finish_non_exhaustive()
    }
}

/// Read the sizes a request left unknown and add them to the planned total.
async fn fill_missing_sizes(batch: &mut Batch, tracker: &BatchTracker) {
    let unsized_items: Vec<(usize, PathBuf)> = batch
        .operations
        .iter()
        .enumerate()
        .filter(|(_, op)| op.size_bytes == 0)
        .map(|(index, op)| (index, op.source.clone()))
        .collect();
    if unsized_items.is_empty() {
        return;
    }

    let sizes = tokio::task::spawn_blocking(move || {
        unsized_items
            .into_iter()
            .map(|(index, source)| (index, fs::metadata(&source).map(|m| m.len()).unwrap_or(0)))
            .collect::<Vec<_>>()
    })
    .await;

    match sizes {
        Ok(sizes) => {
            for (index, len) in sizes {
                batch.operations[index].size_bytes = len;
                tracker.adjust_total(0, len);
            }
        }
        Err(e) => warn!("batch {}: reading source sizes failed: {}", batch.batch_id, e),
    }
}

fn remove_copies(created: Vec<PathBuf>) -> UndoReport {
    let mut report = UndoReport::default();
    for path in created {
        match fs::remove_file(&path) {
            Ok(()) => report.reverted += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} already gone", path.display());
                report.reverted += 1;
            }
            Err(e) => {
                warn!("failed to remove {}: {}", path.display(), e);
                report.failed.push((path, e.to_string()));
            }
        }
    }
    report
}

fn report_from_summary(summary: &BatchSummary, paths: &[PathBuf]) -> UndoReport {
    let path_of = |id: u64| paths.get(id as usize).cloned().unwrap_or_default();
    let mut failed: Vec<(PathBuf, String)> = summary
        .failed
        .iter()
        .map(|f| {
            let reason = f.error.clone().unwrap_or_else(|| format!("{:?}", f.kind));
            (path_of(f.operation_id.0), reason)
        })
        .collect();
    if summary.cancelled_count > 0 {
        failed.push((PathBuf::new(), format!("{} moves cancelled", summary.cancelled_count)));
    }
    UndoReport {
        reverted: summary.succeeded.len(),
        failed,
    }
}
