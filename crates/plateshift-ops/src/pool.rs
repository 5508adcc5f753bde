//! Bounded concurrent execution of transfer tasks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use plateshift_core::{Operation, OperationId, TransferError, WorkerConfig, STREAM_BUDGET_GUIDELINE};
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::operation::TransferResult;
use crate::task::{TaskContext, TransferTask};

/// Runs the tasks of a batch with at most `max_file_concurrency` in flight.
///
/// Tasks are started in submission order. Each holds a semaphore permit
/// for its whole lifetime, so the number of open source/destination pairs
/// never exceeds the file limit. The chunk limit reaches the copier through
/// the strategy's stream count.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: WorkerConfig,
}

/// What the pool needs to report a task that panicked.
struct Spawned {
    index: usize,
    operation_id: OperationId,
    source: PathBuf,
    destination: PathBuf,
}

impl WorkerPool {
    /// Create a pool with the given limits.
    pub fn new(workers: WorkerConfig) -> Self {
        Self { workers }
    }

    /// Configured limits.
    pub fn workers(&self) -> WorkerConfig {
        self.workers
    }

    /// Execute `operations`, returning one result per operation in
    /// submission order.
    ///
    /// Once `cancel` fires no further task is started; the operations that
    /// never started are reported as cancelled without filesystem access.
    /// A failing operation never stops its siblings.
    pub async fn submit_batch(
        &self,
        operations: Vec<Operation>,
        ctx: Arc<TaskContext>,
        cancel: CancellationToken,
    ) -> Vec<TransferResult> {
        if self.workers.exceeds_guideline() {
            warn!(
                "{} concurrent streams requested, above the guideline of {}",
                self.workers.stream_budget(),
                STREAM_BUDGET_GUIDELINE
            );
        }

        let total = operations.len();
        let semaphore = Arc::new(Semaphore::new(self.workers.max_file_concurrency.max(1)));
        let mut slots: Vec<Option<TransferResult>> =
            std::iter::repeat_with(|| None).take(total).collect();
        let mut spawned: HashMap<Id, Spawned> = HashMap::with_capacity(total);
        let mut join_set = JoinSet::new();
        let mut queue = operations.into_iter().enumerate();
        let mut skipped = 0;

        for (index, operation) in queue.by_ref() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                slots[index] = Some(not_started(operation, &ctx));
                skipped += 1;
                break;
            };

            let info = Spawned {
                index,
                operation_id: operation.id,
                source: operation.source.clone(),
                destination: operation.destination.clone(),
            };
            let task = TransferTask::new(operation, Arc::clone(&ctx));
            let token = cancel.clone();
            let handle = join_set.spawn(async move {
                let _permit = permit;
                (index, task.execute(token).await)
            });
            spawned.insert(handle.id(), info);
        }

        for (index, operation) in queue {
            slots[index] = Some(not_started(operation, &ctx));
            skipped += 1;
        }
        if skipped > 0 {
            debug!("{} operations not started after cancellation", skipped);
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => {
                    let Some(info) = spawned.remove(&e.id()) else {
                        error!("unknown transfer task failed: {}", e);
                        continue;
                    };
                    error!("transfer task for {} panicked: {}", info.source.display(), e);
                    let result = TransferResult::from_error(
                        info.operation_id,
                        TransferError::TaskPanicked {
                            message: e.to_string(),
                        },
                        info.source,
                        info.destination,
                    );
                    ctx.tracker.record_outcome(&result);
                    slots[info.index] = Some(result);
                }
            }
        }

        slots.into_iter().flatten().collect()
    }
}

fn not_started(operation: Operation, ctx: &TaskContext) -> TransferResult {
    let result = TransferResult::from_error(
        operation.id,
        TransferError::Cancelled,
        operation.source,
        operation.destination,
    );
    ctx.tracker.record_outcome(&result);
    result
}
