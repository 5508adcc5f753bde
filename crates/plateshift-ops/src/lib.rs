//! Transfer engine for plateshift.
//!
//! This crate copies and moves batches of large files (image sequences,
//! plates, caches) with bounded concurrency, chunk-level cancellation and
//! rate-limited progress reporting. A [`BatchCoordinator`] owns each batch;
//! a [`WorkerPool`] runs its [`TransferTask`]s, which pick a
//! [`CopyStrategy`] per file.

mod cancel;
mod chunked;
mod coordinator;
mod move_op;
mod native;
mod operation;
mod pool;
mod progress;
mod sink;
mod strategy;
mod task;
mod undo;

pub use cancel::CancellationRegistry;
pub use chunked::{ChunkedCopier, split_ranges};
pub use coordinator::BatchCoordinator;
pub use native::{NativeTool, ToolFlavor};
pub use operation::{TransferResult, TransferState, TransferStateSnapshot};
pub use pool::WorkerPool;
pub use progress::{
    BatchSummary, BatchTracker, EmitGate, FailedOperation, ProgressSnapshot, TransferEvent,
    estimate_eta,
};
pub use sink::{NullSink, ProgressSink};
pub use strategy::CopyStrategy;
pub use task::{TaskContext, TransferTask};
pub use undo::{UndoEntry, UndoLog, UndoReport, UndoableOperation};
