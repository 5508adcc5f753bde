//! Core types for plateshift.
//!
//! This crate provides the data model shared by the transfer engine and its
//! callers: operations, batches, batch-apply requests, engine configuration
//! and the error taxonomy.

mod batch;
mod config;
mod error;
mod operation;
mod request;

pub use batch::{Batch, BatchId, BatchStatus, TransferMode, TransferStatus};
pub use config::{
    MIN_CHUNK_SIZE, NativeToolMode, STREAM_BUDGET_GUIDELINE, TransferConfig,
    TransferConfigBuilder, WorkerConfig,
};
pub use error::{ErrorKind, TransferError, TransferWarning, WarningKind};
pub use operation::{Operation, OperationId, OperationKind};
pub use request::{BatchRequest, OperationSpec};
