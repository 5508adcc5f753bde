//! Batch-apply requests as produced by the mapping engine.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::batch::{Batch, BatchId, TransferMode};
use crate::config::WorkerConfig;
use crate::error::TransferError;
use crate::operation::{Operation, OperationId, OperationKind};

/// One entry of a batch-apply request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSpec {
    /// Optional caller id; defaults to the entry's index.
    #[serde(default)]
    pub id: Option<u64>,
    pub source: PathBuf,
    pub destination: PathBuf,
    #[serde(default)]
    pub kind: OperationKind,
    /// Size in bytes; 0 means "stat the source".
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub sequence_id: Option<String>,
}

/// A user-confirmed request to copy or move a set of files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub operations: Vec<OperationSpec>,
    #[serde(default)]
    pub operation_type: TransferMode,
    #[serde(default)]
    pub worker_config: Option<WorkerConfig>,
    #[serde(default)]
    pub batch_id: Option<String>,
}

impl BatchRequest {
    /// Parse a request from JSON.
    pub fn from_json(content: &str) -> Result<Self, TransferError> {
        serde_json::from_str(content).map_err(|e| TransferError::invalid_request(e.to_string()))
    }

    /// Convert into a pending batch.
    ///
    /// Missing ids become the entry index and a missing batch id is
    /// generated. Unknown sizes stay 0; the engine reads them from the
    /// sources once the batch runs.
    pub fn into_batch(self) -> Result<Batch, TransferError> {
        let batch_id = match self.batch_id {
            Some(id) => BatchId::new(id),
            None => BatchId::generate(),
        };

        let operations = self
            .operations
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                let kind = if spec.sequence_id.is_some() {
                    OperationKind::SequenceMember
                } else {
                    spec.kind
                };
                Operation {
                    id: OperationId(spec.id.unwrap_or(index as u64)),
                    source: spec.source,
                    destination: spec.destination,
                    kind,
                    size_bytes: spec.size,
                    sequence_id: spec.sequence_id,
                }
            })
            .collect();

        Batch::new(batch_id, operations, self.operation_type)
    }
}
