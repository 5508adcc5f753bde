//! Batch container and lifecycle states.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::TransferError;
use crate::operation::{Operation, OperationId};

/// Identifier of a user-initiated transfer request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    /// Wrap a caller-supplied id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BatchId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for BatchId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Whether sources are kept or removed after transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    #[default]
    Copy,
    Move,
}

impl std::fmt::Display for TransferMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Copy => write!(f, "copy"),
            Self::Move => write!(f, "move"),
        }
    }
}

impl std::str::FromStr for TransferMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "copy" => Ok(Self::Copy),
            "move" => Ok(Self::Move),
            other => Err(format!("unknown operation type '{other}'")),
        }
    }
}

/// Lifecycle of a batch.
///
/// `Pending -> Running -> (Completed | Cancelled | Failed)`, with
/// `Running -> Cancelling -> Cancelled` while in-flight work drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
}

impl BatchStatus {
    /// Check if the batch reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-operation transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TransferStatus {
    Queued = 0,
    Copying = 1,
    Verifying = 2,
    Done = 3,
    Cancelled = 4,
    Error = 5,
}

impl TransferStatus {
    /// Encode for atomic storage.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode from atomic storage. Unknown values map to `Error`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Queued,
            1 => Self::Copying,
            2 => Self::Verifying,
            3 => Self::Done,
            4 => Self::Cancelled,
            _ => Self::Error,
        }
    }

    /// Check if the operation is finished.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Error)
    }
}

/// One user-initiated group of file operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Unique id.
    pub batch_id: BatchId,
    /// Operations in submission order.
    pub operations: Vec<Operation>,
    /// Copy or move.
    pub mode: TransferMode,
    /// Current lifecycle state.
    pub status: BatchStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Batch {
    /// Create a pending batch, validating operation ids are unique.
    pub fn new(
        batch_id: BatchId,
        operations: Vec<Operation>,
        mode: TransferMode,
    ) -> Result<Self, TransferError> {
        if batch_id.as_str().is_empty() {
            return Err(TransferError::invalid_request("batch id cannot be empty"));
        }

        let mut seen = HashSet::with_capacity(operations.len());
        for op in &operations {
            if !seen.insert(op.id) {
                return Err(TransferError::invalid_request(format!(
                    "duplicate operation id {}",
                    op.id
                )));
            }
        }

        Ok(Self {
            batch_id,
            operations,
            mode,
            status: BatchStatus::Pending,
            created_at: Utc::now(),
        })
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Check if the batch has no operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Sum of expected operation sizes.
    pub fn total_bytes(&self) -> u64 {
        self.operations.iter().map(|op| op.size_bytes).sum()
    }

    /// Look up an operation by id.
    pub fn operation(&self, id: OperationId) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }

    /// Operations grouped by sequence id, in order of first appearance.
    ///
    /// Standalone files form their own single-element group.
    pub fn sequences(&self) -> Vec<Vec<&Operation>> {
        let mut groups: IndexMap<GroupKey<'_>, Vec<&Operation>> = IndexMap::new();
        for op in &self.operations {
            let key = match &op.sequence_id {
                Some(seq) => GroupKey::Sequence(seq),
                None => GroupKey::Single(op.id),
            };
            groups.entry(key).or_default().push(op);
        }
        groups.into_values().collect()
    }

    /// Operations in scheduling order: sequence members kept together at the
    /// position of their first member, otherwise submission order.
    pub fn scheduling_order(&self) -> Vec<Operation> {
        self.sequences()
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum GroupKey<'a> {
    Sequence(&'a str),
    Single(OperationId),
}
