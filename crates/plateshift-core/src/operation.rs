//! Single source-to-destination operation types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Unique identifier for an operation within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u64);

impl OperationId {
    /// Create a new OperationId from a u64.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What an operation transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// A standalone file.
    #[default]
    File,
    /// One frame of an image sequence.
    SequenceMember,
}

/// One source to destination file transfer.
///
/// Created by the mapping engine and never mutated by the transfer engine;
/// runtime status is tracked separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Identifier, unique within the owning batch.
    pub id: OperationId,
    /// File to read.
    pub source: PathBuf,
    /// File to create or overwrite.
    pub destination: PathBuf,
    /// Standalone file or sequence member.
    #[serde(default)]
    pub kind: OperationKind,
    /// Expected size in bytes (used for planning and totals).
    #[serde(default)]
    pub size_bytes: u64,
    /// Sequence this operation belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<String>,
}

impl Operation {
    /// Create a file operation.
    pub fn file(
        id: u64,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        size_bytes: u64,
    ) -> Self {
        Self {
            id: OperationId(id),
            source: source.into(),
            destination: destination.into(),
            kind: OperationKind::File,
            size_bytes,
            sequence_id: None,
        }
    }

    /// Create a sequence member operation.
    pub fn sequence_member(
        id: u64,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        size_bytes: u64,
        sequence_id: impl Into<String>,
    ) -> Self {
        Self {
            id: OperationId(id),
            source: source.into(),
            destination: destination.into(),
            kind: OperationKind::SequenceMember,
            size_bytes,
            sequence_id: Some(sequence_id.into()),
        }
    }

    /// Check if this operation is part of a sequence.
    pub fn is_sequence_member(&self) -> bool {
        self.kind == OperationKind::SequenceMember
    }
}
