//! Undo log for finished batches.

use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use plateshift_core::{BatchId, TransferMode};
use serde::{Deserialize, Serialize};

use crate::operation::TransferResult;

/// An entry in the undo log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoEntry {
    /// Unique ID for this entry.
    pub id: u64,
    /// Batch whose effects this entry records.
    pub batch_id: BatchId,
    /// When the batch finished.
    pub timestamp: DateTime<Utc>,
    /// What the batch did.
    pub operation: UndoableOperation,
    /// Human-readable description.
    pub description: String,
}

/// Effects of a batch that can be reverted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UndoableOperation {
    /// Files were moved from one location to another.
    FilesMoved {
        /// List of (original_path, new_path) pairs.
        moves: Vec<(PathBuf, PathBuf)>,
    },
    /// Files were copied to a destination.
    FilesCopied {
        /// Destinations created by the batch.
        created: Vec<PathBuf>,
    },
}

impl UndoableOperation {
    /// Build the record of a batch from its successful results.
    ///
    /// Returns `None` when nothing succeeded.
    pub fn from_results(mode: TransferMode, results: &[TransferResult]) -> Option<Self> {
        let done = results.iter().filter(|r| r.is_success());
        let operation = match mode {
            TransferMode::Copy => Self::FilesCopied {
                created: done.map(|r| r.destination.clone()).collect(),
            },
            TransferMode::Move => Self::FilesMoved {
                moves: done
                    .map(|r| (r.source.clone(), r.destination.clone()))
                    .collect(),
            },
        };
        (!operation.is_empty()).then_some(operation)
    }

    /// Number of files covered.
    pub fn len(&self) -> usize {
        match self {
            Self::FilesMoved { moves } => moves.len(),
            Self::FilesCopied { created } => created.len(),
        }
    }

    /// Check if no files are covered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// What undoing this entry will do.
    pub fn undo_description(&self) -> String {
        match self {
            Self::FilesMoved { moves } => {
                format!("Move {} files back to original location", moves.len())
            }
            Self::FilesCopied { created } => {
                format!("Delete {} copied files", created.len())
            }
        }
    }
}

/// Outcome of reverting a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UndoReport {
    /// Files restored or removed.
    pub reverted: usize,
    /// Paths that could not be reverted, with the reason.
    pub failed: Vec<(PathBuf, String)>,
}

impl UndoReport {
    /// Check if every file was reverted.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Bounded history of finished batches that can be reverted.
#[derive(Debug)]
pub struct UndoLog {
    entries: VecDeque<UndoEntry>,
    max_entries: usize,
    next_id: u64,
}

impl Default for UndoLog {
    fn default() -> Self {
        Self::new(100)
    }
}

impl UndoLog {
    /// Log keeping at most `max_entries` batches.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(1000)),
            max_entries,
            next_id: 0,
        }
    }

    /// Record the effects of a batch.
    ///
    /// Returns the ID assigned to this entry.
    pub fn record(&mut self, batch_id: BatchId, operation: UndoableOperation) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        // Drop the oldest batch once full
        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }

        let description = match &operation {
            UndoableOperation::FilesMoved { moves } => format!("Moved {} files", moves.len()),
            UndoableOperation::FilesCopied { created } => {
                format!("Copied {} files", created.len())
            }
        };
        self.entries.push_back(UndoEntry {
            id,
            batch_id,
            timestamp: Utc::now(),
            operation,
            description,
        });

        id
    }

    /// Remove and return the entry for `batch_id`.
    pub fn take(&mut self, batch_id: &BatchId) -> Option<UndoEntry> {
        let index = self.entries.iter().rposition(|e| &e.batch_id == batch_id)?;
        self.entries.remove(index)
    }

    /// Number of recorded batches.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &UndoEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plateshift_core::{OperationId, TransferError};

    fn copied(path: &str) -> UndoableOperation {
        UndoableOperation::FilesCopied {
            created: vec![PathBuf::from(path)],
        }
    }

    #[test]
    fn test_undo_log_record() {
        let mut log = UndoLog::new(10);

        let id = log.record(BatchId::new("a"), copied("/out/a.exr"));
        assert_eq!(id, 0);
        assert_eq!(log.len(), 1);

        let id = log.record(BatchId::new("b"), copied("/out/b.exr"));
        assert_eq!(id, 1);
        assert_eq!(log.iter().last().unwrap().description, "Copied 1 files");
    }

    #[test]
    fn test_undo_log_max_entries() {
        let mut log = UndoLog::new(3);

        for name in ["1", "2", "3", "4"] {
            log.record(BatchId::new(name), copied("/out/x.exr"));
        }
        assert_eq!(log.len(), 3);

        // First entry should be removed
        assert!(log.take(&BatchId::new("1")).is_none());
        let kept: Vec<&str> = log.iter().map(|e| e.batch_id.as_str()).collect();
        assert_eq!(kept, vec!["2", "3", "4"]);
    }

    #[test]
    fn test_take_by_batch() {
        let mut log = UndoLog::default();
        log.record(BatchId::new("a"), copied("/out/a.exr"));
        log.record(BatchId::new("b"), copied("/out/b.exr"));

        let entry = log.take(&BatchId::new("a")).unwrap();
        assert_eq!(entry.id, 0);
        assert_eq!(log.len(), 1);
        assert!(log.take(&BatchId::new("a")).is_none());
    }

    #[test]
    fn test_from_results_keeps_successes() {
        let results = vec![
            TransferResult::done(OperationId(0), 4, "/in/a".into(), "/out/a".into(), vec![]),
            TransferResult::from_error(
                OperationId(1),
                TransferError::Cancelled,
                "/in/b".into(),
                "/out/b".into(),
            ),
        ];

        let op = UndoableOperation::from_results(TransferMode::Move, &results).unwrap();
        match op {
            UndoableOperation::FilesMoved { moves } => {
                assert_eq!(moves, vec![(PathBuf::from("/in/a"), PathBuf::from("/out/a"))]);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(UndoableOperation::from_results(TransferMode::Copy, &results[1..]).is_none());
    }
}
