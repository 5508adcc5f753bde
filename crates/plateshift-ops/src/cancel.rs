//! Batch-scoped cancellation signals.

use dashmap::DashMap;
use plateshift_core::BatchId;
use tokio_util::sync::CancellationToken;

/// Maps batch ids to their cancellation signal.
///
/// Owned by the application's long-lived service context and shared through
/// an `Arc`; each test can create its own instance. Signals are monotonic:
/// once cancelled, a batch stays cancelled until [`clear`](Self::clear).
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    signals: DashMap<BatchId, CancellationToken>,
}

impl CancellationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            signals: DashMap::new(),
        }
    }

    /// Register a batch and return its signal.
    ///
    /// Registering a live id again returns the existing signal.
    pub fn register(&self, batch_id: &BatchId) -> CancellationToken {
        self.signals
            .entry(batch_id.clone())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Request cancellation. Returns `false` if the batch is unknown.
    ///
    /// Idempotent; repeated calls have no further effect.
    pub fn cancel(&self, batch_id: &BatchId) -> bool {
        match self.signals.get(batch_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Check if a batch has been cancelled.
    pub fn is_cancelled(&self, batch_id: &BatchId) -> bool {
        self.signals
            .get(batch_id)
            .is_some_and(|token| token.is_cancelled())
    }

    /// Get the signal for a registered batch.
    pub fn signal(&self, batch_id: &BatchId) -> Option<CancellationToken> {
        self.signals.get(batch_id).map(|token| token.clone())
    }

    /// Forget a batch. Returns `true` if it was registered.
    pub fn clear(&self, batch_id: &BatchId) -> bool {
        self.signals.remove(batch_id).is_some()
    }

    /// Number of registered batches.
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    /// Check if no batches are registered.
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}
