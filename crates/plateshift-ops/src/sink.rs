//! Destinations for progress events.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::progress::TransferEvent;

/// Receives progress events from the engine.
///
/// Implementations must not block: events are sent from worker threads in
/// the middle of a copy.
pub trait ProgressSink: Send + Sync {
    /// Deliver an event. Delivery failures are ignored by the engine.
    fn send(&self, event: TransferEvent);
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn send(&self, _event: TransferEvent) {}
}

impl ProgressSink for mpsc::UnboundedSender<TransferEvent> {
    fn send(&self, event: TransferEvent) {
        if mpsc::UnboundedSender::send(self, event).is_err() {
            trace!("progress receiver dropped");
        }
    }
}

impl ProgressSink for broadcast::Sender<TransferEvent> {
    fn send(&self, event: TransferEvent) {
        // No subscribers is not an error.
        let _ = broadcast::Sender::send(self, event);
    }
}

impl<S: ProgressSink + ?Sized> ProgressSink for Arc<S> {
    fn send(&self, event: TransferEvent) {
        (**self).send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{BatchTracker, EmitGate};
    use plateshift_core::{BatchId, BatchStatus};
    use std::time::Duration;

    fn event() -> TransferEvent {
        let tracker = BatchTracker::new(1, 1, EmitGate::new(Duration::ZERO, 0));
        TransferEvent::Progress(tracker.snapshot(&BatchId::new("b"), BatchStatus::Running))
    }

    #[test]
    fn test_unbounded_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn ProgressSink> = Arc::new(tx);
        sink.send(event());
        assert!(matches!(rx.try_recv(), Ok(TransferEvent::Progress(_))));
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        ProgressSink::send(&tx, event());
    }

    #[test]
    fn test_broadcast_sink() {
        let (tx, mut rx) = broadcast::channel(4);
        ProgressSink::send(&tx, event());
        assert!(matches!(rx.try_recv(), Ok(TransferEvent::Progress(_))));
    }
}
