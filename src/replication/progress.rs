use std::collections::HashMap;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use super::CommandOutput;

/// The outcome of applying one operation, as delivered to its proposer.
pub type OperationResult = Result<CommandOutput, String>;

/// Tracks operations proposed by this member until they are applied.
///
/// Each operation gets a single-slot channel, so resolving never blocks the thread applying entries.
#[derive(Default)]
pub struct ProgressTracker {
    pending: Mutex<HashMap<u64, Sender<OperationResult>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, operation_id: u64) -> Receiver<OperationResult> {
        let (tx, rx) = bounded(1);
        self.pending.lock().insert(operation_id, tx);
        rx
    }

    /// Delivers the result of an operation. Returns `false` if the operation was not pending, for example because it
    /// was already resolved by an earlier copy of the same proposal.
    pub fn resolve(&self, operation_id: u64, result: OperationResult) -> bool {
        match self.pending.lock().remove(&operation_id) {
            Some(tx) => tx.try_send(result).is_ok(),
            None => false,
        }
    }

    /// Stops tracking an operation. Its waiter observes the operation as abandoned.
    pub fn abandon(&self, operation_id: u64) {
        self.pending.lock().remove(&operation_id);
    }

    pub fn abandon_all(&self) {
        self.pending.lock().clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::TryRecvError;

    use super::*;

    #[test]
    fn resolves_once() {
        let tracker = ProgressTracker::new();
        let rx = tracker.register(1);
        assert!(tracker.resolve(1, Ok(CommandOutput::Token(3))));
        assert!(!tracker.resolve(1, Ok(CommandOutput::Token(4))));
        assert_eq!(rx.try_recv(), Ok(Ok(CommandOutput::Token(3))));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn abandoned_waiter_is_disconnected() {
        let tracker = ProgressTracker::new();
        let rx = tracker.register(1);
        tracker.abandon(1);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
    }
}
