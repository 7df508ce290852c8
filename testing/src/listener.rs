//! Outcome-recording listener for assertions.

use std::sync::Mutex;
use ticketgate_core::message::{ResponseListener, TicketKind, TicketOutcome};
use tokio::sync::Notify;

/// A recorded outcome delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedOutcome {
    /// Channel kind the outcome arrived on.
    pub kind: TicketKind,
    /// Correlation id of the request.
    pub ticket_id: String,
    /// The terminal outcome.
    pub outcome: TicketOutcome,
}

/// [`ResponseListener`] that records every outcome it receives.
///
/// Tests can read the recorded outcomes synchronously or await a target
/// count with [`wait_for`](Self::wait_for).
#[derive(Default)]
pub struct RecordingListener {
    outcomes: Mutex<Vec<RecordedOutcome>>,
    notify: Notify,
}

impl RecordingListener {
    /// Create an empty listener.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the outcomes recorded so far, in delivery order.
    #[must_use]
    pub fn outcomes(&self) -> Vec<RecordedOutcome> {
        self.outcomes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Outcomes recorded for one ticket id.
    #[must_use]
    pub fn outcomes_for(&self, ticket_id: &str) -> Vec<RecordedOutcome> {
        self.outcomes()
            .into_iter()
            .filter(|o| o.ticket_id == ticket_id)
            .collect()
    }

    /// Number of outcomes recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` outcomes have been recorded.
    ///
    /// Combine with `tokio::time::timeout` in tests that must not hang.
    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            if self.len() >= count {
                return;
            }
            notified.await;
        }
    }
}

impl ResponseListener for RecordingListener {
    fn on_outcome(&self, kind: TicketKind, ticket_id: &str, outcome: TicketOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(RecordedOutcome {
                kind,
                ticket_id: ticket_id.to_string(),
                outcome,
            });
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Test code can use unwrap

    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_for_sees_outcomes_from_another_task() {
        let listener = Arc::new(RecordingListener::new());

        let writer = Arc::clone(&listener);
        tokio::spawn(async move {
            writer.on_outcome(TicketKind::Cashout, "T-1", TicketOutcome::Timeout);
        });

        tokio::time::timeout(Duration::from_secs(1), listener.wait_for(1))
            .await
            .unwrap();

        let recorded = listener.outcomes_for("T-1");
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].outcome, TicketOutcome::Timeout);
    }
}
