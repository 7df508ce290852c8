//! Pending-request correlation table and the reaper that expires it.
//!
//! The registry is the sole structure mutated from different execution
//! roles: caller tasks register, the channel's consumer task completes, the
//! reaper expires, and the closing task drains. Every terminal path goes
//! through one atomic claim (remove-if-present under the table's mutex), so
//! a correlation id can never be completed twice or left orphaned. Listener
//! invocation always happens after the claim, outside the lock.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ticketgate_core::message::{ResponseListener, TicketKind, TicketOutcome, TicketResponse};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::DuplicateCorrelation;
use crate::worker::StopSignal;

/// One in-flight request, owned exclusively by the registry from
/// registration to completion.
pub struct PendingRequest {
    /// The correlation id (the ticket id of the request).
    pub correlation_id: String,
    /// Kind of the channel the request was sent on.
    pub kind: TicketKind,
    /// Wall-clock registration time, for logs.
    pub submitted_at: DateTime<Utc>,
    /// Monotonic deadline after which the request times out.
    pub deadline: Instant,
    /// The listener owed exactly one terminal outcome.
    pub listener: Arc<dyn ResponseListener>,
}

/// Correlation table for one channel.
///
/// Ids are unique among currently pending entries. An entry leaves the
/// table exactly once, through exactly one of [`complete`](Self::complete)
/// (reply), [`expire_due`](Self::expire_due) (timeout),
/// [`drain_all`](Self::drain_all) (forced close) or
/// [`remove`](Self::remove) (publish rollback, no outcome owed).
pub struct PendingRequestRegistry {
    kind: TicketKind,
    entries: Mutex<HashMap<String, PendingRequest>>,
    reaper_wake: Arc<Notify>,
}

impl PendingRequestRegistry {
    /// Create an empty registry for `kind`.
    ///
    /// `reaper_wake` is notified on registration so the reaper can re-plan
    /// its next sweep around a possibly earlier deadline.
    #[must_use]
    pub fn new(kind: TicketKind, reaper_wake: Arc<Notify>) -> Self {
        Self {
            kind,
            entries: Mutex::new(HashMap::new()),
            reaper_wake,
        }
    }

    /// The channel kind this registry belongs to.
    #[must_use]
    pub const fn kind(&self) -> TicketKind {
        self.kind
    }

    /// Register a request with `deadline = now + timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`DuplicateCorrelation`] if an entry with the same id is
    /// already pending.
    pub fn register(
        &self,
        correlation_id: &str,
        timeout: Duration,
        listener: Arc<dyn ResponseListener>,
    ) -> Result<(), DuplicateCorrelation> {
        let pending = {
            let mut entries = self.lock_entries();
            if entries.contains_key(correlation_id) {
                return Err(DuplicateCorrelation(correlation_id.to_string()));
            }
            entries.insert(
                correlation_id.to_string(),
                PendingRequest {
                    correlation_id: correlation_id.to_string(),
                    kind: self.kind,
                    submitted_at: Utc::now(),
                    deadline: Instant::now() + timeout,
                    listener,
                },
            );
            entries.len()
        };

        self.record_pending(pending);
        metrics::counter!("gate.requests.registered", "kind" => self.kind.as_str()).increment(1);
        tracing::debug!(
            kind = %self.kind,
            correlation_id = correlation_id,
            timeout_ms = timeout.as_millis(),
            pending = pending,
            "Request registered"
        );

        // Wake the reaper so a shorter deadline is picked up.
        self.reaper_wake.notify_one();
        Ok(())
    }

    /// Claim the entry for `correlation_id` and deliver `response` to its
    /// listener. Returns `false` when the id is unknown (already timed out,
    /// already completed, or never registered); the reply is dropped and
    /// logged, and no other entry is affected.
    pub fn complete(&self, correlation_id: &str, response: TicketResponse) -> bool {
        let claimed = {
            let mut entries = self.lock_entries();
            let entry = entries.remove(correlation_id);
            self.record_pending(entries.len());
            entry
        };

        match claimed {
            Some(entry) => {
                metrics::counter!("gate.replies.matched", "kind" => self.kind.as_str())
                    .increment(1);
                tracing::debug!(
                    kind = %self.kind,
                    correlation_id = correlation_id,
                    "Reply matched to pending request"
                );
                entry
                    .listener
                    .on_outcome(entry.kind, correlation_id, TicketOutcome::Reply(response));
                true
            }
            None => {
                metrics::counter!("gate.replies.stale", "kind" => self.kind.as_str()).increment(1);
                tracing::debug!(
                    kind = %self.kind,
                    correlation_id = correlation_id,
                    "Stale reply dropped (unknown or already resolved)"
                );
                false
            }
        }
    }

    /// Silently remove an entry without delivering an outcome.
    ///
    /// Used to roll back a registration whose publish failed; the caller is
    /// told synchronously instead.
    pub fn remove(&self, correlation_id: &str) -> bool {
        let removed = {
            let mut entries = self.lock_entries();
            let removed = entries.remove(correlation_id).is_some();
            self.record_pending(entries.len());
            removed
        };
        if removed {
            tracing::debug!(
                kind = %self.kind,
                correlation_id = correlation_id,
                "Registration rolled back after publish failure"
            );
        }
        removed
    }

    /// Claim every entry whose deadline has passed and deliver Timeout to
    /// each listener. Returns the number of expired entries.
    pub fn expire_due(&self, now: Instant) -> usize {
        let due: Vec<PendingRequest> = {
            let mut entries = self.lock_entries();
            let due_ids: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            let due: Vec<PendingRequest> = due_ids
                .iter()
                .filter_map(|id| entries.remove(id))
                .collect();
            self.record_pending(entries.len());
            due
        };

        for entry in &due {
            metrics::counter!("gate.requests.timed_out", "kind" => self.kind.as_str())
                .increment(1);
            tracing::warn!(
                kind = %self.kind,
                correlation_id = %entry.correlation_id,
                submitted_at = %entry.submitted_at,
                "Request timed out without a reply"
            );
            entry
                .listener
                .on_outcome(entry.kind, &entry.correlation_id, TicketOutcome::Timeout);
        }
        due.len()
    }

    /// Atomically empty the table and return every entry.
    ///
    /// Used only during channel close, so close can deliver a terminal
    /// outcome to every still-pending request exactly once.
    pub fn drain_all(&self) -> Vec<PendingRequest> {
        let drained: Vec<PendingRequest> = {
            let mut entries = self.lock_entries();
            let drained = entries.drain().map(|(_, entry)| entry).collect();
            self.record_pending(0);
            drained
        };
        if !drained.is_empty() {
            metrics::counter!("gate.requests.drained", "kind" => self.kind.as_str())
                .increment(drained.len() as u64);
        }
        drained
    }

    /// The earliest deadline among pending entries, for reaper scheduling.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock_entries()
            .values()
            .map(|entry| entry.deadline)
            .min()
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Whether no entry is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `correlation_id` is currently pending.
    #[must_use]
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.lock_entries().contains_key(correlation_id)
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn record_pending(&self, pending: usize) {
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("gate.requests.pending", "kind" => self.kind.as_str())
            .set(pending as f64);
    }
}

/// Deadline-driven sweep over the registries of every open channel.
///
/// One reaper per gate. It sleeps until the earliest deadline across all
/// attached partitions (bounded by a maximum interval), wakes early when a
/// registration may have introduced a shorter deadline, and expires every
/// due entry on each sweep.
pub struct Reaper {
    partitions: Arc<Mutex<Vec<Arc<PendingRequestRegistry>>>>,
    wake: Arc<Notify>,
    stop_tx: tokio::sync::watch::Sender<bool>,
    stop: StopSignal,
    handle: Mutex<Option<JoinHandle<()>>>,
    max_interval: Duration,
}

impl Reaper {
    /// Create a reaper that sweeps at least every `max_interval`.
    #[must_use]
    pub fn new(max_interval: Duration) -> Self {
        let (stop_tx, stop) = StopSignal::new();
        Self {
            partitions: Arc::new(Mutex::new(Vec::new())),
            wake: Arc::new(Notify::new()),
            stop_tx,
            stop,
            handle: Mutex::new(None),
            max_interval,
        }
    }

    /// The wake handle registries notify on registration.
    #[must_use]
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Attach a channel's registry partition to the sweep.
    pub fn attach(&self, partition: Arc<PendingRequestRegistry>) {
        self.partitions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(partition);
        self.wake.notify_one();
    }

    /// Spawn the sweep task. No-op (logged) when already started.
    pub fn start(&self) {
        let mut handle = self
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if handle.is_some() {
            tracing::debug!("Reaper already started");
            return;
        }

        let partitions = Arc::clone(&self.partitions);
        let wake = Arc::clone(&self.wake);
        let stop = self.stop.clone();
        let max_interval = self.max_interval;
        *handle = Some(tokio::spawn(async move {
            run_sweep(&partitions, &wake, &stop, max_interval).await;
        }));
        tracing::debug!(max_interval_ms = self.max_interval.as_millis(), "Reaper started");
    }

    /// Stop the sweep task: signal it, wait up to `grace`, then cancel.
    ///
    /// Returns `true` when the task stopped within the grace period.
    pub async fn close(&self, grace: Duration) -> bool {
        let _ = self.stop_tx.send(true);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(mut handle) = handle else {
            return true;
        };

        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            tracing::warn!("Reaper did not stop within grace period, cancelling");
            handle.abort();
            let _ = handle.await;
            return false;
        }
        tracing::debug!("Reaper stopped");
        true
    }
}

async fn run_sweep(
    partitions: &Mutex<Vec<Arc<PendingRequestRegistry>>>,
    wake: &Notify,
    stop: &StopSignal,
    max_interval: Duration,
) {
    loop {
        if stop.is_stopped() {
            return;
        }

        let snapshot: Vec<Arc<PendingRequestRegistry>> = {
            partitions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        };

        let ceiling = Instant::now() + max_interval;
        let target = snapshot
            .iter()
            .filter_map(|partition| partition.next_deadline())
            .min()
            .map_or(ceiling, |deadline| deadline.min(ceiling));

        tokio::select! {
            () = tokio::time::sleep_until(target) => {}
            () = wake.notified() => {}
            () = stop.stopped() => return,
        }

        let now = Instant::now();
        let mut expired = 0;
        for partition in &snapshot {
            expired += partition.expire_due(now);
        }
        if expired > 0 {
            tracing::debug!(expired = expired, "Reaper sweep expired pending requests");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Test code can use unwrap

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ticketgate_core::message::{ResponseStatus, TicketKind};

    struct CountingListener {
        replies: AtomicUsize,
        timeouts: AtomicUsize,
        closed: AtomicUsize,
    }

    impl CountingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                replies: AtomicUsize::new(0),
                timeouts: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            })
        }

        fn total(&self) -> usize {
            self.replies.load(Ordering::SeqCst)
                + self.timeouts.load(Ordering::SeqCst)
                + self.closed.load(Ordering::SeqCst)
        }
    }

    impl ResponseListener for CountingListener {
        fn on_outcome(&self, _kind: TicketKind, _ticket_id: &str, outcome: TicketOutcome) {
            match outcome {
                TicketOutcome::Reply(_) => self.replies.fetch_add(1, Ordering::SeqCst),
                TicketOutcome::Timeout => self.timeouts.fetch_add(1, Ordering::SeqCst),
                TicketOutcome::Closed => self.closed.fetch_add(1, Ordering::SeqCst),
            };
        }
    }

    fn registry() -> PendingRequestRegistry {
        PendingRequestRegistry::new(TicketKind::Submission, Arc::new(Notify::new()))
    }

    fn response(id: &str) -> TicketResponse {
        TicketResponse {
            ticket_id: id.to_string(),
            kind: TicketKind::Submission,
            status: ResponseStatus::Accepted,
            reason: None,
            signature: None,
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = registry();
        let listener = CountingListener::new();

        registry
            .register("T-1", Duration::from_secs(1), listener.clone())
            .unwrap();
        let err = registry
            .register("T-1", Duration::from_secs(1), listener.clone())
            .unwrap_err();

        assert_eq!(err, DuplicateCorrelation("T-1".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn complete_claims_exactly_once() {
        let registry = registry();
        let listener = CountingListener::new();
        registry
            .register("T-1", Duration::from_secs(1), listener.clone())
            .unwrap();

        assert!(registry.complete("T-1", response("T-1")));
        assert!(!registry.complete("T-1", response("T-1")));
        assert_eq!(listener.replies.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_reply_is_dropped_without_side_effects() {
        let registry = registry();
        let listener = CountingListener::new();
        registry
            .register("T-1", Duration::from_secs(1), listener.clone())
            .unwrap();

        assert!(!registry.complete("T-unknown", response("T-unknown")));
        assert_eq!(listener.total(), 0);
        assert!(registry.contains("T-1"));
    }

    #[test]
    fn expire_due_claims_only_past_deadlines() {
        let registry = registry();
        let listener = CountingListener::new();
        registry
            .register("T-due", Duration::ZERO, listener.clone())
            .unwrap();
        registry
            .register("T-later", Duration::from_secs(60), listener.clone())
            .unwrap();

        let expired = registry.expire_due(Instant::now() + Duration::from_millis(1));

        assert_eq!(expired, 1);
        assert_eq!(listener.timeouts.load(Ordering::SeqCst), 1);
        assert!(!registry.contains("T-due"));
        assert!(registry.contains("T-later"));
    }

    #[test]
    fn expired_entry_cannot_be_completed() {
        let registry = registry();
        let listener = CountingListener::new();
        registry
            .register("T-1", Duration::ZERO, listener.clone())
            .unwrap();

        assert_eq!(registry.expire_due(Instant::now() + Duration::from_millis(1)), 1);
        assert!(!registry.complete("T-1", response("T-1")));
        assert_eq!(listener.total(), 1);
    }

    #[test]
    fn drain_all_returns_everything_and_empties() {
        let registry = registry();
        let listener = CountingListener::new();
        for id in ["T-1", "T-2", "T-3"] {
            registry
                .register(id, Duration::from_secs(1), listener.clone())
                .unwrap();
        }

        let drained = registry.drain_all();
        assert_eq!(drained.len(), 3);
        assert!(registry.is_empty());
        // Draining claims but does not deliver; the closing channel does.
        assert_eq!(listener.total(), 0);
    }

    #[test]
    fn remove_rolls_back_silently() {
        let registry = registry();
        let listener = CountingListener::new();
        registry
            .register("T-1", Duration::from_secs(1), listener.clone())
            .unwrap();

        assert!(registry.remove("T-1"));
        assert!(!registry.remove("T-1"));
        assert_eq!(listener.total(), 0);
    }

    #[test]
    fn next_deadline_is_the_minimum() {
        let registry = registry();
        let listener = CountingListener::new();
        assert!(registry.next_deadline().is_none());

        registry
            .register("T-slow", Duration::from_secs(60), listener.clone())
            .unwrap();
        registry
            .register("T-fast", Duration::from_secs(1), listener.clone())
            .unwrap();

        let deadline = registry.next_deadline().unwrap();
        assert!(deadline <= Instant::now() + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_expires_at_deadline_granularity() {
        let reaper = Reaper::new(Duration::from_millis(250));
        let registry = Arc::new(PendingRequestRegistry::new(
            TicketKind::Cashout,
            reaper.wake_handle(),
        ));
        reaper.attach(Arc::clone(&registry));
        reaper.start();

        let listener = CountingListener::new();
        registry
            .register("T-1", Duration::from_millis(100), listener.clone())
            .unwrap();

        // Just before the deadline nothing has fired.
        tokio::time::sleep(Duration::from_millis(95)).await;
        assert_eq!(listener.total(), 0);

        // Shortly after, the deadline-driven sweep has claimed it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(listener.timeouts.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());

        assert!(reaper.close(Duration::from_secs(1)).await);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Whatever mix of replies and expiry hits the table, every id
            // fires exactly once.
            #[test]
            fn every_entry_fires_exactly_once(complete_mask in proptest::collection::vec(any::<bool>(), 1..32)) {
                let registry = registry();
                let listener = CountingListener::new();

                for (i, _) in complete_mask.iter().enumerate() {
                    registry
                        .register(&format!("T-{i}"), Duration::ZERO, listener.clone())
                        .unwrap();
                }

                let mut completed = 0;
                for (i, complete) in complete_mask.iter().enumerate() {
                    if *complete {
                        let id = format!("T-{i}");
                        prop_assert!(registry.complete(&id, response(&id)));
                        completed += 1;
                    }
                }

                let expired = registry.expire_due(Instant::now() + Duration::from_millis(1));
                prop_assert_eq!(completed + expired, complete_mask.len());
                prop_assert_eq!(listener.total(), complete_mask.len());
                prop_assert!(registry.is_empty());

                // Late arrivals on resolved ids are all stale.
                for (i, _) in complete_mask.iter().enumerate() {
                    let id = format!("T-{i}");
                    prop_assert!(!registry.complete(&id, response(&id)));
                }
                prop_assert_eq!(listener.total(), complete_mask.len());
            }
        }
    }
}
