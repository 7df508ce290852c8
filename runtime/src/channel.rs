//! Generic per-kind delivery channel.
//!
//! One [`TicketChannel`] per ticket kind, all running the same code path:
//! the kind only selects a [`ChannelSettings`] record (destinations and
//! timeout class) and a listener. Sending encodes the request, registers it
//! under its ticket id, and publishes; the channel's supervised consume loop
//! decodes replies and resolves the registry. The reply itself is delivered
//! through the channel's [`ResponseListener`], never through `send`'s return
//! value.

use futures::StreamExt;
use std::sync::{Arc, Mutex};
use ticketgate_core::codec::Codec;
use ticketgate_core::message::{ResponseListener, TicketKind, TicketOutcome, TicketRequest};
use ticketgate_core::transport::{Transport, TransportMessage};

use crate::config::ChannelSettings;
use crate::error::{ChannelError, SendError};
use crate::registry::PendingRequestRegistry;
use crate::worker::{RecoverableWorker, StopSignal, TaskFactory, WorkerError};

/// Lifecycle of a channel or gate: guarded transitions, no reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Created but not yet opened.
    Closed,
    /// Accepting sends; consume loop supervised.
    Open,
    /// Shut down for good.
    Terminated,
}

/// Send/receive wiring for one ticket kind.
pub struct TicketChannel {
    kind: TicketKind,
    settings: ChannelSettings,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    registry: Arc<PendingRequestRegistry>,
    worker: RecoverableWorker,
    lifecycle: Mutex<Lifecycle>,
    listener: Mutex<Option<Arc<dyn ResponseListener>>>,
}

impl TicketChannel {
    /// Create a closed channel.
    ///
    /// The registry partition is created by the caller (the gate) so it can
    /// be attached to the shared reaper before the first send.
    #[must_use]
    pub fn new(
        kind: TicketKind,
        settings: ChannelSettings,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        registry: Arc<PendingRequestRegistry>,
        worker_grace: std::time::Duration,
    ) -> Self {
        Self {
            kind,
            settings,
            transport,
            codec,
            registry,
            worker: RecoverableWorker::new(format!("{kind}-consumer"), worker_grace),
            lifecycle: Mutex::new(Lifecycle::Closed),
            listener: Mutex::new(None),
        }
    }

    /// The channel's kind.
    #[must_use]
    pub const fn kind(&self) -> TicketKind {
        self.kind
    }

    /// Replace the response listener. Only permitted while Closed; replacing
    /// a listener on a live channel would race in-flight completions.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ListenerReplaceWhileOpen`] when the channel
    /// has already been opened.
    pub fn set_listener(&self, listener: Arc<dyn ResponseListener>) -> Result<(), ChannelError> {
        let lifecycle = self.lock_lifecycle();
        if *lifecycle != Lifecycle::Closed {
            return Err(ChannelError::ListenerReplaceWhileOpen(self.kind));
        }
        *self
            .listener
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(listener);
        Ok(())
    }

    /// Open the channel: transition Closed→Open and start the supervised
    /// consume loop on the reply destination. Idempotent while Open.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Reopened`] after a close; there is no reopen path.
    /// - [`ChannelError::ListenerMissing`] when no listener is set: without
    ///   one, outcomes would be silently lost.
    pub fn open(&self) -> Result<(), ChannelError> {
        {
            let mut lifecycle = self.lock_lifecycle();
            match *lifecycle {
                Lifecycle::Open => return Ok(()),
                Lifecycle::Terminated => return Err(ChannelError::Reopened(self.kind)),
                Lifecycle::Closed => {}
            }
            if self
                .listener
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .is_none()
            {
                return Err(ChannelError::ListenerMissing(self.kind));
            }
            *lifecycle = Lifecycle::Open;
        }

        self.worker.open(self.consume_loop_factory());
        tracing::info!(
            kind = %self.kind,
            request_destination = %self.settings.request_destination,
            reply_destination = %self.settings.reply_destination,
            "Channel opened"
        );
        Ok(())
    }

    /// Close the channel: stop the worker, then deliver a Closed outcome to
    /// every still-pending request before returning. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ForcedStop`] when the consume loop had to be
    /// cancelled after the grace period. The channel is fully closed either
    /// way; the error exists for shutdown aggregation.
    pub async fn close(&self) -> Result<(), ChannelError> {
        {
            let mut lifecycle = self.lock_lifecycle();
            if *lifecycle == Lifecycle::Terminated {
                return Ok(());
            }
            // Reject new sends before the drain so nothing can slip in
            // after its Closed outcome would have been delivered.
            *lifecycle = Lifecycle::Terminated;
        }

        let natural = self.worker.close().await;

        let drained = self.registry.drain_all();
        let drained_count = drained.len();
        for entry in drained {
            metrics::counter!("gate.requests.closed", "kind" => self.kind.as_str()).increment(1);
            entry
                .listener
                .on_outcome(entry.kind, &entry.correlation_id, TicketOutcome::Closed);
        }

        tracing::info!(
            kind = %self.kind,
            drained = drained_count,
            forced = !natural,
            "Channel closed"
        );

        if natural {
            Ok(())
        } else {
            Err(ChannelError::ForcedStop(format!("{}-consumer", self.kind)))
        }
    }

    /// Send a request: encode, register under its ticket id, publish.
    ///
    /// Near-synchronous: returns once the broker acknowledged the publish.
    /// The reply (or Timeout/Closed) arrives later through the listener.
    ///
    /// # Errors
    ///
    /// - [`SendError::Closed`] when the channel is not Open (nothing is
    ///   published), or when a concurrent close caught the request before
    ///   a reply could be waited for (the registration is rolled back).
    /// - [`SendError::KindMismatch`] when the request belongs to another
    ///   channel.
    /// - [`SendError::Encode`] when the codec rejects the request.
    /// - [`SendError::DuplicateCorrelation`] when the ticket id is already
    ///   in flight.
    /// - [`SendError::Transport`] when the publish fails; the registration
    ///   is rolled back and no reply will be waited for.
    pub async fn send(&self, request: TicketRequest) -> Result<(), SendError> {
        if request.kind() != self.kind {
            return Err(SendError::KindMismatch {
                expected: self.kind,
                actual: request.kind(),
            });
        }
        if *self.lock_lifecycle() != Lifecycle::Open {
            return Err(SendError::Closed);
        }
        let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
        else {
            return Err(SendError::Closed);
        };

        let body = self.codec.encode(&request)?;
        let correlation_id = request.ticket_id().to_string();
        let timeout = self.settings.timeout_for(request.is_live());

        self.registry.register(&correlation_id, timeout, listener)?;

        let message = TransportMessage {
            body,
            correlation_id: correlation_id.clone(),
            reply_to: Some(self.settings.reply_destination.clone()),
        };

        if let Err(error) = self
            .transport
            .publish(&self.settings.request_destination, &message)
            .await
        {
            self.registry.remove(&correlation_id);
            metrics::counter!("gate.publish.failures", "kind" => self.kind.as_str()).increment(1);
            tracing::error!(
                kind = %self.kind,
                correlation_id = %correlation_id,
                error = %error,
                "Publish failed; request rolled back"
            );
            return Err(SendError::Transport(error));
        }

        // A close may have run between the lifecycle check above and the
        // registration: its drain would then miss this entry, and with the
        // reaper gone it would never receive an outcome. Re-checking here
        // closes that window. Either the drain claimed the entry (and
        // delivered Closed) or the rollback below does; never both, the
        // claim is atomic.
        if *self.lock_lifecycle() != Lifecycle::Open {
            self.registry.remove(&correlation_id);
            return Err(SendError::Closed);
        }

        metrics::counter!("gate.requests.sent", "kind" => self.kind.as_str()).increment(1);
        tracing::debug!(
            kind = %self.kind,
            correlation_id = %correlation_id,
            timeout_ms = timeout.as_millis(),
            "Request published"
        );
        Ok(())
    }

    /// Whether the channel is Open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.lock_lifecycle() == Lifecycle::Open
    }

    /// Consume-loop spawn count (respawns included).
    #[must_use]
    pub fn worker_generation(&self) -> u64 {
        self.worker.generation()
    }

    /// Number of requests currently awaiting a reply.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.registry.len()
    }

    /// Whether `ticket_id` is currently awaiting a reply.
    #[must_use]
    pub fn is_pending(&self, ticket_id: &str) -> bool {
        self.registry.contains(ticket_id)
    }

    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn consume_loop_factory(&self) -> TaskFactory {
        let kind = self.kind;
        let transport = Arc::clone(&self.transport);
        let codec = Arc::clone(&self.codec);
        let registry = Arc::clone(&self.registry);
        let destination = self.settings.reply_destination.clone();

        Arc::new(move |stop: StopSignal| {
            let transport = Arc::clone(&transport);
            let codec = Arc::clone(&codec);
            let registry = Arc::clone(&registry);
            let destination = destination.clone();
            Box::pin(async move {
                consume_loop(kind, &*transport, &*codec, &registry, &destination, &stop).await
            })
        })
    }
}

/// One execution of a channel's consume loop. Subscribes, then decodes and
/// resolves replies until stopped. An `Err` return means abnormal
/// termination and triggers a respawn (with a fresh subscription).
async fn consume_loop(
    kind: TicketKind,
    transport: &dyn Transport,
    codec: &dyn Codec,
    registry: &PendingRequestRegistry,
    destination: &str,
    stop: &StopSignal,
) -> Result<(), WorkerError> {
    // Raced against the stop signal: a broker that never answers the
    // subscribe must not hold up close for the whole grace period.
    let mut stream = tokio::select! {
        () = stop.stopped() => return Ok(()),
        subscribed = transport.subscribe(destination) => {
            subscribed.map_err(WorkerError::Transport)?
        }
    };
    tracing::debug!(kind = %kind, destination = destination, "Consume loop subscribed");

    loop {
        tokio::select! {
            () = stop.stopped() => return Ok(()),
            item = stream.next() => match item {
                Some(Ok(message)) => handle_reply(kind, codec, registry, &message),
                Some(Err(error)) => return Err(WorkerError::Transport(error)),
                None => return Err(WorkerError::StreamEnded),
            },
        }
    }
}

fn handle_reply(
    kind: TicketKind,
    codec: &dyn Codec,
    registry: &PendingRequestRegistry,
    message: &TransportMessage,
) {
    match codec.decode(&message.body) {
        Ok(response) => {
            // Correlation by ticket id; the envelope's correlation id is
            // advisory and may be absent on foreign brokers.
            let correlation_id = response.ticket_id.clone();
            registry.complete(&correlation_id, response);
        }
        Err(error) => {
            // Dropped, not completed: the pending request stays eligible
            // for the reaper's Timeout.
            metrics::counter!("gate.replies.undecodable", "kind" => kind.as_str()).increment(1);
            tracing::warn!(
                kind = %kind,
                correlation_id = %message.correlation_id,
                error = %error,
                "Malformed reply dropped"
            );
        }
    }
}
