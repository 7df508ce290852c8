//! Channel lifecycle coordinator.
//!
//! [`TicketGate`] owns the shared transport, codec and reaper, and every
//! channel created from them. Channels are built and opened lazily, the
//! first time their kind is requested; `close()` tears everything down in
//! dependency order (channels first, then the shared reaper), attempting
//! every release unconditionally and reporting collected failures as one
//! non-fatal aggregate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use ticketgate_core::codec::Codec;
use ticketgate_core::message::{ResponseListener, TicketKind, TicketRequest};
use ticketgate_core::transport::Transport;

use crate::channel::{Lifecycle, TicketChannel};
use crate::config::GateConfig;
use crate::error::{ChannelError, CloseError, CloseFailure, GateError};
use crate::registry::{PendingRequestRegistry, Reaper};

/// Coordinator for all seven delivery channels and their shared resources.
///
/// State machine: Closed → Open (via [`open`](Self::open)) → Terminated
/// (via [`close`](Self::close)); there is no reopen transition.
pub struct TicketGate {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    config: GateConfig,
    lifecycle: Mutex<Lifecycle>,
    channels: Mutex<HashMap<TicketKind, Arc<TicketChannel>>>,
    listeners: Mutex<HashMap<TicketKind, Arc<dyn ResponseListener>>>,
    reaper: Reaper,
}

impl TicketGate {
    /// Create a closed gate over a transport and codec.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, codec: Arc<dyn Codec>, config: GateConfig) -> Self {
        let reaper = Reaper::new(config.reaper_max_interval());
        Self {
            transport,
            codec,
            config,
            lifecycle: Mutex::new(Lifecycle::Closed),
            channels: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            reaper,
        }
    }

    /// Stage the listener a kind's channel will be built with.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::ListenerWhileOpen`] once the kind's channel
    /// exists; listeners cannot be swapped under a live channel.
    pub fn set_listener(
        &self,
        kind: TicketKind,
        listener: Arc<dyn ResponseListener>,
    ) -> Result<(), GateError> {
        if self.lock_channels().contains_key(&kind) {
            return Err(GateError::ListenerWhileOpen(kind));
        }
        self.lock_listeners().insert(kind, listener);
        Ok(())
    }

    /// Open the gate: set up shared resources (the reaper). Channels open
    /// lazily on first use. Idempotent while Open.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Reopened`] after a close.
    pub fn open(&self) -> Result<(), GateError> {
        {
            let mut lifecycle = self.lock_lifecycle();
            match *lifecycle {
                Lifecycle::Open => return Ok(()),
                Lifecycle::Terminated => return Err(GateError::Reopened),
                Lifecycle::Closed => {}
            }
            *lifecycle = Lifecycle::Open;
        }
        self.reaper.start();
        tracing::info!("Gate opened");
        Ok(())
    }

    /// Whether the gate is Open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.lock_lifecycle() == Lifecycle::Open
    }

    /// The channel for `kind`, built and opened on first request.
    ///
    /// # Errors
    ///
    /// - [`GateError::NotOpen`] when the gate is not Open.
    /// - [`GateError::UnconfiguredKind`] when no settings exist for `kind`.
    /// - [`GateError::Channel`] when the lazy open fails (typically a
    ///   missing listener).
    pub fn channel(&self, kind: TicketKind) -> Result<Arc<TicketChannel>, GateError> {
        let mut channels = self.lock_channels();

        // Checked while holding the channels lock: a concurrent close sets
        // Terminated before it drains the map, and the drain needs this
        // lock, so a channel built here is either refused or still seen
        // and torn down by that close.
        if *self.lock_lifecycle() != Lifecycle::Open {
            return Err(GateError::NotOpen);
        }

        if let Some(channel) = channels.get(&kind) {
            return Ok(Arc::clone(channel));
        }

        let settings = self
            .config
            .channel(kind)
            .ok_or(GateError::UnconfiguredKind(kind))?
            .clone();

        let registry = Arc::new(PendingRequestRegistry::new(kind, self.reaper.wake_handle()));
        self.reaper.attach(Arc::clone(&registry));

        let channel = Arc::new(TicketChannel::new(
            kind,
            settings,
            Arc::clone(&self.transport),
            Arc::clone(&self.codec),
            registry,
            self.config.worker_grace(),
        ));

        if let Some(listener) = self.lock_listeners().get(&kind) {
            channel.set_listener(Arc::clone(listener))?;
        }
        channel.open()?;

        channels.insert(kind, Arc::clone(&channel));
        tracing::info!(kind = %kind, "Channel created lazily");
        Ok(channel)
    }

    /// Route a request to its kind's channel, opening it if needed.
    ///
    /// # Errors
    ///
    /// Gate-level failures ([`GateError::NotOpen`],
    /// [`GateError::UnconfiguredKind`]) or the channel's
    /// [`SendError`](crate::error::SendError).
    pub async fn send(&self, request: TicketRequest) -> Result<(), GateError> {
        let channel = self.channel(request.kind())?;
        channel.send(request).await?;
        Ok(())
    }

    /// Close every channel and shared resource, collecting failures.
    ///
    /// Every channel close is attempted regardless of earlier failures;
    /// afterwards the shared reaper is stopped with a bounded grace period,
    /// escalating to cancellation. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the aggregate [`CloseError`] when any step failed. The gate
    /// is fully closed either way.
    pub async fn close(&self) -> Result<(), CloseError> {
        {
            let mut lifecycle = self.lock_lifecycle();
            if *lifecycle == Lifecycle::Terminated {
                return Ok(());
            }
            *lifecycle = Lifecycle::Terminated;
        }

        let channels: Vec<(TicketKind, Arc<TicketChannel>)> =
            self.lock_channels().drain().collect();

        let mut failures = Vec::new();
        for (kind, channel) in channels {
            if let Err(error) = channel.close().await {
                tracing::error!(kind = %kind, error = %error, "Channel close failed");
                failures.push(CloseFailure {
                    component: format!("channel:{kind}"),
                    error,
                });
            }
        }

        if !self.reaper.close(self.config.worker_grace()).await {
            failures.push(CloseFailure {
                component: "reaper".to_string(),
                error: ChannelError::ForcedStop("reaper".to_string()),
            });
        }

        if failures.is_empty() {
            tracing::info!("Gate closed");
            Ok(())
        } else {
            tracing::warn!(failures = failures.len(), "Gate closed with failures");
            Err(CloseError { failures })
        }
    }

    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_channels(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<TicketKind, Arc<TicketChannel>>> {
        self.channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_listeners(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<TicketKind, Arc<dyn ResponseListener>>> {
        self.listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
