//! Configuration records for channels and the gate.
//!
//! Loading these values from files or the environment is the embedding
//! application's job; the runtime only consumes the records.

use std::collections::HashMap;
use std::time::Duration;
use ticketgate_core::message::TicketKind;

const DEFAULT_WORKER_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_REAPER_MAX_INTERVAL: Duration = Duration::from_millis(250);

/// Per-kind channel configuration.
///
/// One record per ticket kind: where requests go, where replies come from,
/// and how long to wait for a reply before the request times out.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Destination requests are published to.
    pub request_destination: String,
    /// Destination the channel's consume loop subscribes to for replies.
    pub reply_destination: String,
    /// Reply window for requests on this channel.
    pub response_timeout: Duration,
    /// Reply window for live ticket submissions, when the exchange grants
    /// live traffic a different window. Ignored on non-submission kinds.
    pub live_response_timeout: Option<Duration>,
}

impl ChannelSettings {
    /// Create settings with a single timeout class.
    pub fn new(
        request_destination: impl Into<String>,
        reply_destination: impl Into<String>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            request_destination: request_destination.into(),
            reply_destination: reply_destination.into(),
            response_timeout,
            live_response_timeout: None,
        }
    }

    /// Add a distinct window for live submissions.
    #[must_use]
    pub const fn with_live_timeout(mut self, timeout: Duration) -> Self {
        self.live_response_timeout = Some(timeout);
        self
    }

    /// The window that applies to one request.
    #[must_use]
    pub fn timeout_for(&self, live: bool) -> Duration {
        if live {
            self.live_response_timeout.unwrap_or(self.response_timeout)
        } else {
            self.response_timeout
        }
    }
}

/// Gate-wide configuration: the configured channels plus shared tuning.
#[derive(Debug, Clone)]
pub struct GateConfig {
    channels: HashMap<TicketKind, ChannelSettings>,
    worker_grace: Duration,
    reaper_max_interval: Duration,
}

impl GateConfig {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> GateConfigBuilder {
        GateConfigBuilder::default()
    }

    /// Settings for one kind, when configured.
    #[must_use]
    pub fn channel(&self, kind: TicketKind) -> Option<&ChannelSettings> {
        self.channels.get(&kind)
    }

    /// Grace period granted to background tasks during shutdown before
    /// they are forcibly cancelled.
    #[must_use]
    pub const fn worker_grace(&self) -> Duration {
        self.worker_grace
    }

    /// Upper bound on the reaper's sleep between sweeps. The reaper wakes
    /// earlier when a deadline is due or a new request is registered.
    #[must_use]
    pub const fn reaper_max_interval(&self) -> Duration {
        self.reaper_max_interval
    }
}

/// Builder for [`GateConfig`].
///
/// Only the kinds the embedding application actually uses need to be
/// configured; requesting an unconfigured kind fails at channel creation.
#[derive(Debug, Default)]
pub struct GateConfigBuilder {
    channels: HashMap<TicketKind, ChannelSettings>,
    worker_grace: Option<Duration>,
    reaper_max_interval: Option<Duration>,
}

impl GateConfigBuilder {
    /// Configure one kind's channel.
    #[must_use]
    pub fn channel(mut self, kind: TicketKind, settings: ChannelSettings) -> Self {
        self.channels.insert(kind, settings);
        self
    }

    /// Override the shutdown grace period (default: 5 s).
    #[must_use]
    pub const fn worker_grace(mut self, grace: Duration) -> Self {
        self.worker_grace = Some(grace);
        self
    }

    /// Override the reaper's maximum sweep interval (default: 250 ms).
    #[must_use]
    pub const fn reaper_max_interval(mut self, interval: Duration) -> Self {
        self.reaper_max_interval = Some(interval);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> GateConfig {
        GateConfig {
            channels: self.channels,
            worker_grace: self.worker_grace.unwrap_or(DEFAULT_WORKER_GRACE),
            reaper_max_interval: self
                .reaper_max_interval
                .unwrap_or(DEFAULT_REAPER_MAX_INTERVAL),
        }
    }
}
