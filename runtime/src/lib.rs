//! # Ticketgate Runtime
//!
//! The ticket-delivery runtime: turns domain requests into broker messages
//! and correlates the broker's asynchronous replies back to the originating
//! caller, under a per-request timeout.
//!
//! ## Core Components
//!
//! - [`PendingRequestRegistry`]: per-channel correlation table, the only
//!   structure shared between sender tasks, the consumer task and the reaper
//! - [`Reaper`]: deadline-driven sweep expiring pending requests
//! - [`RecoverableWorker`]: supervises a channel's consume loop and respawns
//!   it after abnormal termination
//! - [`TicketChannel`]: send/receive wiring for one ticket kind
//! - [`TicketGate`]: opens/closes all channels and shared resources in
//!   dependency order, aggregating teardown failures
//!
//! ## Example
//!
//! ```ignore
//! use ticketgate_runtime::{ChannelSettings, GateConfig, TicketGate};
//! use ticketgate_core::TicketKind;
//! use std::time::Duration;
//!
//! let config = GateConfig::builder()
//!     .channel(
//!         TicketKind::Submission,
//!         ChannelSettings::new("ticket.submit", "ticket.confirm", Duration::from_secs(15))
//!             .with_live_timeout(Duration::from_secs(17)),
//!     )
//!     .build();
//!
//! let gate = TicketGate::new(transport, codec, config);
//! gate.set_listener(TicketKind::Submission, listener)?;
//! gate.open()?;
//!
//! // Near-synchronous send: returns once the broker acknowledged the
//! // publish; the reply arrives later through the listener.
//! gate.send(ticket_request).await?;
//!
//! // Every still-pending request receives a Closed outcome before this
//! // returns.
//! gate.close().await?;
//! ```

/// Per-channel and gate-wide configuration records
pub mod config;

/// Pending-request correlation table and the deadline-driven reaper
pub mod registry;

/// Supervised consume-loop worker with respawn-on-failure
pub mod worker;

/// Generic per-kind delivery channel
pub mod channel;

/// Channel lifecycle coordinator
pub mod gate;

/// Error types for the delivery runtime
pub mod error {
    use thiserror::Error;
    use ticketgate_core::codec::CodecError;
    use ticketgate_core::message::TicketKind;
    use ticketgate_core::transport::TransportError;

    /// Registration attempted with a correlation id that is already pending.
    ///
    /// A protocol/programmer error: at most one request per ticket id may be
    /// in flight on a channel.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    #[error("Correlation id '{0}' is already pending")]
    pub struct DuplicateCorrelation(pub String);

    /// Errors surfaced synchronously to the caller of `send`.
    #[derive(Error, Debug)]
    pub enum SendError {
        /// The channel is not open (never opened, or already shut down).
        #[error("Channel is closed")]
        Closed,

        /// A request with the same ticket id is already in flight.
        #[error(transparent)]
        DuplicateCorrelation(#[from] DuplicateCorrelation),

        /// The request's kind does not match the channel's kind.
        #[error("Request kind '{actual}' does not match channel kind '{expected}'")]
        KindMismatch {
            /// The channel's kind.
            expected: TicketKind,
            /// The request's kind.
            actual: TicketKind,
        },

        /// The request could not be encoded into wire bytes.
        #[error("Encoding failed: {0}")]
        Encode(#[from] CodecError),

        /// The broker did not acknowledge the publish. The just-registered
        /// entry has already been removed; no reply will be waited for.
        #[error(transparent)]
        Transport(#[from] TransportError),
    }

    /// Errors from channel lifecycle operations.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum ChannelError {
        /// `open` was called without a response listener set.
        #[error("Channel '{0}' has no response listener; set one before opening")]
        ListenerMissing(TicketKind),

        /// `open` was called after the channel had been closed.
        #[error("Channel '{0}' cannot be reopened after close")]
        Reopened(TicketKind),

        /// `set_listener` was called on a live channel.
        #[error("Channel '{0}' is open; listeners can only be replaced while closed")]
        ListenerReplaceWhileOpen(TicketKind),

        /// A background task did not stop within the grace period and had
        /// to be cancelled. Reported for aggregation; teardown completed.
        #[error("Worker '{0}' did not stop within the grace period and was cancelled")]
        ForcedStop(String),
    }

    /// Errors from gate-level operations.
    #[derive(Error, Debug)]
    pub enum GateError {
        /// The gate is Closed or Terminated; `open()` it first.
        #[error("Gate is not open")]
        NotOpen,

        /// The gate was closed and cannot transition back to Open.
        #[error("Gate cannot be reopened after close")]
        Reopened,

        /// No [`ChannelSettings`](crate::config::ChannelSettings) were
        /// configured for the requested kind.
        #[error("No channel configured for kind '{0}'")]
        UnconfiguredKind(TicketKind),

        /// The kind's channel already exists; listeners can only be staged
        /// before first use.
        #[error("Channel for kind '{0}' already exists; set listeners before first use")]
        ListenerWhileOpen(TicketKind),

        /// A channel-level failure during lazy open.
        #[error(transparent)]
        Channel(#[from] ChannelError),

        /// A send-level failure, when routing through the gate.
        #[error(transparent)]
        Send(#[from] SendError),
    }

    /// One collected teardown failure.
    #[derive(Error, Debug)]
    #[error("{component}: {error}")]
    pub struct CloseFailure {
        /// The component that failed to close cleanly.
        pub component: String,
        /// The failure.
        pub error: ChannelError,
    }

    /// Aggregate of teardown failures.
    ///
    /// Every close is attempted regardless of earlier failures; this error
    /// reports what went wrong after all releases have been attempted. It is
    /// non-fatal: the gate is fully closed when it is returned.
    #[derive(Error, Debug)]
    #[error("Shutdown completed with {} failure(s)", failures.len())]
    pub struct CloseError {
        /// The collected failures, in teardown order.
        pub failures: Vec<CloseFailure>,
    }
}

pub use channel::{Lifecycle, TicketChannel};
pub use config::{ChannelSettings, GateConfig};
pub use error::{ChannelError, CloseError, GateError, SendError};
pub use gate::TicketGate;
pub use registry::{PendingRequest, PendingRequestRegistry, Reaper};
pub use worker::{RecoverableWorker, StopSignal, WorkerError};
