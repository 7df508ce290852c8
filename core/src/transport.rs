//! Transport abstraction over the asynchronous message broker.
//!
//! The delivery runtime never talks to a broker directly; it publishes and
//! consumes [`TransportMessage`] envelopes through the [`Transport`] trait.
//! The envelope carries opaque encoded bytes plus the correlation id and an
//! optional reply-to destination; it never holds decoded domain data.
//!
//! # Implementations
//!
//! - `RedpandaTransport` (ticketgate-redpanda): production, Kafka-compatible
//! - `InMemoryTransport` (ticketgate-testing): in-process, for tests
//!
//! # Delivery semantics
//!
//! Implementations provide at-least-once delivery. The delivery runtime is
//! tolerant of duplicates: a reply whose correlation id has already been
//! resolved is dropped as stale.

use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Failed to connect to the broker.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a destination.
    #[error("Publish failed for destination '{destination}': {reason}")]
    PublishFailed {
        /// The destination that failed.
        destination: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to subscribe to a destination.
    #[error("Subscription failed for destination '{destination}': {reason}")]
    SubscriptionFailed {
        /// The destination that failed to subscribe.
        destination: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failure while receiving from an established subscription.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// The wire envelope moved through a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    /// Opaque encoded message bytes.
    pub body: Vec<u8>,
    /// Correlation id routing the eventual reply back to its request.
    pub correlation_id: String,
    /// Destination the reply should be published to, when the protocol
    /// routes by explicit reply-to rather than a fixed reply destination.
    pub reply_to: Option<String>,
}

/// Stream of messages from a subscription.
///
/// Each item is a `Result`: transport-level receive failures are surfaced
/// in-band so the consumer task can decide to resubscribe.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<TransportMessage, TransportError>> + Send>>;

/// Publish/subscribe capability over the message broker.
///
/// # Dyn Compatibility
///
/// Methods return explicit `Pin<Box<dyn Future>>` instead of `async fn` so
/// the runtime can hold the transport as `Arc<dyn Transport>` and share it
/// across all seven channels.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; a single transport instance is
/// used concurrently by every channel's sender and consumer task.
pub trait Transport: Send + Sync {
    /// Publish a message to a destination, awaiting broker acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PublishFailed`] if the broker does not
    /// acknowledge the publish.
    fn publish(
        &self,
        destination: &str,
        message: &TransportMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// Subscribe to a destination and receive a stream of messages.
    ///
    /// Dropping the returned stream cancels the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SubscriptionFailed`] if the subscription
    /// cannot be established.
    fn subscribe(
        &self,
        destination: &str,
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, TransportError>> + Send + '_>>;
}
