//! Redpanda transport implementation for ticketgate.
//!
//! This crate provides a production [`Transport`] over rdkafka: requests are
//! published to per-kind request topics and replies are consumed from the
//! matching reply topics.
//!
//! # Delivery semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Offsets are committed AFTER successful delivery to the subscriber's
//!   channel; a crash before commit redelivers the message.
//! - The delivery runtime tolerates duplicates: replies whose correlation id
//!   has already been resolved are dropped as stale.
//! - Ordering is guaranteed within a partition; messages are keyed by
//!   correlation id, so request and retry land on the same partition.
//!
//! # Envelope mapping
//!
//! [`TransportMessage`] maps onto a Kafka record as:
//! - `body` → record payload
//! - `correlation_id` → record key and a `correlation-id` header
//! - `reply_to` → a `reply-to` header, when present
//!
//! # Example
//!
//! ```no_run
//! use ticketgate_redpanda::RedpandaTransport;
//! use ticketgate_core::transport::{Transport, TransportMessage};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = RedpandaTransport::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("bookmaker-42")
//!     .build()?;
//!
//! transport
//!     .publish(
//!         "ticket",
//!         &TransportMessage {
//!             body: vec![1, 2, 3],
//!             correlation_id: "T-1".to_string(),
//!             reply_to: Some("ticket.confirm".to_string()),
//!         },
//!     )
//!     .await?;
//!
//! let mut replies = transport.subscribe("ticket.confirm").await?;
//! while let Some(result) = replies.next().await {
//!     match result {
//!         Ok(message) => println!("reply for {}", message.correlation_id),
//!         Err(e) => eprintln!("receive error: {e}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use ticketgate_core::transport::{MessageStream, Transport, TransportError, TransportMessage};

const CORRELATION_HEADER: &str = "correlation-id";
const REPLY_TO_HEADER: &str = "reply-to";

/// Redpanda-backed [`Transport`].
///
/// One instance serves every channel: the producer is shared, and each
/// `subscribe` call creates its own consumer so reply topics are consumed
/// independently.
///
/// # Configuration
///
/// - **Broker addresses**: bootstrap servers (required)
/// - **Producer settings**: acks, compression, send timeout
/// - **Consumer group**: explicit id, or auto-generated per destination
/// - **Buffer size**: per-subscription message buffer (default: 1000)
/// - **Offset reset**: where new groups start reading (default: "latest")
pub struct RedpandaTransport {
    /// Shared producer for publishing requests.
    producer: FutureProducer,
    /// Broker addresses (for creating consumers).
    brokers: String,
    /// Producer send timeout.
    timeout: Duration,
    /// Consumer group id (if explicitly set).
    consumer_group: Option<String>,
    /// Message buffer size per subscription.
    buffer_size: usize,
    /// Auto offset reset policy.
    auto_offset_reset: String,
}

impl RedpandaTransport {
    /// Create a transport with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] when the producer
    /// cannot be created from the given broker list.
    pub fn new(brokers: &str) -> Result<Self, TransportError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the transport.
    #[must_use]
    pub fn builder() -> RedpandaTransportBuilder {
        RedpandaTransportBuilder::default()
    }

    /// The configured broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for configuring a [`RedpandaTransport`].
#[derive(Default)]
pub struct RedpandaTransportBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaTransportBuilder {
    /// Set the broker addresses (comma-separated, e.g. "localhost:9092").
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "1".
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none".
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group id for subscriptions.
    ///
    /// If not set, each subscription gets a group derived from its
    /// destination. Every running instance of the same bookmaker client
    /// should use the same explicit group so replies are load-balanced
    /// rather than duplicated.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set the per-subscription message buffer size.
    ///
    /// Default: 1000.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_size` is 0.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be greater than 0");
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Set the auto offset reset policy for new consumer groups:
    /// "earliest", "latest" or "error".
    ///
    /// Default: "latest". Reply topics should almost always use "latest";
    /// replaying historical replies would only produce stale drops.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaTransport`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] when brokers are not
    /// set or the producer cannot be created.
    pub fn build(self) -> Result<RedpandaTransport, TransportError> {
        let brokers = self
            .brokers
            .ok_or_else(|| TransportError::ConnectionFailed("Brokers not configured".to_string()))?;

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", self.producer_acks.as_deref().unwrap_or("1"))
            .set(
                "compression.type",
                self.compression.as_deref().unwrap_or("none"),
            );

        let producer: FutureProducer = producer_config.create().map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to create producer: {e}"))
        })?;

        tracing::info!(
            brokers = %brokers,
            acks = self.producer_acks.as_deref().unwrap_or("1"),
            compression = self.compression.as_deref().unwrap_or("none"),
            buffer_size = self.buffer_size.unwrap_or(1000),
            auto_offset_reset = self.auto_offset_reset.as_deref().unwrap_or("latest"),
            "RedpandaTransport created"
        );

        Ok(RedpandaTransport {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            consumer_group: self.consumer_group,
            buffer_size: self.buffer_size.unwrap_or(1000),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "latest".to_string()),
        })
    }
}

/// Rebuild a [`TransportMessage`] from a consumed Kafka record.
///
/// The correlation id is taken from the `correlation-id` header, falling
/// back to the record key. Records with neither are undeliverable and are
/// reported as receive failures.
fn message_from_record<M: Message>(record: &M) -> Result<TransportMessage, TransportError> {
    let body = record
        .payload()
        .ok_or_else(|| TransportError::ReceiveFailed("Message has no payload".to_string()))?
        .to_vec();

    let header = |name: &str| {
        record.headers().and_then(|headers| {
            headers
                .iter()
                .find(|h| h.key == name)
                .and_then(|h| h.value)
                .map(|v| String::from_utf8_lossy(v).into_owned())
        })
    };

    let correlation_id = header(CORRELATION_HEADER)
        .or_else(|| {
            record
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned())
        })
        .ok_or_else(|| {
            TransportError::ReceiveFailed("Message has no correlation id".to_string())
        })?;

    Ok(TransportMessage {
        body,
        correlation_id,
        reply_to: header(REPLY_TO_HEADER),
    })
}

impl Transport for RedpandaTransport {
    fn publish(
        &self,
        destination: &str,
        message: &TransportMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let destination = destination.to_string();
        let message = message.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let mut headers = OwnedHeaders::new().insert(Header {
                key: CORRELATION_HEADER,
                value: Some(message.correlation_id.as_bytes()),
            });
            if let Some(reply_to) = &message.reply_to {
                headers = headers.insert(Header {
                    key: REPLY_TO_HEADER,
                    value: Some(reply_to.as_bytes()),
                });
            }

            // Keyed by correlation id so retries of the same ticket stay on
            // one partition and keep their order.
            let record = FutureRecord::to(&destination)
                .payload(&message.body)
                .key(message.correlation_id.as_bytes())
                .headers(headers);

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        destination = %destination,
                        partition = partition,
                        offset = offset,
                        correlation_id = %message.correlation_id,
                        "Message published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(
                        destination = %destination,
                        error = %kafka_error,
                        "Failed to publish message"
                    );
                    Err(TransportError::PublishFailed {
                        destination,
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        destination: &str,
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, TransportError>> + Send + '_>> {
        let destination = destination.to_string();
        let brokers = self.brokers.clone();
        let consumer_group = self.consumer_group.clone();
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            let consumer_group_id =
                consumer_group.unwrap_or_else(|| format!("ticketgate-{destination}"));

            // Manual commit for at-least-once delivery.
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &consumer_group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| TransportError::SubscriptionFailed {
                    destination: destination.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            consumer
                .subscribe(&[destination.as_str()])
                .map_err(|e| TransportError::SubscriptionFailed {
                    destination: destination.clone(),
                    reason: format!("Failed to subscribe: {e}"),
                })?;

            tracing::info!(
                destination = %destination,
                consumer_group = %consumer_group_id,
                buffer_size = buffer_size,
                auto_offset_reset = %auto_offset_reset,
                "Subscribed to destination"
            );

            let (tx, rx) = tokio::sync::mpsc::channel(buffer_size);

            // The spawned task owns the consumer; dropping the returned
            // stream drops the receiver, which ends the task and the
            // subscription with it.
            tokio::spawn(async move {
                use futures::StreamExt;
                use rdkafka::consumer::CommitMode;

                let mut stream = consumer.stream();

                while let Some(record_result) = stream.next().await {
                    match record_result {
                        Ok(record) => {
                            let message_result = message_from_record(&record);

                            // Commit only AFTER successful send to the
                            // channel; a crash before commit redelivers.
                            if tx.send(message_result).await.is_err() {
                                tracing::debug!("Subscriber dropped, exiting consumer task");
                                break;
                            }

                            if let Err(e) = consumer.commit_message(&record, CommitMode::Async) {
                                tracing::warn!(
                                    destination = record.topic(),
                                    partition = record.partition(),
                                    offset = record.offset(),
                                    error = %e,
                                    "Failed to commit offset (message may be redelivered)"
                                );
                            }
                        }
                        Err(e) => {
                            let err = TransportError::ReceiveFailed(format!(
                                "Failed to receive message: {e}"
                            ));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                        }
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as MessageStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redpanda_transport_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaTransport>();
        assert_sync::<RedpandaTransport>();
    }

    #[test]
    fn builder_default_works() {
        let _builder = RedpandaTransport::builder();
    }

    #[test]
    fn build_without_brokers_fails() {
        let result = RedpandaTransport::builder().build();
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
