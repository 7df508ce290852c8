//! In-process transport fake built on tokio broadcast channels.

use async_stream::stream;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use ticketgate_core::transport::{MessageStream, Transport, TransportError, TransportMessage};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

type Delivery = Result<TransportMessage, TransportError>;

/// In-memory [`Transport`] for tests.
///
/// Every destination is a broadcast channel. Published messages are recorded
/// for assertions and forwarded to any live subscribers. Tests play the role
/// of the exchange by calling [`deliver`](Self::deliver) on a reply
/// destination, and can inject failures on both the publish and receive
/// paths.
#[derive(Default)]
pub struct InMemoryTransport {
    destinations: Mutex<HashMap<String, broadcast::Sender<Delivery>>>,
    published: Mutex<Vec<(String, TransportMessage)>>,
    fail_publishes: AtomicBool,
}

impl InMemoryTransport {
    /// Create an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, destination: &str) -> broadcast::Sender<Delivery> {
        let mut destinations = self
            .destinations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        destinations
            .entry(destination.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Everything published so far, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, TransportMessage)> {
        self.published
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Messages published to one destination, in publish order.
    #[must_use]
    pub fn published_to(&self, destination: &str) -> Vec<TransportMessage> {
        self.published()
            .into_iter()
            .filter_map(|(dest, msg)| (dest == destination).then_some(msg))
            .collect()
    }

    /// Make every subsequent publish fail with
    /// [`TransportError::PublishFailed`].
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::Release);
    }

    /// Play the exchange: push a broker-originated message to the
    /// subscribers of `destination`. Returns the number of subscribers that
    /// received it.
    pub fn deliver(&self, destination: &str, message: TransportMessage) -> usize {
        self.sender_for(destination).send(Ok(message)).unwrap_or(0)
    }

    /// Inject a receive failure into the subscribers of `destination`,
    /// as if the broker connection broke mid-stream.
    pub fn inject_receive_error(&self, destination: &str, reason: &str) {
        let _ = self
            .sender_for(destination)
            .send(Err(TransportError::ReceiveFailed(reason.to_string())));
    }

    /// Number of live subscriptions on `destination`.
    #[must_use]
    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.sender_for(destination).receiver_count()
    }
}

impl Transport for InMemoryTransport {
    fn publish(
        &self,
        destination: &str,
        message: &TransportMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let destination = destination.to_string();
        let message = message.clone();

        Box::pin(async move {
            if self.fail_publishes.load(Ordering::Acquire) {
                return Err(TransportError::PublishFailed {
                    destination,
                    reason: "injected publish failure".to_string(),
                });
            }

            self.published
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push((destination.clone(), message.clone()));

            // No subscriber on the request destination is fine; the fake
            // exchange reads `published` instead.
            let _ = self.sender_for(&destination).send(Ok(message));
            Ok(())
        })
    }

    fn subscribe(
        &self,
        destination: &str,
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, TransportError>> + Send + '_>> {
        let mut rx = self.sender_for(destination).subscribe();

        Box::pin(async move {
            let stream = stream! {
                loop {
                    match rx.recv().await {
                        Ok(item) => yield item,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            yield Err(TransportError::ReceiveFailed(format!(
                                "subscriber lagged, {skipped} messages skipped"
                            )));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            };

            Ok(Box::pin(stream) as MessageStream)
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Test code can use unwrap

    use super::*;
    use futures::StreamExt;

    fn message(id: &str) -> TransportMessage {
        TransportMessage {
            body: vec![1, 2, 3],
            correlation_id: id.to_string(),
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn publish_is_recorded_and_forwarded() {
        let transport = InMemoryTransport::new();
        let mut stream = transport.subscribe("dest").await.unwrap();

        transport.publish("dest", &message("a")).await.unwrap();

        assert_eq!(transport.published_to("dest").len(), 1);
        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received.correlation_id, "a");
    }

    #[tokio::test]
    async fn injected_publish_failure_publishes_nothing() {
        let transport = InMemoryTransport::new();
        transport.fail_publishes(true);

        let result = transport.publish("dest", &message("a")).await;
        assert!(matches!(
            result,
            Err(TransportError::PublishFailed { .. })
        ));
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn injected_receive_error_reaches_subscriber() {
        let transport = InMemoryTransport::new();
        let mut stream = transport.subscribe("dest").await.unwrap();

        transport.inject_receive_error("dest", "boom");

        assert!(matches!(
            stream.next().await,
            Some(Err(TransportError::ReceiveFailed(_)))
        ));
    }
}
