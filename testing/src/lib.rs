//! # Ticketgate Testing
//!
//! Testing utilities and in-process fakes for the ticketgate subsystem:
//!
//! - [`InMemoryTransport`]: a broadcast-channel broker with publish
//!   recording, publish failure injection, and receive error injection
//! - [`BincodeCodec`]: the in-workspace reference [`Codec`] implementation
//! - [`RecordingListener`]: captures every delivered outcome and lets a
//!   test await a target count
//!
//! ## Example
//!
//! ```ignore
//! use ticketgate_testing::{InMemoryTransport, BincodeCodec, RecordingListener};
//!
//! #[tokio::test]
//! async fn ticket_gets_a_reply() {
//!     let transport = Arc::new(InMemoryTransport::new());
//!     let listener = Arc::new(RecordingListener::new());
//!     // wire a TicketChannel with the fakes, send, then:
//!     transport.deliver("ticket.reply", reply_message);
//!     listener.wait_for(1).await;
//! }
//! ```

pub mod codec;
pub mod listener;
pub mod transport;

pub use codec::BincodeCodec;
pub use listener::RecordingListener;
pub use transport::InMemoryTransport;

use ticketgate_core::Codec;

/// Initialize a test tracing subscriber honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Convenience: the fakes most tests need, ready to share.
#[must_use]
pub fn test_codec() -> std::sync::Arc<dyn Codec> {
    std::sync::Arc::new(BincodeCodec)
}
