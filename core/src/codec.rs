//! Codec capability: domain messages to wire bytes and back.
//!
//! The actual wire format belongs to the exchange integration and is
//! supplied by the embedding application. The delivery runtime only needs
//! the two conversions below; `BincodeCodec` in ticketgate-testing is the
//! in-workspace reference implementation.

use crate::message::{TicketRequest, TicketResponse};
use thiserror::Error;

/// Errors that can occur while encoding or decoding messages.
#[derive(Error, Debug, Clone)]
pub enum CodecError {
    /// Failed to encode a request into wire bytes.
    #[error("Failed to encode request: {0}")]
    Encode(String),

    /// Failed to decode reply bytes into a response.
    ///
    /// A malformed reply is dropped and logged by the consumer task; the
    /// pending request it may have belonged to remains eligible for timeout.
    #[error("Failed to decode response: {0}")]
    Decode(String),
}

/// Conversion between domain messages and opaque wire bytes.
pub trait Codec: Send + Sync {
    /// Encode a request into the bytes published on the request destination.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] when the request cannot be represented
    /// in the wire format.
    fn encode(&self, request: &TicketRequest) -> Result<Vec<u8>, CodecError>;

    /// Decode reply bytes received from the reply destination.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] when the bytes are malformed.
    fn decode(&self, bytes: &[u8]) -> Result<TicketResponse, CodecError>;
}
