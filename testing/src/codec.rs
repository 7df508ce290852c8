//! Bincode-backed reference codec.

use ticketgate_core::codec::{Codec, CodecError};
use ticketgate_core::message::{TicketRequest, TicketResponse};

/// [`Codec`] implementation using bincode.
///
/// Compact and fast, suitable for tests and all-Rust deployments. Real
/// exchange integrations supply their own wire format behind the same trait.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode(&self, request: &TicketRequest) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(request).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<TicketResponse, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

impl BincodeCodec {
    /// Encode a response the way the fake exchange would put it on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the response cannot be serialized.
    pub fn encode_response(response: &TicketResponse) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(response).map_err(|e| CodecError::Encode(e.to_string()))
    }
}
