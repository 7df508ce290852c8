//! # Ticketgate Core
//!
//! Core traits and types for the ticketgate ticket-delivery subsystem.
//!
//! Ticketgate delivers betting-ticket messages to an exchange over a durable
//! broker and correlates the exchange's asynchronous replies back to the
//! originating caller. This crate defines the two capabilities the delivery
//! runtime consumes and the domain types that flow through them:
//!
//! - [`transport::Transport`]: publish/consume opaque encoded messages on
//!   named destinations.
//! - [`codec::Codec`]: convert between domain messages and wire bytes.
//! - [`message`]: the seven ticket request kinds, the exchange response,
//!   and the [`message::ResponseListener`] callback that receives exactly
//!   one terminal outcome per request.
//!
//! Everything else (message builders, configuration loading, reference-data
//! lookup, the wire format itself) lives outside this workspace and plugs in
//! through these seams.

pub mod codec;
pub mod message;
pub mod transport;

pub use codec::{Codec, CodecError};
pub use message::{
    ResponseListener, ResponseReason, ResponseStatus, TicketKind, TicketOutcome, TicketRequest,
    TicketResponse,
};
pub use transport::{MessageStream, Transport, TransportError, TransportMessage};
