//! Domain messages exchanged with the ticket exchange.
//!
//! Ticketgate multiplexes seven independent request/response channels, one
//! per [`TicketKind`]. Each kind carries its own destinations and timeout
//! class but all kinds share the same delivery machinery, so requests are
//! modeled as one [`TicketRequest`] enum and replies as a single
//! [`TicketResponse`] shape.
//!
//! Construction and validation of these messages is the embedding
//! application's job; ticketgate only derives the correlation id from the
//! ticket id and moves the message through the transport.
//!
//! # Correlation
//!
//! A reply is routed back to its originating request by ticket id: the
//! ticket id of a request is its correlation id, and the exchange echoes it
//! in [`TicketResponse::ticket_id`]. At most one request per ticket id may
//! be in flight on a channel at any time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The seven ticket message kinds, one delivery channel each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketKind {
    /// A new betting-ticket proposal.
    Submission,
    /// Cancellation of a previously submitted ticket.
    Cancellation,
    /// Caller acknowledgment of a ticket response.
    Acknowledgment,
    /// Caller acknowledgment of a cancellation response.
    CancelAcknowledgment,
    /// Cashout request for an accepted ticket.
    Cashout,
    /// Cancellation of a reoffered ticket.
    ReofferCancel,
    /// Non-settlement report for a ticket.
    NonSettlement,
}

impl TicketKind {
    /// All kinds, in channel order.
    pub const ALL: [Self; 7] = [
        Self::Submission,
        Self::Cancellation,
        Self::Acknowledgment,
        Self::CancelAcknowledgment,
        Self::Cashout,
        Self::ReofferCancel,
        Self::NonSettlement,
    ];

    /// Stable string identifier, used in destinations, logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submission => "ticket",
            Self::Cancellation => "ticket-cancel",
            Self::Acknowledgment => "ticket-ack",
            Self::CancelAcknowledgment => "ticket-cancel-ack",
            Self::Cashout => "ticket-cashout",
            Self::ReofferCancel => "ticket-reoffer-cancel",
            Self::NonSettlement => "ticket-non-settlement",
        }
    }
}

impl fmt::Display for TicketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A new betting-ticket proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket id, unique per bookmaker; also the correlation id.
    pub ticket_id: String,
    /// Id of the bookmaker submitting the ticket.
    pub bookmaker_id: u32,
    /// Total stake across all bets, in the exchange's minor currency unit.
    pub total_stake: i64,
    /// Whether the ticket targets live markets (selects the live timeout
    /// class when one is configured).
    pub live: bool,
    /// Submission timestamp.
    pub timestamp_utc: DateTime<Utc>,
}

/// Cancellation of a previously submitted ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketCancel {
    /// Id of the ticket being cancelled.
    pub ticket_id: String,
    /// Id of the bookmaker owning the ticket.
    pub bookmaker_id: u32,
    /// Exchange cancellation reason code.
    pub code: u32,
    /// Partial cancellation percentage in hundredths of a percent, when the
    /// exchange supports it. `None` cancels the whole ticket.
    pub percent: Option<u32>,
}

/// Caller acknowledgment of a ticket response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketAck {
    /// Id of the acknowledged ticket.
    pub ticket_id: String,
    /// Id of the bookmaker owning the ticket.
    pub bookmaker_id: u32,
    /// Whether the caller accepted the ticket response.
    pub accepted: bool,
    /// Reason code accompanying a rejection acknowledgment.
    pub reason_code: u32,
    /// Human-readable reason.
    pub reason_message: String,
}

/// Caller acknowledgment of a cancellation response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketCancelAck {
    /// Id of the ticket whose cancellation is acknowledged.
    pub ticket_id: String,
    /// Id of the bookmaker owning the ticket.
    pub bookmaker_id: u32,
    /// Whether the caller accepted the cancellation response.
    pub accepted: bool,
    /// Reason code accompanying a rejection acknowledgment.
    pub reason_code: u32,
    /// Human-readable reason.
    pub reason_message: String,
}

/// Cashout request for an accepted ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketCashout {
    /// Id of the ticket being cashed out.
    pub ticket_id: String,
    /// Id of the bookmaker owning the ticket.
    pub bookmaker_id: u32,
    /// Cashout amount in the exchange's minor currency unit.
    pub amount: i64,
    /// Partial cashout percentage in hundredths of a percent.
    pub percent: Option<u32>,
}

/// Cancellation of a reoffered ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketReofferCancel {
    /// Id of the reoffered ticket being declined.
    pub ticket_id: String,
    /// Id of the bookmaker owning the ticket.
    pub bookmaker_id: u32,
}

/// Non-settlement report for a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketNonSettlement {
    /// Id of the reported ticket.
    pub ticket_id: String,
    /// Id of the bookmaker owning the ticket.
    pub bookmaker_id: u32,
}

/// A request destined for the exchange, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TicketRequest {
    /// See [`Ticket`].
    Submission(Ticket),
    /// See [`TicketCancel`].
    Cancellation(TicketCancel),
    /// See [`TicketAck`].
    Acknowledgment(TicketAck),
    /// See [`TicketCancelAck`].
    CancelAcknowledgment(TicketCancelAck),
    /// See [`TicketCashout`].
    Cashout(TicketCashout),
    /// See [`TicketReofferCancel`].
    ReofferCancel(TicketReofferCancel),
    /// See [`TicketNonSettlement`].
    NonSettlement(TicketNonSettlement),
}

impl TicketRequest {
    /// The channel kind this request belongs to.
    #[must_use]
    pub const fn kind(&self) -> TicketKind {
        match self {
            Self::Submission(_) => TicketKind::Submission,
            Self::Cancellation(_) => TicketKind::Cancellation,
            Self::Acknowledgment(_) => TicketKind::Acknowledgment,
            Self::CancelAcknowledgment(_) => TicketKind::CancelAcknowledgment,
            Self::Cashout(_) => TicketKind::Cashout,
            Self::ReofferCancel(_) => TicketKind::ReofferCancel,
            Self::NonSettlement(_) => TicketKind::NonSettlement,
        }
    }

    /// The ticket id, which doubles as the correlation id.
    #[must_use]
    pub fn ticket_id(&self) -> &str {
        match self {
            Self::Submission(t) => &t.ticket_id,
            Self::Cancellation(t) => &t.ticket_id,
            Self::Acknowledgment(t) => &t.ticket_id,
            Self::CancelAcknowledgment(t) => &t.ticket_id,
            Self::Cashout(t) => &t.ticket_id,
            Self::ReofferCancel(t) => &t.ticket_id,
            Self::NonSettlement(t) => &t.ticket_id,
        }
    }

    /// Whether this request targets live markets.
    ///
    /// Only ticket submissions distinguish live from prematch; every other
    /// kind uses its channel's base timeout window.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        match self {
            Self::Submission(t) => t.live,
            _ => false,
        }
    }
}

/// Exchange verdict on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// The exchange accepted the request.
    Accepted,
    /// The exchange rejected the request.
    Rejected,
}

/// Reason detail attached to a response, typically on rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseReason {
    /// Exchange reason code.
    pub code: i32,
    /// Human-readable message.
    pub message: String,
}

/// A reply from the exchange, correlated back by ticket id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketResponse {
    /// Ticket id echoed from the originating request.
    pub ticket_id: String,
    /// Kind of the originating request.
    pub kind: TicketKind,
    /// Exchange verdict.
    pub status: ResponseStatus,
    /// Reason detail, present at least on rejection.
    pub reason: Option<ResponseReason>,
    /// Exchange signature over the response, when provided.
    pub signature: Option<String>,
}

/// Terminal outcome of a pending request.
///
/// Exactly one outcome is delivered per accepted `send`, via exactly one of
/// the three paths.
#[derive(Debug, Clone, PartialEq)]
pub enum TicketOutcome {
    /// The exchange replied within the window.
    Reply(TicketResponse),
    /// No reply arrived within the configured window.
    Timeout,
    /// The channel was shut down while the request was still pending.
    Closed,
}

/// Callback receiving the terminal outcome of every request on a channel.
///
/// One listener per channel, supplied by the embedding application before
/// the channel opens. Invoked from the channel's consumer task (replies),
/// the reaper task (timeouts) or the closing task (forced close), so
/// implementations must be cheap and non-blocking; hand heavy work off to a
/// queue or task of your own.
pub trait ResponseListener: Send + Sync {
    /// Deliver the terminal outcome for `ticket_id` on the `kind` channel.
    fn on_outcome(&self, kind: TicketKind, ticket_id: &str, outcome: TicketOutcome);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(id: &str, live: bool) -> TicketRequest {
        TicketRequest::Submission(Ticket {
            ticket_id: id.to_string(),
            bookmaker_id: 7,
            total_stake: 10_000,
            live,
            timestamp_utc: Utc::now(),
        })
    }

    #[test]
    fn correlation_id_is_ticket_id() {
        let request = ticket("T-1", false);
        assert_eq!(request.ticket_id(), "T-1");
        assert_eq!(request.kind(), TicketKind::Submission);
    }

    #[test]
    fn only_live_submissions_use_live_window() {
        assert!(ticket("T-1", true).is_live());
        assert!(!ticket("T-2", false).is_live());
        let cancel = TicketRequest::Cancellation(TicketCancel {
            ticket_id: "T-3".to_string(),
            bookmaker_id: 7,
            code: 101,
            percent: None,
        });
        assert!(!cancel.is_live());
    }

    #[test]
    fn kind_strings_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for kind in TicketKind::ALL {
            assert!(seen.insert(kind.as_str()), "duplicate: {kind}");
        }
        assert_eq!(seen.len(), 7);
    }

    #[test]
    fn requests_round_trip_through_bincode() {
        let request = ticket("T-9", true);
        #[allow(clippy::unwrap_used)]
        let bytes = bincode::serialize(&request).unwrap();
        #[allow(clippy::unwrap_used)]
        let back: TicketRequest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, request);
    }
}
