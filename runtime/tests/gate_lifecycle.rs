//! Integration tests for gate lifecycle and routing.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use ticketgate_core::message::{
    ResponseListener, Ticket, TicketCancel, TicketKind, TicketOutcome, TicketRequest,
};
use ticketgate_runtime::error::{ChannelError, SendError};
use ticketgate_runtime::{ChannelSettings, GateConfig, GateError, TicketGate};
use ticketgate_testing::{BincodeCodec, InMemoryTransport, RecordingListener};

fn settings(kind: TicketKind) -> ChannelSettings {
    ChannelSettings::new(
        format!("{kind}.submit"),
        format!("{kind}.confirm"),
        Duration::from_millis(100),
    )
}

fn two_kind_gate() -> (Arc<InMemoryTransport>, Arc<RecordingListener>, TicketGate) {
    let transport = Arc::new(InMemoryTransport::new());
    let listener = Arc::new(RecordingListener::new());
    let config = GateConfig::builder()
        .channel(TicketKind::Submission, settings(TicketKind::Submission))
        .channel(TicketKind::Cancellation, settings(TicketKind::Cancellation))
        .worker_grace(Duration::from_millis(200))
        .build();
    let gate = TicketGate::new(
        Arc::clone(&transport) as Arc<dyn ticketgate_core::Transport>,
        Arc::new(BincodeCodec),
        config,
    );
    for kind in [TicketKind::Submission, TicketKind::Cancellation] {
        gate.set_listener(kind, Arc::clone(&listener) as _).unwrap();
    }
    (transport, listener, gate)
}

fn submission(id: &str) -> TicketRequest {
    TicketRequest::Submission(Ticket {
        ticket_id: id.to_string(),
        bookmaker_id: 7,
        total_stake: 1_000,
        live: false,
        timestamp_utc: Utc::now(),
    })
}

fn cancellation(id: &str) -> TicketRequest {
    TicketRequest::Cancellation(TicketCancel {
        ticket_id: id.to_string(),
        bookmaker_id: 7,
        code: 101,
        percent: None,
    })
}

#[tokio::test]
async fn channel_access_requires_an_open_gate() {
    let (_, _, gate) = two_kind_gate();

    assert!(matches!(
        gate.channel(TicketKind::Submission),
        Err(GateError::NotOpen)
    ));
    assert!(matches!(
        gate.send(submission("T-1")).await,
        Err(GateError::NotOpen)
    ));
}

#[tokio::test]
async fn open_is_idempotent_but_reopen_after_close_is_refused() {
    let (_, _, gate) = two_kind_gate();

    gate.open().unwrap();
    gate.open().unwrap();
    assert!(gate.is_open());

    gate.close().await.unwrap();
    assert!(!gate.is_open());
    assert!(matches!(gate.open(), Err(GateError::Reopened)));

    // Closing again is a no-op.
    gate.close().await.unwrap();
}

#[tokio::test]
async fn channels_are_created_lazily_and_cached() {
    let (_, _, gate) = two_kind_gate();
    gate.open().unwrap();

    let first = gate.channel(TicketKind::Submission).unwrap();
    let second = gate.channel(TicketKind::Submission).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(first.is_open());

    gate.close().await.unwrap();
    assert!(!first.is_open());
}

#[tokio::test]
async fn unconfigured_kind_is_refused() {
    let (_, _, gate) = two_kind_gate();
    gate.open().unwrap();

    assert!(matches!(
        gate.channel(TicketKind::Cashout),
        Err(GateError::UnconfiguredKind(TicketKind::Cashout))
    ));

    gate.close().await.unwrap();
}

#[tokio::test]
async fn listener_cannot_be_swapped_under_a_live_channel() {
    let (_, listener, gate) = two_kind_gate();
    gate.open().unwrap();
    gate.channel(TicketKind::Submission).unwrap();

    let err = gate
        .set_listener(TicketKind::Submission, Arc::clone(&listener) as _)
        .unwrap_err();
    assert!(matches!(
        err,
        GateError::ListenerWhileOpen(TicketKind::Submission)
    ));

    // Kinds without a channel yet can still be staged.
    gate.set_listener(TicketKind::Cancellation, Arc::clone(&listener) as _)
        .unwrap();

    gate.close().await.unwrap();
}

#[tokio::test]
async fn channel_without_listener_refuses_to_open() {
    let transport = Arc::new(InMemoryTransport::new());
    let config = GateConfig::builder()
        .channel(TicketKind::Submission, settings(TicketKind::Submission))
        .build();
    let gate = TicketGate::new(
        Arc::clone(&transport) as Arc<dyn ticketgate_core::Transport>,
        Arc::new(BincodeCodec),
        config,
    );
    gate.open().unwrap();

    assert!(matches!(
        gate.channel(TicketKind::Submission),
        Err(GateError::Channel(ChannelError::ListenerMissing(
            TicketKind::Submission
        )))
    ));

    gate.close().await.unwrap();
}

#[tokio::test]
async fn requests_are_routed_to_their_kind_destination() {
    let (transport, _, gate) = two_kind_gate();
    gate.open().unwrap();

    gate.send(submission("T-1")).await.unwrap();
    gate.send(cancellation("T-2")).await.unwrap();

    let submissions = transport.published_to("ticket.submit");
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].correlation_id, "T-1");
    assert_eq!(
        submissions[0].reply_to.as_deref(),
        Some("ticket.confirm")
    );

    let cancellations = transport.published_to("ticket-cancel.submit");
    assert_eq!(cancellations.len(), 1);
    assert_eq!(cancellations[0].correlation_id, "T-2");

    gate.close().await.unwrap();
}

#[tokio::test]
async fn channel_rejects_requests_of_a_foreign_kind() {
    let (_, _, gate) = two_kind_gate();
    gate.open().unwrap();

    let channel = gate.channel(TicketKind::Submission).unwrap();
    let err = channel.send(cancellation("T-1")).await.unwrap_err();
    assert!(matches!(
        err,
        SendError::KindMismatch {
            expected: TicketKind::Submission,
            actual: TicketKind::Cancellation,
        }
    ));

    gate.close().await.unwrap();
}

#[tokio::test]
async fn send_after_close_reports_not_open() {
    let (_, _, gate) = two_kind_gate();
    gate.open().unwrap();
    gate.send(submission("T-1")).await.unwrap();
    gate.close().await.unwrap();

    assert!(matches!(
        gate.send(submission("T-2")).await,
        Err(GateError::NotOpen)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn channels_created_during_close_are_still_torn_down() {
    let (_, _, gate) = two_kind_gate();
    let gate = Arc::new(gate);
    gate.open().unwrap();

    // Hammer lazy channel creation while the close runs; every channel the
    // gate ever hands out must end up torn down, even one built in the
    // window between the lifecycle flip and the drain.
    let creator_gate = Arc::clone(&gate);
    let creator = tokio::spawn(async move {
        let mut created = Vec::new();
        loop {
            match creator_gate.channel(TicketKind::Cancellation) {
                Ok(channel) => created.push(channel),
                Err(_) => break,
            }
            tokio::task::yield_now().await;
        }
        created
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    gate.close().await.unwrap();

    let created = creator.await.unwrap();
    assert!(!created.is_empty());
    assert!(created.iter().all(|channel| !channel.is_open()));
}

/// Listener that blocks its caller, wedging whichever runtime task delivers
/// the outcome.
struct StallingListener {
    entered: AtomicBool,
    hold: Duration,
}

impl ResponseListener for StallingListener {
    fn on_outcome(&self, _kind: TicketKind, _ticket_id: &str, outcome: TicketOutcome) {
        if outcome == TicketOutcome::Timeout {
            self.entered.store(true, Ordering::SeqCst);
            std::thread::sleep(self.hold);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_aggregates_components_that_had_to_be_cancelled() {
    let transport = Arc::new(InMemoryTransport::new());
    let listener = Arc::new(StallingListener {
        entered: AtomicBool::new(false),
        hold: Duration::from_millis(400),
    });
    let config = GateConfig::builder()
        .channel(
            TicketKind::Submission,
            ChannelSettings::new("ticket.submit", "ticket.confirm", Duration::from_millis(10)),
        )
        .worker_grace(Duration::from_millis(50))
        .reaper_max_interval(Duration::from_millis(25))
        .build();
    let gate = TicketGate::new(
        Arc::clone(&transport) as Arc<dyn ticketgate_core::Transport>,
        Arc::new(BincodeCodec),
        config,
    );
    gate.set_listener(TicketKind::Submission, Arc::clone(&listener) as _)
        .unwrap();
    gate.open().unwrap();

    // The request times out, and the timeout delivery wedges the reaper
    // inside the listener for longer than the close grace.
    gate.send(submission("T-1")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while !listener.entered.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let err = gate.close().await.unwrap_err();
    assert_eq!(err.failures.len(), 1);
    assert_eq!(err.failures[0].component, "reaper");
    assert!(matches!(err.failures[0].error, ChannelError::ForcedStop(_)));
}

