use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;

use peercall::core::InboundSignal;
use peercall::peer::{ConnectionState, PeerEvent};
use peercall::signaling::loopback::LoopbackRelay;
use peercall::signaling::{SignalingTransport, TransportError};
use peercall::test_utils::{
    FakeConnectionFactory, FakeMediaSource, RecordingTransport, candidate,
};
use peercall::{
    CallConfig, CallController, CallError, CallEvent, CallHandler, CallRole, EndReason,
    IceCandidate, IntentOutcome, Lifecycle, MediaKind, PeerId, Refusal, SessionDescription,
    SignalMessage, SignalingState,
};
use tokio::sync::broadcast;

struct Side {
    controller: Arc<CallController>,
    media: Arc<FakeMediaSource>,
    connections: Arc<FakeConnectionFactory>,
    transport: Arc<RecordingTransport>,
}

fn side(local: &str, config: CallConfig) -> Side {
    let media = FakeMediaSource::new();
    let connections = FakeConnectionFactory::new();
    let transport = RecordingTransport::new();
    let controller = CallController::new(
        PeerId::new(local),
        config,
        transport.clone(),
        media.clone(),
        connections.clone(),
    );
    Side {
        controller,
        media,
        connections,
        transport,
    }
}

fn message(from: &str, message: SignalMessage) -> InboundSignal {
    InboundSignal::Message {
        from: PeerId::new(from),
        message,
    }
}

fn offer_from(from: &str) -> InboundSignal {
    message(
        from,
        SignalMessage::Offer {
            media: MediaKind::Audio,
            description: SessionDescription::offer(format!("v=0\r\no={from} 1 1 IN IP4 10.0.0.9\r\n")),
        },
    )
}

fn answer_from(from: &str) -> InboundSignal {
    message(
        from,
        SignalMessage::Answer {
            description: SessionDescription::answer("v=0\r\no=answer 1 1 IN IP4 10.0.0.9\r\n"),
        },
    )
}

fn candidate_from(from: &str, n: u8) -> InboundSignal {
    message(
        from,
        SignalMessage::Candidate {
            candidate: candidate(n),
        },
    )
}

async fn next_event(
    events: &mut broadcast::Receiver<CallEvent>,
    matches: impl Fn(&CallEvent) -> bool,
) -> CallEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

fn drain(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

/// Alice calls bob; returns once the offer is out.
async fn ringing_caller(config: CallConfig) -> Side {
    let alice = side("alice", config);
    let outcome = alice
        .controller
        .place_call(PeerId::new("bob"), MediaKind::Audio)
        .await
        .expect("place_call failed");
    assert_eq!(outcome, IntentOutcome::Done);
    alice
}

#[tokio::test]
async fn test_caller_and_callee_over_loopback() {
    let relay = LoopbackRelay::new();
    let (alice_transport, alice_rx) = relay.register(PeerId::new("alice"));
    let (bob_transport, bob_rx) = relay.register(PeerId::new("bob"));

    let alice_media = FakeMediaSource::new();
    let bob_media = FakeMediaSource::new();
    let alice_pcs = FakeConnectionFactory::new();
    let bob_pcs = FakeConnectionFactory::new();

    let alice = CallController::new(
        PeerId::new("alice"),
        CallConfig::default(),
        alice_transport,
        alice_media.clone(),
        alice_pcs.clone(),
    );
    let bob = CallController::new(
        PeerId::new("bob"),
        CallConfig::default(),
        bob_transport,
        bob_media.clone(),
        bob_pcs.clone(),
    );
    CallHandler::spawn(alice.clone(), alice_rx);
    CallHandler::spawn(bob.clone(), bob_rx);

    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    let outcome = alice
        .place_call(PeerId::new("bob"), MediaKind::Video)
        .await
        .unwrap();
    assert_eq!(outcome, IntentOutcome::Done);

    let ringing = next_event(&mut bob_events, |e| matches!(e, CallEvent::Ringing { .. })).await;
    assert_eq!(
        ringing,
        CallEvent::Ringing {
            peer: PeerId::new("alice"),
            role: CallRole::Callee,
            media: MediaKind::Video,
        }
    );

    // Alice trickles a candidate before bob has answered; bob buffers it.
    let alice_pc = alice_pcs.last().expect("alice has a peer connection");
    alice_pc.emit(PeerEvent::LocalCandidate(candidate(1))).await;
    for _ in 0..200 {
        if let Some(snapshot) = bob.snapshot().await
            && snapshot.pending_candidates == 1
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(bob.accept_incoming().await.unwrap(), IntentOutcome::Done);
    let bob_pc = bob_pcs.last().expect("bob has a peer connection");
    assert_eq!(bob_pc.applied_candidates(), vec![candidate(1)]);

    next_event(&mut alice_events, |e| matches!(e, CallEvent::Active { .. })).await;
    let alice_snapshot = alice.snapshot().await.unwrap();
    assert_eq!(alice_snapshot.lifecycle, Lifecycle::Active);
    assert_eq!(alice_snapshot.signaling_state, SignalingState::Stable);
    assert_eq!(bob.snapshot().await.unwrap().lifecycle, Lifecycle::Active);

    // Bob's candidates reach alice after the answer and are applied directly.
    bob_pc.emit(PeerEvent::LocalCandidate(candidate(2))).await;
    eventually(|| alice_pc.applied_candidates() == vec![candidate(2)]).await;

    assert_eq!(alice.hang_up().await, IntentOutcome::Done);
    let ended = next_event(&mut bob_events, |e| matches!(e, CallEvent::Ended { .. })).await;
    let CallEvent::Ended { peer, reason, .. } = ended else {
        unreachable!()
    };
    assert_eq!(peer, PeerId::new("alice"));
    assert_eq!(reason, EndReason::RemoteHangUp);

    assert!(alice.snapshot().await.is_none());
    assert!(bob.snapshot().await.is_none());
    assert_eq!(
        alice.last_ended().await.unwrap().end_reason,
        Some(EndReason::LocalHangUp)
    );
    assert!(alice_pc.is_closed());
    eventually(|| bob_pc.is_closed()).await;
    // Video calls carry two tracks; each is stopped once.
    assert_eq!(alice_media.stopped_tracks(), 2);
    assert_eq!(bob_media.stopped_tracks(), 2);
}

#[tokio::test]
async fn test_three_candidates_before_answer_applied_in_order() {
    let alice = ringing_caller(CallConfig::default()).await;
    let pc = alice.connections.last().unwrap();

    for n in 1..=3 {
        alice.controller.handle_signal(candidate_from("bob", n)).await;
    }
    assert!(pc.applied_candidates().is_empty());
    assert_eq!(alice.controller.snapshot().await.unwrap().pending_candidates, 3);

    alice.controller.handle_signal(answer_from("bob")).await;

    assert_eq!(
        pc.applied_candidates(),
        vec![candidate(1), candidate(2), candidate(3)]
    );
    let snapshot = alice.controller.snapshot().await.unwrap();
    assert_eq!(snapshot.pending_candidates, 0);
    assert_eq!(snapshot.lifecycle, Lifecycle::Active);
}

#[tokio::test]
async fn test_candidate_racing_the_answer_keeps_arrival_order() {
    let alice = ringing_caller(CallConfig::default()).await;
    let pc = alice.connections.last().unwrap();

    alice.controller.handle_signal(candidate_from("bob", 1)).await;
    alice.controller.handle_signal(candidate_from("bob", 2)).await;

    // Whichever side wins, the buffered candidates go first.
    tokio::join!(
        alice.controller.handle_signal(answer_from("bob")),
        alice.controller.handle_signal(candidate_from("bob", 3)),
    );
    alice.controller.handle_signal(candidate_from("bob", 4)).await;

    assert_eq!(
        pc.applied_candidates(),
        vec![candidate(1), candidate(2), candidate(3), candidate(4)]
    );
}

#[tokio::test]
async fn test_second_offer_while_ringing_is_rejected_busy() {
    let bob = side("bob", CallConfig::default());
    let mut events = bob.controller.subscribe();

    bob.controller.handle_signal(offer_from("alice")).await;
    let first = bob.controller.snapshot().await.unwrap();
    assert_eq!(first.lifecycle, Lifecycle::Ringing);

    bob.controller.handle_signal(offer_from("carol")).await;

    assert_eq!(
        bob.transport.sent(),
        vec![(PeerId::new("carol"), SignalMessage::DeclineCall { busy: true })]
    );
    next_event(&mut events, |e| {
        *e == CallEvent::Busy {
            from: PeerId::new("carol"),
        }
    })
    .await;

    let still = bob.controller.snapshot().await.unwrap();
    assert_eq!(still.call_id, first.call_id);
    assert_eq!(still.remote_peer, PeerId::new("alice"));
    assert_eq!(still.lifecycle, Lifecycle::Ringing);
}

#[tokio::test]
async fn test_repeated_offer_from_same_peer_is_rejected_busy() {
    let bob = side("bob", CallConfig::default());
    let mut events = bob.controller.subscribe();

    bob.controller.handle_signal(offer_from("alice")).await;
    let first = bob.controller.snapshot().await.unwrap();

    bob.controller.handle_signal(offer_from("alice")).await;

    assert_eq!(
        bob.transport.sent(),
        vec![(PeerId::new("alice"), SignalMessage::DeclineCall { busy: true })]
    );
    next_event(&mut events, |e| {
        *e == CallEvent::Busy {
            from: PeerId::new("alice"),
        }
    })
    .await;

    // The ringing call is the one from the first offer.
    let still = bob.controller.snapshot().await.unwrap();
    assert_eq!(still.call_id, first.call_id);
    assert_eq!(still.lifecycle, Lifecycle::Ringing);
    assert_eq!(still.signaling_state, SignalingState::Stable);
    assert_eq!(bob.connections.created(), 0);
}

#[tokio::test]
async fn test_second_offer_while_active_leaves_call_untouched() {
    let alice = ringing_caller(CallConfig::default()).await;
    alice.controller.handle_signal(answer_from("bob")).await;
    let active = alice.controller.snapshot().await.unwrap();
    assert_eq!(active.lifecycle, Lifecycle::Active);

    alice.controller.handle_signal(offer_from("carol")).await;

    let (to, msg) = alice.transport.sent().pop().unwrap();
    assert_eq!(to, PeerId::new("carol"));
    assert_eq!(msg, SignalMessage::DeclineCall { busy: true });

    let after = alice.controller.snapshot().await.unwrap();
    assert_eq!(after.call_id, active.call_id);
    assert_eq!(after.lifecycle, Lifecycle::Active);
    assert_eq!(after.signaling_state, SignalingState::Stable);
    assert_eq!(alice.connections.created(), 1);
}

#[tokio::test]
async fn test_glare_both_sides_end_busy() {
    let alice = ringing_caller(CallConfig::default()).await;

    // Bob called us at the same time.
    alice.controller.handle_signal(offer_from("bob")).await;
    assert_eq!(
        alice.transport.sent().last().unwrap().1,
        SignalMessage::DeclineCall { busy: true }
    );

    // ...and bob's side declined ours the same way.
    alice
        .controller
        .handle_signal(message("bob", SignalMessage::DeclineCall { busy: true }))
        .await;
    assert!(alice.controller.snapshot().await.is_none());
    assert_eq!(
        alice.controller.last_ended().await.unwrap().end_reason,
        Some(EndReason::Busy)
    );
}

#[tokio::test]
async fn test_answer_outside_have_local_offer_is_ignored() {
    // Callee side: no local offer exists at all.
    let bob = side("bob", CallConfig::default());
    bob.controller.handle_signal(offer_from("alice")).await;
    bob.controller.handle_signal(answer_from("alice")).await;
    let snapshot = bob.controller.snapshot().await.unwrap();
    assert_eq!(snapshot.lifecycle, Lifecycle::Ringing);
    assert_eq!(snapshot.signaling_state, SignalingState::Stable);

    // Caller side: a duplicate answer after negotiation completed.
    let alice = ringing_caller(CallConfig::default()).await;
    alice.controller.handle_signal(answer_from("bob")).await;
    alice.controller.handle_signal(answer_from("bob")).await;
    let pc = alice.connections.last().unwrap();
    assert_eq!(pc.remote_descriptions().len(), 1);
    assert_eq!(
        alice.controller.snapshot().await.unwrap().lifecycle,
        Lifecycle::Active
    );
}

#[tokio::test]
async fn test_hang_up_ends_exactly_once() {
    let alice = ringing_caller(CallConfig::default()).await;
    let mut events = alice.controller.subscribe();

    assert_eq!(alice.controller.hang_up().await, IntentOutcome::Done);
    assert_eq!(
        alice.controller.hang_up().await,
        IntentOutcome::Refused(Refusal::NothingToHangUp)
    );

    let ended: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, CallEvent::Ended { .. }))
        .collect();
    assert_eq!(ended.len(), 1);
    assert_eq!(alice.transport.sent_kinds(), vec!["offer", "endCall"]);
    assert_eq!(alice.media.stopped_tracks(), 1);
    assert!(alice.connections.last().unwrap().is_closed());

    // A late EndCall from the peer changes nothing.
    alice
        .controller
        .handle_signal(message("bob", SignalMessage::EndCall))
        .await;
    assert_eq!(
        alice.controller.last_ended().await.unwrap().end_reason,
        Some(EndReason::LocalHangUp)
    );
}

#[tokio::test]
async fn test_end_call_while_offer_suspended_sends_nothing() {
    let alice = side("alice", CallConfig::default());
    let gate = alice.connections.hold_offers();

    let placing = tokio::spawn({
        let controller = alice.controller.clone();
        async move {
            controller
                .place_call(PeerId::new("bob"), MediaKind::Audio)
                .await
        }
    });
    gate.entered().await;

    alice
        .controller
        .handle_signal(message("bob", SignalMessage::EndCall))
        .await;
    gate.release();

    let outcome = placing.await.unwrap().unwrap();
    assert_eq!(outcome, IntentOutcome::Stale);
    assert!(alice.transport.sent().is_empty());
    assert!(alice.controller.snapshot().await.is_none());
    assert_eq!(
        alice.controller.last_ended().await.unwrap().end_reason,
        Some(EndReason::RemoteHangUp)
    );
    assert_eq!(alice.media.stopped_tracks(), 1);
}

#[tokio::test]
async fn test_hang_up_while_offer_suspended() {
    let alice = side("alice", CallConfig::default());
    let gate = alice.connections.hold_offers();

    let placing = tokio::spawn({
        let controller = alice.controller.clone();
        async move {
            controller
                .place_call(PeerId::new("bob"), MediaKind::Audio)
                .await
        }
    });
    gate.entered().await;

    // A second call cannot start while the first is being set up.
    assert_eq!(
        alice
            .controller
            .place_call(PeerId::new("carol"), MediaKind::Audio)
            .await
            .unwrap(),
        IntentOutcome::Refused(Refusal::CallInProgress)
    );

    assert_eq!(alice.controller.hang_up().await, IntentOutcome::Done);
    gate.release();

    assert_eq!(placing.await.unwrap().unwrap(), IntentOutcome::Stale);
    // The remote side never heard of the call, so it is not told it ended.
    assert!(alice.transport.sent().is_empty());
}

#[tokio::test]
async fn test_media_denied_fails_and_frees_the_slot() {
    let alice = side("alice", CallConfig::default());
    let mut events = alice.controller.subscribe();
    alice.media.set_denied(true);

    let err = alice
        .controller
        .place_call(PeerId::new("bob"), MediaKind::Audio)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Media(_)));

    let seen = drain(&mut events);
    let failed = seen
        .iter()
        .filter(|e| matches!(e, CallEvent::Failed { .. }))
        .count();
    assert_eq!(failed, 1);
    assert!(seen.iter().any(|e| matches!(
        e,
        CallEvent::Ended {
            reason: EndReason::MediaUnavailable(_),
            ..
        }
    )));
    assert!(alice.controller.snapshot().await.is_none());
    assert!(alice.transport.sent().is_empty());

    alice.media.set_denied(false);
    assert_eq!(
        alice
            .controller
            .place_call(PeerId::new("bob"), MediaKind::Audio)
            .await
            .unwrap(),
        IntentOutcome::Done
    );
}

#[tokio::test]
async fn test_accept_failure_tells_the_caller() {
    let bob = side("bob", CallConfig::default());
    bob.controller.handle_signal(offer_from("alice")).await;
    bob.connections.set_failing(true);

    let err = bob.controller.accept_incoming().await.unwrap_err();
    assert!(matches!(err, CallError::Connection(_)));
    assert_eq!(
        bob.transport.sent(),
        vec![(PeerId::new("alice"), SignalMessage::EndCall)]
    );
    assert!(bob.controller.snapshot().await.is_none());
}

#[tokio::test]
async fn test_decline_and_refusals() {
    let bob = side("bob", CallConfig::default());

    assert_eq!(
        bob.controller.accept_incoming().await.unwrap(),
        IntentOutcome::Refused(Refusal::NothingToAccept)
    );
    assert_eq!(
        bob.controller.decline_incoming().await,
        IntentOutcome::Refused(Refusal::NothingToDecline)
    );

    bob.controller.handle_signal(offer_from("alice")).await;
    assert_eq!(bob.controller.decline_incoming().await, IntentOutcome::Done);
    assert_eq!(
        bob.transport.sent(),
        vec![(PeerId::new("alice"), SignalMessage::DeclineCall { busy: false })]
    );
    assert_eq!(
        bob.controller.last_ended().await.unwrap().end_reason,
        Some(EndReason::Declined)
    );
    // Declining never touched media.
    assert_eq!(bob.media.acquired(), 0);

    assert_eq!(
        bob.controller.decline_incoming().await,
        IntentOutcome::Refused(Refusal::NothingToDecline)
    );
}

#[tokio::test]
async fn test_caller_cannot_accept_or_decline_own_call() {
    let alice = ringing_caller(CallConfig::default()).await;
    assert_eq!(
        alice.controller.accept_incoming().await.unwrap(),
        IntentOutcome::Refused(Refusal::NothingToAccept)
    );
    assert_eq!(
        alice.controller.decline_incoming().await,
        IntentOutcome::Refused(Refusal::NothingToDecline)
    );
}

#[tokio::test]
async fn test_invalid_peers_are_refused() {
    let alice = side("alice", CallConfig::default());
    for peer in ["", "  ", "alice"] {
        assert_eq!(
            alice
                .controller
                .place_call(PeerId::new(peer), MediaKind::Audio)
                .await
                .unwrap(),
            IntentOutcome::Refused(Refusal::InvalidPeer)
        );
    }
    assert_eq!(alice.media.acquired(), 0);
}

#[tokio::test]
async fn test_remote_decline_ends_call() {
    let alice = ringing_caller(CallConfig::default()).await;
    alice
        .controller
        .handle_signal(message("bob", SignalMessage::DeclineCall { busy: false }))
        .await;
    assert_eq!(
        alice.controller.last_ended().await.unwrap().end_reason,
        Some(EndReason::RemoteDeclined)
    );
    // The decliner already knows.
    assert_eq!(alice.transport.sent_kinds(), vec!["offer"]);
}

#[tokio::test]
async fn test_messages_from_other_peers_are_ignored() {
    let alice = ringing_caller(CallConfig::default()).await;

    alice
        .controller
        .handle_signal(message("carol", SignalMessage::EndCall))
        .await;
    alice.controller.handle_signal(candidate_from("carol", 1)).await;
    alice.controller.handle_signal(answer_from("carol")).await;

    let snapshot = alice.controller.snapshot().await.unwrap();
    assert_eq!(snapshot.lifecycle, Lifecycle::Ringing);
    assert_eq!(snapshot.pending_candidates, 0);
    assert_eq!(snapshot.signaling_state, SignalingState::HaveLocalOffer);
}

#[tokio::test]
async fn test_malformed_payloads_are_dropped() {
    let alice = ringing_caller(CallConfig::default()).await;

    alice
        .controller
        .handle_signal(message(
            "bob",
            SignalMessage::Candidate {
                candidate: IceCandidate::new(""),
            },
        ))
        .await;
    alice
        .controller
        .handle_signal(message(
            "bob",
            SignalMessage::Answer {
                description: SessionDescription::offer("v=0\r\n"),
            },
        ))
        .await;

    let snapshot = alice.controller.snapshot().await.unwrap();
    assert_eq!(snapshot.pending_candidates, 0);
    assert_eq!(snapshot.lifecycle, Lifecycle::Ringing);
    assert!(alice.connections.last().unwrap().remote_descriptions().is_empty());
}

#[tokio::test]
async fn test_ring_timeout_ends_unanswered_call() {
    let config = CallConfig::default().with_ring_timeout(Duration::from_millis(50));
    let alice = ringing_caller(config).await;

    for _ in 0..100 {
        if alice.controller.snapshot().await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(
        alice.controller.last_ended().await.unwrap().end_reason,
        Some(EndReason::Timeout)
    );
    assert_eq!(alice.transport.sent_kinds(), vec!["offer", "endCall"]);
}

#[tokio::test]
async fn test_ring_timeout_does_not_touch_answered_call() {
    let config = CallConfig::default().with_ring_timeout(Duration::from_millis(50));
    let alice = ringing_caller(config).await;
    alice.controller.handle_signal(answer_from("bob")).await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        alice.controller.snapshot().await.unwrap().lifecycle,
        Lifecycle::Active
    );
}

#[tokio::test]
async fn test_relay_failure_ends_call_being_set_up() {
    let alice = ringing_caller(CallConfig::default()).await;
    let mut events = alice.controller.subscribe();

    alice
        .controller
        .handle_signal(InboundSignal::CallFailed {
            reason: "bob is not connected".into(),
        })
        .await;

    next_event(&mut events, |e| matches!(e, CallEvent::Failed { .. })).await;
    assert_eq!(
        alice.controller.last_ended().await.unwrap().end_reason,
        Some(EndReason::NegotiationFailed("bob is not connected".into()))
    );
}

#[tokio::test]
async fn test_signaling_loss_ends_only_unestablished_calls() {
    let config = CallConfig::default().with_reconnect_grace(Duration::from_millis(50));

    let ringing = ringing_caller(config.clone()).await;
    let mut events = ringing.controller.subscribe();
    ringing.controller.on_connectivity(false);
    next_event(&mut events, |e| *e == CallEvent::ConnectivityWarning).await;
    next_event(&mut events, |e| matches!(e, CallEvent::Ended { .. })).await;
    assert_eq!(
        ringing.controller.last_ended().await.unwrap().end_reason,
        Some(EndReason::TransportLost)
    );

    let active = ringing_caller(config).await;
    active.controller.handle_signal(answer_from("bob")).await;
    let mut events = active.controller.subscribe();
    active.controller.on_connectivity(false);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        active.controller.snapshot().await.unwrap().lifecycle,
        Lifecycle::Active
    );
    active.controller.on_connectivity(true);
    next_event(&mut events, |e| *e == CallEvent::ConnectivityRestored).await;
}

#[tokio::test]
async fn test_reconnect_within_grace_keeps_call() {
    let config = CallConfig::default().with_reconnect_grace(Duration::from_millis(100));
    let alice = ringing_caller(config).await;

    alice.controller.on_connectivity(false);
    alice.controller.on_connectivity(true);
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(
        alice.controller.snapshot().await.unwrap().lifecycle,
        Lifecycle::Ringing
    );
}

#[tokio::test]
async fn test_local_candidates_are_forwarded() {
    let alice = ringing_caller(CallConfig::default()).await;
    let pc = alice.connections.last().unwrap();

    pc.emit(PeerEvent::LocalCandidate(candidate(5))).await;
    eventually(|| {
        alice.transport.sent().last()
            == Some(&(
                PeerId::new("bob"),
                SignalMessage::Candidate {
                    candidate: candidate(5),
                },
            ))
    })
    .await;
}

#[tokio::test]
async fn test_connection_failure_ends_call() {
    let alice = ringing_caller(CallConfig::default()).await;
    alice.controller.handle_signal(answer_from("bob")).await;
    let mut events = alice.controller.subscribe();

    let pc = alice.connections.last().unwrap();
    pc.emit(PeerEvent::StateChanged(ConnectionState::Failed)).await;

    next_event(&mut events, |e| matches!(e, CallEvent::Failed { .. })).await;
    next_event(&mut events, |e| matches!(e, CallEvent::Ended { .. })).await;
    assert_eq!(
        alice.controller.last_ended().await.unwrap().end_reason,
        Some(EndReason::NegotiationFailed("connection failed".into()))
    );
    assert_eq!(alice.transport.sent_kinds(), vec!["offer", "endCall"]);
}

#[tokio::test]
async fn test_snapshot_tracks_negotiation() {
    let alice = ringing_caller(CallConfig::default()).await;
    let snapshot = alice.controller.snapshot().await.unwrap();
    assert_eq!(snapshot.role, CallRole::Caller);
    assert_eq!(snapshot.lifecycle, Lifecycle::Ringing);
    assert_eq!(snapshot.signaling_state, SignalingState::HaveLocalOffer);
    assert!(snapshot.connected_at.is_none());

    alice.controller.handle_signal(answer_from("bob")).await;
    let snapshot = alice.controller.snapshot().await.unwrap();
    assert!(snapshot.connected_at.is_some());

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["lifecycle"], "Active");
    assert_eq!(json["remote_peer"], "bob");
}

/// Hands every offer's answer back to the controller before `send` returns,
/// like a relay that is faster than the local task.
#[derive(Default)]
struct InstantAnswerTransport {
    controller: OnceLock<Weak<CallController>>,
    sent: StdMutex<Vec<&'static str>>,
}

#[async_trait]
impl SignalingTransport for InstantAnswerTransport {
    async fn send(&self, to: &PeerId, message: SignalMessage) -> Result<(), TransportError> {
        let is_offer = matches!(message, SignalMessage::Offer { .. });
        self.sent.lock().unwrap().push(message.kind());
        if is_offer
            && let Some(controller) = self.controller.get().and_then(Weak::upgrade)
        {
            controller.handle_signal(answer_from(to.as_str())).await;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_answer_during_offer_send_leaves_events_in_order() {
    let transport = Arc::new(InstantAnswerTransport::default());
    let config = CallConfig::default().with_ring_timeout(Duration::from_millis(50));
    let alice = CallController::new(
        PeerId::new("alice"),
        config,
        transport.clone(),
        FakeMediaSource::new(),
        FakeConnectionFactory::new(),
    );
    assert!(transport.controller.set(Arc::downgrade(&alice)).is_ok());
    let mut events = alice.subscribe();

    let outcome = alice
        .place_call(PeerId::new("bob"), MediaKind::Audio)
        .await
        .unwrap();
    assert_eq!(outcome, IntentOutcome::Done);
    assert_eq!(*transport.sent.lock().unwrap(), vec!["offer"]);

    let seen = drain(&mut events);
    let position = |wanted: fn(&CallEvent) -> bool| {
        seen.iter()
            .position(wanted)
            .expect("event was not published")
    };
    let ringing = position(|e| matches!(e, CallEvent::Ringing { .. }));
    let active = position(|e| matches!(e, CallEvent::Active { .. }));
    assert!(ringing < active, "events out of order: {seen:?}");
    assert_eq!(
        seen.iter()
            .filter_map(|e| match e {
                CallEvent::SignalingStateChanged { state } => Some(*state),
                _ => None,
            })
            .collect::<Vec<_>>(),
        vec![SignalingState::HaveLocalOffer, SignalingState::Stable]
    );

    // The ring timer has nothing to end once the call is up.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let snapshot = alice.snapshot().await.unwrap();
    assert_eq!(snapshot.lifecycle, Lifecycle::Active);
    assert_eq!(snapshot.signaling_state, SignalingState::Stable);
}
