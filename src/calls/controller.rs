//! The call session controller.
//!
//! Owns the single call slot, turns user intents and inbound signaling into
//! negotiation steps, and publishes [`CallEvent`]s. Lock order is slot, then
//! session; neither is held across a call into the media source, the peer
//! connection or the signaling transport.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use callcore::{
    CallId, CallRole, CallSession, CallSnapshot, EndReason, IceCandidate, InboundSignal,
    Lifecycle, LifecycleTransition, MediaKind, PeerId, SessionDescription, SignalMessage,
    SignalingState,
};
use log::{debug, error, info, trace, warn};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::error::CallError;
use super::negotiation::{Negotiated, NegotiationEngine, SessionHandle};
use crate::config::CallConfig;
use crate::events::CallEvent;
use crate::media::{LocalTracks, MediaSource};
use crate::peer::{ConnectionState, PeerConnectionFactory, PeerEvent};
use crate::signaling::SignalingTransport;

/// Result of a user intent that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentOutcome {
    Done,
    /// The call was ended by something else while the intent was running.
    Stale,
    Refused(Refusal),
}

/// Why an intent was not carried out. Nothing changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    CallInProgress,
    /// Empty identity, or our own.
    InvalidPeer,
    NothingToAccept,
    NothingToDecline,
    NothingToHangUp,
}

/// What to tell the remote peer when a call ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Farewell {
    Silent,
    /// `EndCall`, if the remote peer knows about the call.
    HangUp,
    Decline,
}

struct ActiveCall {
    id: CallId,
    peer: PeerId,
    session: SessionHandle,
    engine: Option<Arc<NegotiationEngine>>,
    pump: Option<JoinHandle<()>>,
    intent_in_flight: bool,
}

impl ActiveCall {
    fn new(session: CallSession) -> Self {
        Self {
            id: session.id.clone(),
            peer: session.remote_peer.clone(),
            session: Arc::new(Mutex::new(session)),
            engine: None,
            pump: None,
            intent_in_flight: false,
        }
    }
}

/// An engine bound to the current call. Local candidates are held back
/// until `release_candidates` is set, i.e. until our description has been
/// sent.
struct Attached {
    engine: Arc<NegotiationEngine>,
    release_candidates: watch::Sender<bool>,
}

pub struct CallController {
    local_peer: PeerId,
    config: CallConfig,
    signaling: Arc<dyn SignalingTransport>,
    media: Arc<dyn MediaSource>,
    connections: Arc<dyn PeerConnectionFactory>,
    slot: Mutex<Option<ActiveCall>>,
    last_ended: Mutex<Option<CallSnapshot>>,
    events: broadcast::Sender<CallEvent>,
    connected: AtomicBool,
    connectivity_epoch: AtomicU64,
    me: Weak<Self>,
}

impl CallController {
    pub fn new(
        local_peer: PeerId,
        config: CallConfig,
        signaling: Arc<dyn SignalingTransport>,
        media: Arc<dyn MediaSource>,
        connections: Arc<dyn PeerConnectionFactory>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Arc::new_cyclic(|me| Self {
            local_peer,
            config,
            signaling,
            media,
            connections,
            slot: Mutex::new(None),
            last_ended: Mutex::new(None),
            events,
            connected: AtomicBool::new(true),
            connectivity_epoch: AtomicU64::new(0),
            me: me.clone(),
        })
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// The current call, if any.
    pub async fn snapshot(&self) -> Option<CallSnapshot> {
        let slot = self.slot.lock().await;
        let call = slot.as_ref()?;
        Some(call.session.lock().await.snapshot())
    }

    /// The most recently ended call.
    pub async fn last_ended(&self) -> Option<CallSnapshot> {
        self.last_ended.lock().await.clone()
    }

    pub fn is_signaling_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn publish(&self, event: CallEvent) {
        trace!(target: "Call/Controller", "event: {event:?}");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn is_current(&self, id: &CallId) -> bool {
        matches!(self.slot.lock().await.as_ref(), Some(call) if call.id == *id)
    }

    async fn current_from(
        &self,
        from: &PeerId,
    ) -> Option<(CallId, SessionHandle, Option<Arc<NegotiationEngine>>)> {
        let slot = self.slot.lock().await;
        match slot.as_ref() {
            Some(call) if call.peer == *from => {
                Some((call.id.clone(), call.session.clone(), call.engine.clone()))
            }
            _ => None,
        }
    }

    /// The current call, unless it is already Active.
    async fn unestablished_call(&self) -> Option<CallId> {
        let slot = self.slot.lock().await;
        let call = slot.as_ref()?;
        let lifecycle = call.session.lock().await.lifecycle();
        (lifecycle != Lifecycle::Active).then(|| call.id.clone())
    }

    async fn clear_intent(&self, id: &CallId) {
        if let Some(call) = self.slot.lock().await.as_mut()
            && call.id == *id
        {
            call.intent_in_flight = false;
        }
    }

    // ---------------------------------------------------------------------
    // Intents
    // ---------------------------------------------------------------------

    /// Start an outgoing call.
    pub async fn place_call(
        &self,
        remote: PeerId,
        media: MediaKind,
    ) -> Result<IntentOutcome, CallError> {
        if remote.is_empty() || remote == self.local_peer {
            return Ok(IntentOutcome::Refused(Refusal::InvalidPeer));
        }

        let (id, session) = {
            let mut slot = self.slot.lock().await;
            if slot.is_some() {
                debug!(target: "Call/Controller", "place_call to {remote} refused: call in progress");
                return Ok(IntentOutcome::Refused(Refusal::CallInProgress));
            }
            let mut call = ActiveCall::new(CallSession::new_outgoing(remote.clone(), media));
            call.intent_in_flight = true;
            let handle = (call.id.clone(), call.session.clone());
            *slot = Some(call);
            handle
        };
        info!(target: "Call/Controller", "placing {media} call {id} to {remote}");

        let tracks = match self.media.acquire(media).await {
            Ok(tracks) => tracks,
            Err(e) => {
                return self
                    .fail(&id, EndReason::MediaUnavailable(e.to_string()), e)
                    .await;
            }
        };

        let Some(attached) = self.attach_engine(&id, &remote, media, tracks).await? else {
            return Ok(IntentOutcome::Stale);
        };

        let offer = match attached.engine.create_offer().await {
            Ok(Negotiated::Applied(offer)) => offer,
            Ok(Negotiated::Stale) => return Ok(IntentOutcome::Stale),
            Ok(Negotiated::Guarded(violation)) => {
                debug!(target: "Call/Controller", "call {id}: offer not created: {violation}");
                return Ok(IntentOutcome::Stale);
            }
            Err(e) => {
                return self
                    .fail(&id, EndReason::NegotiationFailed(e.to_string()), e)
                    .await;
            }
        };

        {
            let mut session = session.lock().await;
            if session.is_ended() {
                return Ok(IntentOutcome::Stale);
            }
            if let Err(e) = session.transition(LifecycleTransition::OfferSent) {
                warn!(target: "Call/Controller", "call {id}: {e}");
                return Ok(IntentOutcome::Stale);
            }
        }
        // Published before the send: the answer may be handled while the
        // offer is still on the wire.
        self.publish(CallEvent::SignalingStateChanged {
            state: SignalingState::HaveLocalOffer,
        });
        self.publish(CallEvent::Ringing {
            peer: remote.clone(),
            role: CallRole::Caller,
            media,
        });
        self.start_ring_timer(id.clone());

        let message = SignalMessage::Offer {
            media,
            description: offer,
        };
        if let Err(e) = self.signaling.send(&remote, message).await {
            return self.fail(&id, EndReason::TransportLost, e).await;
        }

        if session.lock().await.is_ended() {
            // Hung up while the offer was on the wire; make sure the remote
            // side hears about it after the offer.
            let _ = self.signaling.send(&remote, SignalMessage::EndCall).await;
            return Ok(IntentOutcome::Stale);
        }

        let _ = attached.release_candidates.send(true);
        self.clear_intent(&id).await;
        Ok(IntentOutcome::Done)
    }

    /// Answer the ringing incoming call.
    pub async fn accept_incoming(&self) -> Result<IntentOutcome, CallError> {
        let (id, peer, session, media) = {
            let mut slot = self.slot.lock().await;
            let Some(call) = slot.as_mut() else {
                return Ok(IntentOutcome::Refused(Refusal::NothingToAccept));
            };
            let (acceptable, media) = {
                let session = call.session.lock().await;
                let acceptable = !call.intent_in_flight
                    && session.role == CallRole::Callee
                    && session.lifecycle() == Lifecycle::Ringing
                    && session.signaling_state() == SignalingState::Stable
                    && session.last_offer().is_some();
                (acceptable, session.media)
            };
            if !acceptable {
                return Ok(IntentOutcome::Refused(Refusal::NothingToAccept));
            }
            call.intent_in_flight = true;
            (call.id.clone(), call.peer.clone(), call.session.clone(), media)
        };
        info!(target: "Call/Controller", "accepting call {id} from {peer}");

        let tracks = match self.media.acquire(media).await {
            Ok(tracks) => tracks,
            Err(e) => {
                return self
                    .fail(&id, EndReason::MediaUnavailable(e.to_string()), e)
                    .await;
            }
        };

        let Some(attached) = self.attach_engine(&id, &peer, media, tracks).await? else {
            return Ok(IntentOutcome::Stale);
        };

        // The offer stays with the session until it has been applied.
        let Some(offer) = session.lock().await.last_offer().cloned() else {
            return Ok(IntentOutcome::Stale);
        };

        let answer = match attached.engine.accept_offer(offer).await {
            Ok(Negotiated::Applied(answer)) => answer,
            Ok(Negotiated::Stale) => return Ok(IntentOutcome::Stale),
            Ok(Negotiated::Guarded(violation)) => {
                // The session can no longer take this offer; end the call.
                error!(target: "Call/Controller", "call {id}: cannot accept: {violation}");
                self.publish(CallEvent::Failed {
                    message: format!("cannot accept: {violation}"),
                });
                self.end_call(
                    &id,
                    EndReason::NegotiationFailed(violation.to_string()),
                    Farewell::HangUp,
                )
                .await;
                return Ok(IntentOutcome::Refused(Refusal::NothingToAccept));
            }
            Err(e) => {
                return self
                    .fail(&id, EndReason::NegotiationFailed(e.to_string()), e)
                    .await;
            }
        };

        session.lock().await.take_last_offer();

        let message = SignalMessage::Answer {
            description: answer,
        };
        if let Err(e) = self.signaling.send(&peer, message).await {
            return self.fail(&id, EndReason::TransportLost, e).await;
        }

        {
            let mut session = session.lock().await;
            if session.is_ended() {
                return Ok(IntentOutcome::Stale);
            }
            if let Err(e) = session.transition(LifecycleTransition::Accepted) {
                warn!(target: "Call/Controller", "call {id}: {e}");
                return Ok(IntentOutcome::Stale);
            }
        }

        let _ = attached.release_candidates.send(true);
        self.clear_intent(&id).await;
        self.publish(CallEvent::SignalingStateChanged {
            state: SignalingState::Stable,
        });
        self.publish(CallEvent::Active { peer });
        Ok(IntentOutcome::Done)
    }

    /// Refuse the ringing incoming call.
    pub async fn decline_incoming(&self) -> IntentOutcome {
        let id = {
            let slot = self.slot.lock().await;
            let Some(call) = slot.as_ref() else {
                return IntentOutcome::Refused(Refusal::NothingToDecline);
            };
            let session = call.session.lock().await;
            if session.role != CallRole::Callee || session.lifecycle() != Lifecycle::Ringing {
                return IntentOutcome::Refused(Refusal::NothingToDecline);
            }
            call.id.clone()
        };
        match self.end_call(&id, EndReason::Declined, Farewell::Decline).await {
            Some(_) => IntentOutcome::Done,
            None => IntentOutcome::Stale,
        }
    }

    /// End the current call from any state.
    pub async fn hang_up(&self) -> IntentOutcome {
        let Some(id) = self.slot.lock().await.as_ref().map(|call| call.id.clone()) else {
            return IntentOutcome::Refused(Refusal::NothingToHangUp);
        };
        match self.end_call(&id, EndReason::LocalHangUp, Farewell::HangUp).await {
            Some(_) => IntentOutcome::Done,
            None => IntentOutcome::Stale,
        }
    }

    // ---------------------------------------------------------------------
    // Inbound signaling
    // ---------------------------------------------------------------------

    pub async fn handle_signal(&self, signal: InboundSignal) {
        let (from, message) = match signal {
            InboundSignal::CallFailed { reason } => return self.on_call_failed(reason).await,
            InboundSignal::Message { from, message } => (from, message),
        };
        if let Err(e) = message.validate() {
            warn!(target: "Call/Controller", "dropping malformed {} from {from}: {e}", message.kind());
            return;
        }
        trace!(target: "Call/Controller", "<-- {} from {from}", message.kind());
        match message {
            SignalMessage::Offer { media, description } => {
                self.on_offer(from, media, description).await
            }
            SignalMessage::Answer { description } => self.on_answer(from, description).await,
            SignalMessage::Candidate { candidate } => self.on_candidate(from, candidate).await,
            SignalMessage::EndCall => self.on_remote_end(from, EndReason::RemoteHangUp).await,
            SignalMessage::DeclineCall { busy } => {
                let reason = if busy {
                    EndReason::Busy
                } else {
                    EndReason::RemoteDeclined
                };
                self.on_remote_end(from, reason).await
            }
        }
    }

    async fn on_offer(&self, from: PeerId, media: MediaKind, offer: SessionDescription) {
        let mut slot = self.slot.lock().await;
        if let Some(call) = slot.as_ref() {
            let same_peer = call.peer == from;
            drop(slot);
            // A second offer from our own remote peer is refused the same
            // way; the call it belongs to is left alone.
            info!(
                target: "Call/Controller",
                "busy, declining offer from {from}{}",
                if same_peer { " (already in a call with them)" } else { "" }
            );
            if let Err(e) = self
                .signaling
                .send(&from, SignalMessage::DeclineCall { busy: true })
                .await
            {
                warn!(target: "Call/Controller", "failed to send busy to {from}: {e}");
            }
            self.publish(CallEvent::Busy { from });
            return;
        }

        let mut session = CallSession::new_incoming(from.clone(), media, offer);
        if let Err(e) = session.transition(LifecycleTransition::OfferReceived) {
            warn!(target: "Call/Controller", "incoming offer from {from}: {e}");
            return;
        }
        let call = ActiveCall::new(session);
        let id = call.id.clone();
        *slot = Some(call);
        drop(slot);

        info!(target: "Call/Controller", "incoming {media} call {id} from {from}");
        self.publish(CallEvent::Ringing {
            peer: from,
            role: CallRole::Callee,
            media,
        });
        self.start_ring_timer(id);
    }

    async fn on_answer(&self, from: PeerId, answer: SessionDescription) {
        let Some((id, session, engine)) = self.current_from(&from).await else {
            debug!(target: "Call/Controller", "answer from {from} matches no call");
            return;
        };
        let Some(engine) = engine else {
            debug!(target: "Call/Controller", "call {id}: answer before offer, ignored");
            return;
        };

        match engine.apply_answer(answer).await {
            Ok(Negotiated::Applied(())) => {
                {
                    let mut session = session.lock().await;
                    if session.is_ended() {
                        return;
                    }
                    if let Err(e) = session.transition(LifecycleTransition::AnswerApplied) {
                        warn!(target: "Call/Controller", "call {id}: {e}");
                        return;
                    }
                }
                info!(target: "Call/Controller", "call {id} with {from} is active");
                self.publish(CallEvent::SignalingStateChanged {
                    state: SignalingState::Stable,
                });
                self.publish(CallEvent::Active { peer: from });
            }
            Ok(Negotiated::Guarded(violation)) => {
                debug!(target: "Call/Controller", "call {id}: answer ignored: {violation}");
            }
            Ok(Negotiated::Stale) => {}
            Err(e) => {
                error!(target: "Call/Controller", "call {id}: applying answer failed: {e}");
                self.publish(CallEvent::Failed {
                    message: e.to_string(),
                });
                self.end_call(&id, EndReason::NegotiationFailed(e.to_string()), Farewell::HangUp)
                    .await;
            }
        }
    }

    async fn on_candidate(&self, from: PeerId, candidate: IceCandidate) {
        let Some((id, session, engine)) = self.current_from(&from).await else {
            trace!(target: "Call/Controller", "candidate from {from} matches no call");
            return;
        };
        let Some(engine) = engine else {
            // Not accepted yet; the engine drains these once it exists.
            if !session.lock().await.queue_candidate(candidate) {
                debug!(target: "Call/Controller", "call {id}: candidate dropped");
            }
            return;
        };
        match engine.queue_or_apply_candidate(candidate).await {
            Ok(Negotiated::Applied(disposition)) => {
                trace!(target: "Call/Controller", "call {id}: candidate {disposition:?}");
            }
            Ok(other) => debug!(target: "Call/Controller", "call {id}: candidate ignored ({other:?})"),
            Err(e) => warn!(target: "Call/Controller", "call {id}: {e}"),
        }
    }

    async fn on_remote_end(&self, from: PeerId, reason: EndReason) {
        let Some((id, _, _)) = self.current_from(&from).await else {
            debug!(target: "Call/Controller", "end ({reason}) from {from} matches no call");
            return;
        };
        self.end_call(&id, reason, Farewell::Silent).await;
    }

    /// The relay could not deliver something we sent. Fatal to a call that
    /// is still being set up.
    async fn on_call_failed(&self, reason: String) {
        let Some(id) = self.unestablished_call().await else {
            warn!(target: "Call/Controller", "relay reported failure: {reason}");
            return;
        };
        warn!(target: "Call/Controller", "call {id} failed: {reason}");
        self.publish(CallEvent::Failed {
            message: reason.clone(),
        });
        self.end_call(&id, EndReason::NegotiationFailed(reason), Farewell::Silent)
            .await;
    }

    /// The signaling transport lost or regained its connection.
    pub fn on_connectivity(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::AcqRel) == connected {
            return;
        }
        let epoch = self.connectivity_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        if connected {
            info!(target: "Call/Controller", "signaling restored");
            self.publish(CallEvent::ConnectivityRestored);
            return;
        }

        warn!(target: "Call/Controller", "signaling lost");
        self.publish(CallEvent::ConnectivityWarning);

        let me = self.me.clone();
        let grace = self.config.reconnect_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(this) = me.upgrade() else { return };
            if this.connectivity_epoch.load(Ordering::Acquire) != epoch {
                return;
            }
            if let Some(id) = this.unestablished_call().await {
                warn!(target: "Call/Controller", "call {id}: signaling did not recover");
                this.end_call(&id, EndReason::TransportLost, Farewell::Silent)
                    .await;
            }
        });
    }

    // ---------------------------------------------------------------------
    // Plumbing
    // ---------------------------------------------------------------------

    async fn attach_engine(
        &self,
        id: &CallId,
        peer: &PeerId,
        media: MediaKind,
        tracks: LocalTracks,
    ) -> Result<Option<Attached>, CallError> {
        let (connection, events) = match self.connections.create(media, &tracks).await {
            Ok(created) => created,
            Err(e) => {
                let reason = EndReason::NegotiationFailed(e.to_string());
                return match self.fail(id, reason, e).await {
                    Ok(_) => Ok(None),
                    Err(e) => Err(e),
                };
            }
        };

        let mut slot = self.slot.lock().await;
        if !matches!(slot.as_ref(), Some(call) if call.id == *id) {
            drop(slot);
            drop(tracks);
            connection.close().await;
            return Ok(None);
        }
        let Some(call) = slot.as_mut() else {
            return Ok(None);
        };

        let engine = Arc::new(NegotiationEngine::new(
            call.session.clone(),
            connection,
            tracks,
        ));
        let (release_candidates, released) = watch::channel(false);
        call.engine = Some(engine.clone());
        call.pump = Some(self.spawn_pump(id.clone(), peer.clone(), events, released));
        Ok(Some(Attached {
            engine,
            release_candidates,
        }))
    }

    /// Forward peer connection events for one call.
    fn spawn_pump(
        &self,
        id: CallId,
        peer: PeerId,
        mut events: mpsc::Receiver<PeerEvent>,
        mut released: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let me = self.me.clone();
        tokio::spawn(async move {
            let mut candidates_open = false;
            while let Some(event) = events.recv().await {
                let Some(this) = me.upgrade() else { return };
                match event {
                    PeerEvent::LocalCandidate(candidate) => {
                        if !candidates_open {
                            if released.wait_for(|open| *open).await.is_err() {
                                return;
                            }
                            candidates_open = true;
                        }
                        let message = SignalMessage::Candidate { candidate };
                        if let Err(e) = this.signaling.send(&peer, message).await {
                            warn!(target: "Call/Controller", "call {id}: failed to send candidate: {e}");
                        }
                    }
                    PeerEvent::StateChanged(ConnectionState::Failed) => {
                        error!(target: "Call/Controller", "call {id}: peer connection failed");
                        // Ending the call aborts this task, so do it elsewhere.
                        let id = id.clone();
                        tokio::spawn(async move {
                            if this.is_current(&id).await {
                                this.publish(CallEvent::Failed {
                                    message: "connection failed".into(),
                                });
                                this.end_call(
                                    &id,
                                    EndReason::NegotiationFailed("connection failed".into()),
                                    Farewell::HangUp,
                                )
                                .await;
                            }
                        });
                        return;
                    }
                    PeerEvent::StateChanged(state) => {
                        debug!(target: "Call/Controller", "call {id}: connection {state:?}");
                    }
                }
            }
        })
    }

    fn start_ring_timer(&self, id: CallId) {
        let me = self.me.clone();
        let timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(this) = me.upgrade() else { return };
            let ringing = {
                let slot = this.slot.lock().await;
                match slot.as_ref() {
                    Some(call) if call.id == id => {
                        call.session.lock().await.lifecycle() == Lifecycle::Ringing
                    }
                    _ => false,
                }
            };
            if ringing {
                info!(target: "Call/Controller", "call {id}: no answer after {timeout:?}");
                this.end_call(&id, EndReason::Timeout, Farewell::HangUp)
                    .await;
            }
        });
    }

    /// Publish the failure, end the call and hand the error back. If the
    /// call is already gone the failure is moot.
    async fn fail<E: Into<CallError>>(
        &self,
        id: &CallId,
        reason: EndReason,
        err: E,
    ) -> Result<IntentOutcome, CallError> {
        if !self.is_current(id).await {
            return Ok(IntentOutcome::Stale);
        }
        let err = err.into();
        error!(target: "Call/Controller", "call {id} failed: {err}");
        self.publish(CallEvent::Failed {
            message: err.to_string(),
        });
        self.end_call(id, reason, Farewell::HangUp).await;
        Err(err)
    }

    /// Take call `id` out of the slot, end it and release everything it
    /// holds. Returns `None` if `id` is not the current call.
    async fn end_call(
        &self,
        id: &CallId,
        reason: EndReason,
        farewell: Farewell,
    ) -> Option<CallSnapshot> {
        let call = {
            let mut slot = self.slot.lock().await;
            if !matches!(slot.as_ref(), Some(call) if call.id == *id) {
                return None;
            }
            slot.take()?
        };

        let (was_engaged, snapshot) = {
            let mut session = call.session.lock().await;
            let was_engaged = session.lifecycle().is_engaged();
            session.end(reason.clone());
            (was_engaged, session.snapshot())
        };
        info!(target: "Call/Controller", "call {id} with {} ended: {reason}", call.peer);

        if let Some(pump) = &call.pump {
            pump.abort();
        }
        if let Some(engine) = &call.engine {
            engine.close().await;
        }

        let message = match farewell {
            Farewell::HangUp if was_engaged => Some(SignalMessage::EndCall),
            Farewell::Decline => Some(SignalMessage::DeclineCall { busy: false }),
            Farewell::HangUp | Farewell::Silent => None,
        };
        if let Some(message) = message
            && let Err(e) = self.signaling.send(&call.peer, message).await
        {
            warn!(target: "Call/Controller", "call {id}: could not notify {}: {e}", call.peer);
        }

        self.publish(CallEvent::SignalingStateChanged {
            state: SignalingState::Closed,
        });
        self.publish(CallEvent::Ended {
            peer: call.peer.clone(),
            reason,
            duration_secs: snapshot.duration_secs,
        });
        *self.last_ended.lock().await = Some(snapshot.clone());
        Some(snapshot)
    }
}
