//! The single owned record of one call.

use crate::description::{IceCandidate, SessionDescription};
use crate::state::{
    EndReason, InvalidTransition, Lifecycle, LifecycleTransition, NegotiationStep, SignalingState,
};
use crate::types::{CallId, CallRole, MediaKind, PeerId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

/// Measures how long a call has been Active.
#[derive(Debug, Clone, Default)]
pub struct CallTimer {
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
}

impl CallTimer {
    pub fn start(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn stop(&mut self) {
        if self.started_at.is_some() && self.stopped_at.is_none() {
            self.stopped_at = Some(Utc::now());
        }
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some() && self.stopped_at.is_none()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Elapsed time between start and stop (or now, while running).
    /// `None` if the call never became Active.
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        let end = self.stopped_at.unwrap_or_else(Utc::now);
        Some(end.signed_duration_since(start))
    }
}

/// Why a negotiation step may not run right now.
///
/// These are control-flow outcomes: the event that triggered the step is
/// dropped and the session is left as it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardViolation {
    SessionEnded,
    SignalingState {
        expected: SignalingState,
        actual: SignalingState,
    },
    StepInFlight(NegotiationStep),
    RemoteDescriptionApplied,
    Lifecycle(InvalidTransition),
}

impl fmt::Display for GuardViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionEnded => f.write_str("session already ended"),
            Self::SignalingState { expected, actual } => {
                write!(f, "signaling state is {actual}, expected {expected}")
            }
            Self::StepInFlight(step) => write!(f, "{step:?} already in flight"),
            Self::RemoteDescriptionApplied => f.write_str("remote description already applied"),
            Self::Lifecycle(err) => err.fmt(f),
        }
    }
}

/// One active or pending call.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: CallId,
    pub remote_peer: PeerId,
    pub role: CallRole,
    pub media: MediaKind,
    pub created_at: DateTime<Utc>,
    signaling_state: SignalingState,
    lifecycle: Lifecycle,
    pending_remote_candidates: VecDeque<IceCandidate>,
    last_offer: Option<SessionDescription>,
    remote_description_applied: bool,
    in_flight: Option<NegotiationStep>,
    timer: CallTimer,
    end_reason: Option<EndReason>,
}

impl CallSession {
    fn new(remote_peer: PeerId, role: CallRole, media: MediaKind) -> Self {
        Self {
            id: CallId::generate(),
            remote_peer,
            role,
            media,
            created_at: Utc::now(),
            signaling_state: SignalingState::Stable,
            lifecycle: Lifecycle::Idle,
            pending_remote_candidates: VecDeque::new(),
            last_offer: None,
            remote_description_applied: false,
            in_flight: None,
            timer: CallTimer::default(),
            end_reason: None,
        }
    }

    pub fn new_outgoing(remote_peer: PeerId, media: MediaKind) -> Self {
        Self::new(remote_peer, CallRole::Caller, media)
    }

    /// A callee session holding the unconsumed offer. Still Idle: the
    /// controller moves it to Ringing once it has claimed the call slot.
    pub fn new_incoming(remote_peer: PeerId, media: MediaKind, offer: SessionDescription) -> Self {
        let mut session = Self::new(remote_peer, CallRole::Callee, media);
        session.last_offer = Some(offer);
        session
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.signaling_state
    }

    pub fn is_ended(&self) -> bool {
        self.lifecycle.is_ended()
    }

    pub fn is_caller(&self) -> bool {
        self.role == CallRole::Caller
    }

    pub fn last_offer(&self) -> Option<&SessionDescription> {
        self.last_offer.as_ref()
    }

    pub fn take_last_offer(&mut self) -> Option<SessionDescription> {
        self.last_offer.take()
    }

    pub fn remote_description_applied(&self) -> bool {
        self.remote_description_applied
    }

    pub fn in_flight(&self) -> Option<NegotiationStep> {
        self.in_flight
    }

    pub fn pending_candidates(&self) -> &VecDeque<IceCandidate> {
        &self.pending_remote_candidates
    }

    pub fn end_reason(&self) -> Option<&EndReason> {
        self.end_reason.as_ref()
    }

    pub fn timer(&self) -> &CallTimer {
        &self.timer
    }

    /// Apply a lifecycle transition and its side effects.
    pub fn transition(&mut self, transition: LifecycleTransition) -> Result<(), InvalidTransition> {
        let next = self.lifecycle.next(self.role, &transition)?;
        log::debug!(
            target: "Call/State",
            "call {} ({}): {} -> {}",
            self.id,
            self.role,
            self.lifecycle,
            next
        );
        self.lifecycle = next;
        match (next, transition) {
            (Lifecycle::Active, _) => self.timer.start(),
            (Lifecycle::Ended, LifecycleTransition::Ended(reason)) => {
                self.timer.stop();
                self.pending_remote_candidates.clear();
                self.last_offer = None;
                self.in_flight = None;
                self.signaling_state = SignalingState::Closed;
                self.end_reason = Some(reason);
            }
            _ => {}
        }
        Ok(())
    }

    /// Force the session to Ended. Returns `false` if it already was.
    pub fn end(&mut self, reason: EndReason) -> bool {
        if self.is_ended() {
            return false;
        }
        // Every non-terminal state may end.
        self.transition(LifecycleTransition::Ended(reason)).is_ok()
    }

    /// Check that `step` may start from `expected` and mark it in flight.
    pub fn begin_step(
        &mut self,
        step: NegotiationStep,
        expected: SignalingState,
    ) -> Result<(), GuardViolation> {
        if self.is_ended() {
            return Err(GuardViolation::SessionEnded);
        }
        if let Some(current) = self.in_flight {
            return Err(GuardViolation::StepInFlight(current));
        }
        if matches!(step, NegotiationStep::AcceptOffer | NegotiationStep::ApplyAnswer)
            && self.remote_description_applied
        {
            return Err(GuardViolation::RemoteDescriptionApplied);
        }
        if self.signaling_state != expected {
            return Err(GuardViolation::SignalingState {
                expected,
                actual: self.signaling_state,
            });
        }
        self.in_flight = Some(step);
        Ok(())
    }

    /// Clear the in-flight marker without committing anything.
    pub fn abort_step(&mut self) {
        self.in_flight = None;
    }

    pub fn finish_step(&mut self, state: SignalingState) {
        self.in_flight = None;
        self.signaling_state = state;
    }

    pub fn set_signaling_state(&mut self, state: SignalingState) {
        self.signaling_state = state;
    }

    /// Record that the remote description is in place and hand back every
    /// buffered candidate, oldest first. The queue is empty afterwards and
    /// stays empty for the rest of the session.
    pub fn mark_remote_applied(&mut self) -> Vec<IceCandidate> {
        self.remote_description_applied = true;
        self.pending_remote_candidates.drain(..).collect()
    }

    /// Buffer a candidate that arrived before the remote description.
    /// Returns `false` (and buffers nothing) once the remote description
    /// has been applied or the session has ended.
    pub fn queue_candidate(&mut self, candidate: IceCandidate) -> bool {
        if self.remote_description_applied || self.is_ended() {
            return false;
        }
        self.pending_remote_candidates.push_back(candidate);
        true
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.id.clone(),
            remote_peer: self.remote_peer.clone(),
            role: self.role,
            media: self.media,
            lifecycle: self.lifecycle,
            signaling_state: self.signaling_state,
            pending_candidates: self.pending_remote_candidates.len(),
            connected_at: self.timer.started_at(),
            duration_secs: self.timer.duration().map(|d| d.num_seconds()),
            end_reason: self.end_reason.clone(),
        }
    }
}

/// Read-only view of a [`CallSession`] handed to the UI layer.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub call_id: CallId,
    pub remote_peer: PeerId,
    pub role: CallRole,
    pub media: MediaKind,
    pub lifecycle: Lifecycle,
    pub signaling_state: SignalingState,
    pub pending_candidates: usize,
    pub connected_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub end_reason: Option<EndReason>,
}
