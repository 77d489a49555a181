//! Call lifecycle and signaling-state machine.

use crate::types::CallRole;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// UI-facing lifecycle of a call. Independent of [`SignalingState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Lifecycle {
    /// Session exists but no offer has been sent or received yet.
    #[default]
    Idle,
    /// Offer sent (caller) or received (callee), waiting for the other side.
    Ringing,
    /// Both descriptions applied, media may flow.
    Active,
    /// Terminal.
    Ended,
}

impl Lifecycle {
    pub fn is_ended(self) -> bool {
        matches!(self, Self::Ended)
    }

    /// Ringing or Active: the states that make the local identity busy.
    pub fn is_engaged(self) -> bool {
        matches!(self, Self::Ringing | Self::Active)
    }

    /// Apply `transition` as seen by `role`.
    ///
    /// This is the whole transition table; anything not listed is an
    /// [`InvalidTransition`] and leaves the caller's state untouched.
    pub fn next(
        self,
        role: CallRole,
        transition: &LifecycleTransition,
    ) -> Result<Lifecycle, InvalidTransition> {
        use LifecycleTransition as T;
        let next = match (self, role, transition) {
            (Self::Idle, CallRole::Caller, T::OfferSent) => Self::Ringing,
            (Self::Idle, CallRole::Callee, T::OfferReceived) => Self::Ringing,
            (Self::Ringing, CallRole::Callee, T::Accepted) => Self::Active,
            (Self::Ringing, CallRole::Caller, T::AnswerApplied) => Self::Active,
            (Self::Idle | Self::Ringing | Self::Active, _, T::Ended(_)) => Self::Ended,
            (current, role, transition) => {
                return Err(InvalidTransition {
                    current,
                    role,
                    attempted: transition.name(),
                });
            }
        };
        Ok(next)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Mirrors the negotiation state of the underlying peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Events that drive [`Lifecycle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleTransition {
    OfferSent,
    OfferReceived,
    Accepted,
    AnswerApplied,
    Ended(EndReason),
}

impl LifecycleTransition {
    fn name(&self) -> &'static str {
        match self {
            Self::OfferSent => "OfferSent",
            Self::OfferReceived => "OfferReceived",
            Self::Accepted => "Accepted",
            Self::AnswerApplied => "AnswerApplied",
            Self::Ended(_) => "Ended",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition {attempted} for {role} in state {current}")]
pub struct InvalidTransition {
    pub current: Lifecycle,
    pub role: CallRole,
    pub attempted: &'static str,
}

/// Why a call reached [`Lifecycle::Ended`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EndReason {
    LocalHangUp,
    RemoteHangUp,
    /// We declined the incoming call.
    Declined,
    /// The remote peer declined our call.
    RemoteDeclined,
    /// The remote peer was already in a call.
    Busy,
    /// Nobody answered within the ring timeout.
    Timeout,
    MediaUnavailable(String),
    NegotiationFailed(String),
    /// Signaling was lost before the call was established.
    TransportLost,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalHangUp => f.write_str("hung up"),
            Self::RemoteHangUp => f.write_str("remote hung up"),
            Self::Declined => f.write_str("declined"),
            Self::RemoteDeclined => f.write_str("remote declined"),
            Self::Busy => f.write_str("remote busy"),
            Self::Timeout => f.write_str("no answer"),
            Self::MediaUnavailable(why) => write!(f, "media unavailable: {why}"),
            Self::NegotiationFailed(why) => write!(f, "negotiation failed: {why}"),
            Self::TransportLost => f.write_str("signaling connection lost"),
        }
    }
}

/// An asynchronous negotiation step that is currently suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NegotiationStep {
    CreateOffer,
    AcceptOffer,
    ApplyAnswer,
}
