//! Signaling wire protocol.
//!
//! The relay forwards JSON text frames between logged-in peers:
//!
//! ```json
//! {"to":"bob","message":{"type":"offer","media":"video","description":{"type":"offer","sdp":"v=0..."}}}
//! ```
//!
//! On delivery the relay replaces `to` with `from`. A frame of the form
//! `{"error":"..."}` reports a relay-side failure (e.g. the callee is not
//! logged in).

use crate::description::{IceCandidate, SdpKind, SessionDescription};
use crate::types::{MediaKind, PeerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame has no sender")]
    MissingSender,

    #[error("frame has no recipient")]
    MissingRecipient,

    #[error("expected {expected} description, got {got}")]
    UnexpectedSdpKind { expected: SdpKind, got: SdpKind },

    #[error("malformed session description: {0}")]
    MalformedDescription(String),

    #[error("malformed ice candidate: {0}")]
    MalformedCandidate(&'static str),
}

/// A peer-to-peer signaling message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalMessage {
    Offer {
        #[serde(default)]
        media: MediaKind,
        description: SessionDescription,
    },
    Answer {
        description: SessionDescription,
    },
    Candidate {
        candidate: IceCandidate,
    },
    EndCall,
    DeclineCall {
        /// Set when the callee is already engaged in another call.
        #[serde(default)]
        busy: bool,
    },
}

impl SignalMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::EndCall => "endCall",
            Self::DeclineCall { .. } => "declineCall",
        }
    }

    /// Reject payloads that are structurally unusable before they reach
    /// any state.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Self::Offer { description, .. } => description.validate(SdpKind::Offer),
            Self::Answer { description } => description.validate(SdpKind::Answer),
            Self::Candidate { candidate } => candidate.validate(),
            Self::EndCall | Self::DeclineCall { .. } => Ok(()),
        }
    }
}

/// A message addressed to (outbound) or received from (inbound) a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    pub message: SignalMessage,
}

impl Envelope {
    pub fn addressed(peer: PeerId, message: SignalMessage) -> Self {
        Self {
            from: None,
            to: Some(peer),
            message,
        }
    }

    pub fn delivered(peer: PeerId, message: SignalMessage) -> Self {
        Self {
            from: Some(peer),
            to: None,
            message,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RelayFrame {
    Envelope(Envelope),
    Failure { error: String },
}

/// What the controller receives from the signaling layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundSignal {
    Message { from: PeerId, message: SignalMessage },
    CallFailed { reason: String },
}

impl InboundSignal {
    /// Decode a relay text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        match serde_json::from_str::<RelayFrame>(text)? {
            RelayFrame::Envelope(envelope) => {
                let from = envelope.from.ok_or(ProtocolError::MissingSender)?;
                Ok(Self::Message {
                    from,
                    message: envelope.message,
                })
            }
            RelayFrame::Failure { error } => Ok(Self::CallFailed { reason: error }),
        }
    }
}
