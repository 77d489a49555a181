//! Session descriptions and ICE candidates as exchanged over signaling.
//!
//! Both records serialize exactly like the browser's
//! `RTCSessionDescriptionInit` and `RTCIceCandidateInit`, so a web peer can
//! sit on the other end of the relay.

use crate::protocol::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => f.write_str("offer"),
            Self::Answer => f.write_str("answer"),
        }
    }
}

/// An SDP offer or answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Check that the description is of the expected kind and carries an
    /// SDP body (`v=` must be the first line per RFC 4566).
    pub fn validate(&self, expected: SdpKind) -> Result<(), ProtocolError> {
        if self.kind != expected {
            return Err(ProtocolError::UnexpectedSdpKind {
                expected,
                got: self.kind,
            });
        }
        if !self.sdp.trim_start().starts_with("v=") {
            return Err(ProtocolError::MalformedDescription(
                "sdp body must start with v=".into(),
            ));
        }
        Ok(())
    }
}

/// An ICE candidate received from or to be sent to a peer.
///
/// The candidate string follows RFC 8839, e.g.
/// `candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    pub fn with_username_fragment(mut self, ufrag: impl Into<String>) -> Self {
        self.username_fragment = Some(ufrag.into());
        self
    }

    /// A candidate needs a non-empty candidate line and at least one of
    /// `sdpMid` / `sdpMLineIndex` to be attributable to a media section.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.candidate.trim().is_empty() {
            return Err(ProtocolError::MalformedCandidate("empty candidate line"));
        }
        if self.sdp_mid.is_none() && self.sdp_m_line_index.is_none() {
            return Err(ProtocolError::MalformedCandidate(
                "missing sdpMid and sdpMLineIndex",
            ));
        }
        Ok(())
    }
}
