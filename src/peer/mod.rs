//! The peer connection primitive the negotiation engine drives.
//!
//! Mirrors the subset of `RTCPeerConnection` that offer/answer negotiation
//! needs. The `webrtc` feature provides a backend built on the `webrtc`
//! crate; tests use the fakes in `test_utils`.

use crate::media::LocalTracks;
use async_trait::async_trait;
use callcore::{IceCandidate, MediaKind, SessionDescription};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[cfg(feature = "webrtc")]
pub mod rtc;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("peer connection is closed")]
    Closed,

    #[error("rejected by peer connection: {0}")]
    Rejected(String),

    #[error("peer connection backend error: {0}")]
    Backend(String),
}

/// Transport-level state of the peer connection (ICE + DTLS).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events emitted by a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered and should be trickled to the peer.
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), ConnectionError>;

    async fn set_remote_description(&self, desc: SessionDescription)
    -> Result<(), ConnectionError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;

    /// Tear down the connection. Idempotent.
    async fn close(&self);
}

/// Creates one peer connection per call.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Creates a connection carrying `tracks`, along with its event stream.
    async fn create(
        &self,
        media: MediaKind,
        tracks: &LocalTracks,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), ConnectionError>;
}
