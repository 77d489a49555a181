//! Signaling channel: named-message delivery to and from remote peers.
//!
//! The controller only consumes [`SignalingTransport::send`] and the
//! [`TransportEvent`] stream; how messages reach the relay is up to the
//! implementation.

use async_trait::async_trait;
use callcore::{InboundSignal, PeerId, ProtocolError, SignalMessage};
use thiserror::Error;

pub mod loopback;
pub mod ws;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("signaling channel not connected")]
    NotConnected,

    #[error("could not encode signaling message: {0}")]
    Encode(#[from] ProtocolError),

    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// An event produced by the signaling transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport (re)connected to the relay.
    Connected,
    /// The connection was lost; the transport is retrying.
    Disconnected,
    /// A message or relay notification arrived.
    Signal(InboundSignal),
}

/// Delivers signaling messages to a remote peer by identity.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, to: &PeerId, message: SignalMessage) -> Result<(), TransportError>;
}
