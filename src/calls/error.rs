//! Call-related error types.

use crate::media::MediaError;
use crate::peer::ConnectionError;
use crate::signaling::TransportError;
use callcore::ProtocolError;
use thiserror::Error;

/// Failure of a negotiation step. Guard violations are not errors; see
/// [`super::Negotiated`].
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("malformed payload: {0}")]
    Malformed(#[from] ProtocolError),
}

/// An irrecoverable failure of a call intent. By the time one is returned
/// the call has been ended and a `CallEvent::Failed` published.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("media unavailable: {0}")]
    Media(#[from] MediaError),

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("peer connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error("signaling failed: {0}")]
    Transport(#[from] TransportError),
}
