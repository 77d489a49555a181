use callcore::{CallRole, EndReason, MediaKind, PeerId, SignalingState};
use serde::Serialize;

/// Lifecycle notifications published to the UI layer.
///
/// Subscribers get a read-only stream; the controller stays the single
/// writer of call state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum CallEvent {
    Ringing {
        peer: PeerId,
        role: CallRole,
        media: MediaKind,
    },
    Active {
        peer: PeerId,
    },
    Ended {
        peer: PeerId,
        reason: EndReason,
        duration_secs: Option<i64>,
    },
    SignalingStateChanged {
        state: SignalingState,
    },
    /// An incoming offer was refused because we are already in a call.
    Busy {
        from: PeerId,
    },
    /// Something irrecoverable ended the call attempt. Shown to the user once.
    Failed {
        message: String,
    },
    /// The signaling channel dropped; the transport is reconnecting.
    ConnectivityWarning,
    ConnectivityRestored,
}
