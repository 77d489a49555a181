//! Runtime-agnostic core of the call negotiation stack.
//!
//! Holds the identities, session descriptions, the signaling wire protocol
//! and the [`CallSession`](session::CallSession) state machine. Nothing here
//! touches the network or an async runtime; the `peercall` crate drives it.

pub mod description;
pub mod protocol;
pub mod session;
pub mod state;
pub mod types;

pub use description::{IceCandidate, SdpKind, SessionDescription};
pub use protocol::{Envelope, InboundSignal, ProtocolError, SignalMessage};
pub use session::{CallSession, CallSnapshot, CallTimer, GuardViolation};
pub use state::{
    EndReason, InvalidTransition, Lifecycle, LifecycleTransition, NegotiationStep, SignalingState,
};
pub use types::{CallId, CallRole, MediaKind, PeerId};
