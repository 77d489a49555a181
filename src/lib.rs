// Re-export the runtime-agnostic core
pub use callcore as core;
pub use callcore::{
    CallId, CallRole, CallSnapshot, EndReason, IceCandidate, Lifecycle, MediaKind, PeerId,
    SessionDescription, SignalMessage, SignalingState,
};

pub mod calls;
pub mod config;
pub mod events;
pub mod media;
pub mod peer;
pub mod signaling;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use calls::{CallController, CallError, CallHandler, IntentOutcome, Refusal};
pub use config::CallConfig;
pub use events::CallEvent;
