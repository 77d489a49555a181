//! One-to-one calls: negotiation and the session controller.
//!
//! # Architecture
//!
//! - [`NegotiationEngine`]: offer/answer and candidate handling for one call,
//!   bound to a single [`crate::peer::PeerConnection`]
//! - [`CallController`]: owns the single call slot, maps user intents and
//!   inbound signaling onto the engine, publishes [`crate::CallEvent`]s
//! - [`CallHandler`]: feeds a transport's event stream into the controller
//!
//! The session state itself ([`callcore::CallSession`]) and its transition
//! table live in `callcore`.

mod controller;
mod error;
mod handler;
mod negotiation;

pub use controller::{CallController, IntentOutcome, Refusal};
pub use error::{CallError, NegotiationError};
pub use handler::CallHandler;
pub use negotiation::{CandidateDisposition, Negotiated, NegotiationEngine, SessionHandle};
