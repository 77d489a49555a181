//! Offer/answer negotiation over a [`PeerConnection`].
//!
//! Every step that suspends on the peer connection follows the same shape:
//! guard and mark the step in flight under the session lock, release the
//! lock, await the primitive, then re-lock and commit. If the session ended
//! while the step was suspended the result is reported as
//! [`Negotiated::Stale`] and nothing is committed.
//!
//! Remote candidates go through a single FIFO lane. The step that applies
//! the remote description takes the lane before it flips
//! `remote_description_applied`, so buffered candidates are always applied
//! ahead of any candidate that arrives while the buffer is being drained.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use callcore::{
    CallSession, GuardViolation, IceCandidate, NegotiationStep, SdpKind, SessionDescription,
    SignalingState,
};
use log::{debug, trace, warn};
use tokio::sync::Mutex;

use super::error::NegotiationError;
use crate::media::LocalTracks;
use crate::peer::{ConnectionError, PeerConnection};

/// Shared handle to the one session a controller owns.
pub type SessionHandle = Arc<Mutex<CallSession>>;

/// Outcome of a negotiation step that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiated<T> {
    Applied(T),
    /// The step was not allowed in the current state and did nothing.
    Guarded(GuardViolation),
    /// The session ended while the step was suspended. Nothing was committed.
    Stale,
}

impl<T> Negotiated<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// What happened to a remote candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Buffered until the remote description is applied.
    Queued,
    Applied,
    /// Rejected by the peer connection; logged and dropped.
    Skipped,
}

pub struct NegotiationEngine {
    session: SessionHandle,
    connection: Arc<dyn PeerConnection>,
    tracks: LocalTracks,
    lane: Mutex<()>,
    closed: AtomicBool,
}

impl NegotiationEngine {
    pub fn new(
        session: SessionHandle,
        connection: Arc<dyn PeerConnection>,
        tracks: LocalTracks,
    ) -> Self {
        Self {
            session,
            connection,
            tracks,
            lane: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Guard, then mark `step` in flight. A closed engine only reaches the
    /// primitive if the session is somehow still live.
    async fn begin(
        &self,
        step: NegotiationStep,
        expected: SignalingState,
    ) -> Result<Option<GuardViolation>, NegotiationError> {
        let mut session = self.session.lock().await;
        if let Err(violation) = session.begin_step(step, expected) {
            return Ok(Some(violation));
        }
        if self.is_closed() {
            session.abort_step();
            return Err(ConnectionError::Closed.into());
        }
        Ok(None)
    }

    /// A primitive failed mid-step. If the session ended meanwhile (and
    /// closed the connection under us) the failure is just a stale result.
    async fn fail<T>(&self, err: ConnectionError) -> Result<Negotiated<T>, NegotiationError> {
        let mut session = self.session.lock().await;
        if session.is_ended() {
            debug!(target: "Call/Engine", "call {}: step failed after end ({err}), discarding", session.id);
            return Ok(Negotiated::Stale);
        }
        session.abort_step();
        Err(err.into())
    }

    /// Create and set the local offer. Returns the offer to send.
    pub async fn create_offer(&self) -> Result<Negotiated<SessionDescription>, NegotiationError> {
        if let Some(violation) = self
            .begin(NegotiationStep::CreateOffer, SignalingState::Stable)
            .await?
        {
            return Ok(Negotiated::Guarded(violation));
        }

        let offer = match self.connection.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return self.fail(e).await,
        };
        if let Err(e) = self.connection.set_local_description(offer.clone()).await {
            return self.fail(e).await;
        }

        let mut session = self.session.lock().await;
        if session.is_ended() {
            debug!(target: "Call/Engine", "call {}: offer created after end, discarding", session.id);
            return Ok(Negotiated::Stale);
        }
        session.finish_step(SignalingState::HaveLocalOffer);
        Ok(Negotiated::Applied(offer))
    }

    /// Apply a remote offer, drain buffered candidates and answer it.
    /// Returns the answer to send.
    pub async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<Negotiated<SessionDescription>, NegotiationError> {
        offer.validate(SdpKind::Offer)?;
        if let Some(violation) = self
            .begin(NegotiationStep::AcceptOffer, SignalingState::Stable)
            .await?
        {
            return Ok(Negotiated::Guarded(violation));
        }

        if let Err(e) = self.connection.set_remote_description(offer).await {
            return self.fail(e).await;
        }

        {
            let _lane = self.lane.lock().await;
            let drained = {
                let mut session = self.session.lock().await;
                if session.is_ended() {
                    return Ok(Negotiated::Stale);
                }
                session.set_signaling_state(SignalingState::HaveRemoteOffer);
                session.mark_remote_applied()
            };
            self.apply_drained(drained).await;
        }

        let answer = match self.connection.create_answer().await {
            Ok(answer) => answer,
            Err(e) => return self.fail(e).await,
        };
        if let Err(e) = self.connection.set_local_description(answer.clone()).await {
            return self.fail(e).await;
        }

        let mut session = self.session.lock().await;
        if session.is_ended() {
            return Ok(Negotiated::Stale);
        }
        session.finish_step(SignalingState::Stable);
        Ok(Negotiated::Applied(answer))
    }

    /// Apply the remote answer to our offer, then drain buffered candidates.
    pub async fn apply_answer(
        &self,
        answer: SessionDescription,
    ) -> Result<Negotiated<()>, NegotiationError> {
        answer.validate(SdpKind::Answer)?;
        if let Some(violation) = self
            .begin(NegotiationStep::ApplyAnswer, SignalingState::HaveLocalOffer)
            .await?
        {
            return Ok(Negotiated::Guarded(violation));
        }

        if let Err(e) = self.connection.set_remote_description(answer).await {
            return self.fail(e).await;
        }

        let _lane = self.lane.lock().await;
        let drained = {
            let mut session = self.session.lock().await;
            if session.is_ended() {
                return Ok(Negotiated::Stale);
            }
            session.finish_step(SignalingState::Stable);
            session.mark_remote_applied()
        };
        self.apply_drained(drained).await;
        Ok(Negotiated::Applied(()))
    }

    /// Apply `candidate` if the remote description is in place, otherwise
    /// buffer it.
    pub async fn queue_or_apply_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<Negotiated<CandidateDisposition>, NegotiationError> {
        candidate.validate()?;
        {
            let mut session = self.session.lock().await;
            if session.is_ended() {
                return Ok(Negotiated::Guarded(GuardViolation::SessionEnded));
            }
            if !session.remote_description_applied() {
                session.queue_candidate(candidate);
                trace!(
                    target: "Call/Engine",
                    "call {}: buffered candidate ({} pending)",
                    session.id,
                    session.pending_candidates().len()
                );
                return Ok(Negotiated::Applied(CandidateDisposition::Queued));
            }
        }

        let _lane = self.lane.lock().await;
        if self.session.lock().await.is_ended() {
            return Ok(Negotiated::Stale);
        }
        match self.connection.add_ice_candidate(candidate).await {
            Ok(()) => Ok(Negotiated::Applied(CandidateDisposition::Applied)),
            Err(e) => {
                warn!(target: "Call/Engine", "skipping remote candidate: {e}");
                Ok(Negotiated::Applied(CandidateDisposition::Skipped))
            }
        }
    }

    /// Caller must hold the candidate lane.
    async fn apply_drained(&self, drained: Vec<IceCandidate>) {
        if drained.is_empty() {
            return;
        }
        debug!(target: "Call/Engine", "applying {} buffered candidate(s)", drained.len());
        for candidate in drained {
            if let Err(e) = self.connection.add_ice_candidate(candidate).await {
                warn!(target: "Call/Engine", "skipping buffered candidate: {e}");
            }
        }
    }

    /// Release local media and close the peer connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tracks.release();
        self.connection.close().await;
        debug!(target: "Call/Engine", "engine closed");
    }
}
