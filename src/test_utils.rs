//! Fakes for the controller's seams: peer connections, media and signaling.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use callcore::{IceCandidate, MediaKind, PeerId, SdpKind, SessionDescription, SignalMessage};
use tokio::sync::{Notify, mpsc};

use crate::media::{LocalTracks, MediaError, MediaSource, MediaTrack, TrackKind};
use crate::peer::{ConnectionError, PeerConnection, PeerConnectionFactory, PeerEvent};
use crate::signaling::{SignalingTransport, TransportError};

/// Holds `create_offer` suspended until released.
#[derive(Debug, Default)]
pub struct OfferGate {
    entered: Notify,
    release: Notify,
}

impl OfferGate {
    /// Resolves once a `create_offer` call is parked at the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Debug, Default)]
struct FakeRecord {
    local: Vec<SessionDescription>,
    remote: Vec<SessionDescription>,
    candidates: Vec<IceCandidate>,
}

/// In-memory peer connection. Candidates are rejected until a remote
/// description is set, and any candidate whose line contains `"bad"` is
/// rejected outright.
#[derive(Debug)]
pub struct FakePeerConnection {
    record: Mutex<FakeRecord>,
    closed: AtomicBool,
    gate: Option<Arc<OfferGate>>,
    offers: AtomicUsize,
    events: mpsc::Sender<PeerEvent>,
}

impl FakePeerConnection {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<PeerEvent>) {
        Self::with_gate(None)
    }

    pub fn with_gate(gate: Option<Arc<OfferGate>>) -> (Arc<Self>, mpsc::Receiver<PeerEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let pc = Arc::new(Self {
            record: Mutex::new(FakeRecord::default()),
            closed: AtomicBool::new(false),
            gate,
            offers: AtomicUsize::new(0),
            events: tx,
        });
        (pc, rx)
    }

    /// Candidates accepted by `add_ice_candidate`, in application order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.record.lock().unwrap().candidates.clone()
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.record.lock().unwrap().local.clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.record.lock().unwrap().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Inject an event as if the backend produced it.
    pub async fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event).await;
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.is_closed() {
            Err(ConnectionError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        self.ensure_open()?;
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.ensure_open()?;
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=fake {n} 1 IN IP4 127.0.0.1\r\ns=-\r\n"
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        self.ensure_open()?;
        let record = self.record.lock().unwrap();
        match record.remote.last() {
            Some(desc) if desc.kind == SdpKind::Offer => Ok(SessionDescription::answer(
                "v=0\r\no=fake-answer 1 1 IN IP4 127.0.0.1\r\ns=-\r\n",
            )),
            _ => Err(ConnectionError::Rejected("no remote offer".into())),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.record.lock().unwrap().local.push(desc);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.record.lock().unwrap().remote.push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let mut record = self.record.lock().unwrap();
        if record.remote.is_empty() {
            return Err(ConnectionError::Rejected("no remote description".into()));
        }
        if candidate.candidate.contains("bad") {
            return Err(ConnectionError::Rejected("unparsable candidate".into()));
        }
        record.candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out [`FakePeerConnection`]s and keeps them for inspection.
#[derive(Debug, Default)]
pub struct FakeConnectionFactory {
    created: Mutex<Vec<Arc<FakePeerConnection>>>,
    gate: Mutex<Option<Arc<OfferGate>>>,
    fail: AtomicBool,
}

impl FakeConnectionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connections created from now on park in `create_offer` at the
    /// returned gate.
    pub fn hold_offers(&self) -> Arc<OfferGate> {
        let gate = Arc::new(OfferGate::default());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Arc<FakePeerConnection>> {
        self.created.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeConnectionFactory {
    async fn create(
        &self,
        _media: MediaKind,
        _tracks: &LocalTracks,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), ConnectionError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConnectionError::Backend("factory failure".into()));
        }
        let gate = self.gate.lock().unwrap().clone();
        let (pc, rx) = FakePeerConnection::with_gate(gate);
        self.created.lock().unwrap().push(pc.clone());
        Ok((pc, rx))
    }
}

#[derive(Debug)]
struct FakeTrack {
    kind: TrackKind,
    stopped: Arc<AtomicUsize>,
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        match self.kind {
            TrackKind::Audio => "fake-audio",
            TrackKind::Video => "fake-video",
        }
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Counts acquisitions and track stops; can be told to deny access.
#[derive(Debug, Default)]
pub struct FakeMediaSource {
    deny: AtomicBool,
    acquired: AtomicUsize,
    stopped: Arc<AtomicUsize>,
}

impl FakeMediaSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_denied(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Number of individual tracks stopped so far.
    pub fn stopped_tracks(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn tracks(&self, media: MediaKind) -> LocalTracks {
        let mut tracks: Vec<Arc<dyn MediaTrack>> = vec![Arc::new(FakeTrack {
            kind: TrackKind::Audio,
            stopped: self.stopped.clone(),
        })];
        if media.has_video() {
            tracks.push(Arc::new(FakeTrack {
                kind: TrackKind::Video,
                stopped: self.stopped.clone(),
            }));
        }
        LocalTracks::new(media, "fake-stream", tracks)
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self, media: MediaKind) -> Result<LocalTracks, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::Denied("microphone".into()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(self.tracks(media))
    }
}

/// Records every outbound message instead of delivering it.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(PeerId, SignalMessage)>>,
    fail: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(PeerId, SignalMessage)> {
        self.sent.lock().unwrap().clone()
    }

    /// Kinds of the messages sent so far, e.g. `["offer", "endCall"]`.
    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, msg)| msg.kind())
            .collect()
    }
}

#[async_trait]
impl SignalingTransport for RecordingTransport {
    async fn send(&self, to: &PeerId, message: SignalMessage) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().unwrap().push((to.clone(), message));
        Ok(())
    }
}

/// A candidate line with a distinguishable host address.
pub fn candidate(n: u8) -> IceCandidate {
    IceCandidate::new(format!(
        "candidate:{n} 1 UDP 2130706431 192.168.1.{n} 5000{n} typ host"
    ))
    .with_sdp_mid("0")
    .with_sdp_m_line_index(0)
}
