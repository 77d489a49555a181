//! Peer connections backed by the `webrtc` crate.

use super::{ConnectionError, ConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent};
use crate::media::{LocalTracks, TrackKind};
use async_trait::async_trait;
use callcore::{IceCandidate, MediaKind, SdpKind, SessionDescription};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const EVENT_CHANNEL_CAPACITY: usize = 64;

fn map_err(err: webrtc::Error) -> ConnectionError {
    match err {
        webrtc::Error::ErrConnectionClosed => ConnectionError::Closed,
        other => ConnectionError::Backend(other.to_string()),
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, ConnectionError> {
    let result = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    result.map_err(|e| ConnectionError::Rejected(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, ConnectionError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(ConnectionError::Backend(format!(
            "unexpected sdp type {other}"
        ))),
    }
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

/// A call's `RTCPeerConnection` plus the local tracks attached to it.
pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    tracks: Vec<Arc<TrackLocalStaticSample>>,
}

impl RtcPeerConnection {
    /// Local tracks to write encoded samples into.
    pub fn local_tracks(&self) -> &[Arc<TrackLocalStaticSample>] {
        &self.tracks
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let offer = self.pc.create_offer(None).await.map_err(map_err)?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let answer = self.pc.create_answer(None).await.map_err(map_err)?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), ConnectionError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(map_err)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(map_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(map_err)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(target: "Call/Rtc", "close: {e}");
        }
    }
}

/// Builds `webrtc` peer connections with default codecs and interceptors.
pub struct RtcPeerConnectionFactory {
    ice_servers: Vec<String>,
}

impl RtcPeerConnectionFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn rtc_config(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerConnectionFactory {
    async fn create(
        &self,
        media: MediaKind,
        tracks: &LocalTracks,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), ConnectionError> {
        let mut engine = MediaEngine::default();
        engine.register_default_codecs().map_err(map_err)?;
        let registry = register_default_interceptors(Registry::new(), &mut engine).map_err(map_err)?;
        let api = APIBuilder::new()
            .with_media_engine(engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(self.rtc_config())
                .await
                .map_err(map_err)?,
        );

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let candidate_tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                // None marks the end of gathering.
                let Some(candidate) = candidate else {
                    debug!(target: "Call/Rtc", "ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        };
                        let _ = tx.send(PeerEvent::LocalCandidate(candidate)).await;
                    }
                    Err(e) => warn!(target: "Call/Rtc", "failed to serialize local candidate: {e}"),
                }
            })
        }));

        let state_tx = tx;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                info!(target: "Call/Rtc", "peer connection state: {state}");
                let _ = tx.send(PeerEvent::StateChanged(map_state(state))).await;
            })
        }));

        let mut local = Vec::new();
        for track in tracks.tracks() {
            let mime_type = match track.kind() {
                TrackKind::Audio => MIME_TYPE_OPUS,
                TrackKind::Video if media.has_video() => MIME_TYPE_VP8,
                TrackKind::Video => continue,
            };
            let sample_track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                track.id().to_owned(),
                tracks.stream_id().to_owned(),
            ));
            pc.add_track(Arc::clone(&sample_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(map_err)?;
            local.push(sample_track);
        }

        debug!(target: "Call/Rtc", "created {media} peer connection with {} track(s)", local.len());

        Ok((Arc::new(RtcPeerConnection { pc, tracks: local }), rx))
    }
}
