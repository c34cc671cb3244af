use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use signal_proto::{ConnectivityCandidate, SessionDescription};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{PeerConnection, PeerConnectionState, PeerConnector, PeerError, PeerEvent, PeerEventSink};
use crate::media::{LocalTrack, TrackInfo, TrackKind};

fn to_setup_error<E: std::fmt::Display>(err: E) -> PeerError {
    PeerError::Setup(err.to_string())
}

fn to_rejected<E: std::fmt::Display>(err: E) -> PeerError {
    PeerError::Rejected(err.to_string())
}

fn build_api() -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn map_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => PeerConnectionState::New,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    serde_json::from_value(description.into_value()).map_err(to_rejected)
}

fn from_rtc_description(description: &RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let value = serde_json::to_value(description).map_err(to_rejected)?;
    SessionDescription::try_from(value).map_err(to_rejected)
}

fn candidate_from_rtc(candidate: &RTCIceCandidate) -> Result<ConnectivityCandidate, PeerError> {
    let init = candidate.to_json().map_err(to_rejected)?;
    let value = serde_json::to_value(init).map_err(to_rejected)?;
    ConnectivityCandidate::try_from(value).map_err(to_rejected)
}

/// Builds webrtc-rs peer connections against a fixed ICE server list.
#[derive(Debug, Clone, Default)]
pub struct WebRtcConnector {
    ice_servers: Vec<String>,
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

fn rtc_configuration(ice_servers: &[String]) -> RTCConfiguration {
    let ice_servers = if ice_servers.is_empty() {
        Vec::new()
    } else {
        vec![RTCIceServer {
            urls: ice_servers.to_vec(),
            ..Default::default()
        }]
    };
    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

/// Builds a connection whose callbacks report through `events` while
/// `active` holds.
async fn open_connection(
    ice_servers: &[String],
    events: &PeerEventSink,
    active: Arc<AtomicBool>,
) -> Result<Arc<RTCPeerConnection>, PeerError> {
    let api = build_api()?;
    let pc = Arc::new(
        api.new_peer_connection(rtc_configuration(ice_servers))
            .await
            .map_err(to_setup_error)?,
    );
    let generation = events.generation();

    let candidate_sink = events.clone();
    let candidate_active = active.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = candidate_sink.clone();
        let active = candidate_active.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                tracing::debug!(target: "tandem::peer", "ice gathering complete");
                return;
            };
            if !active.load(Ordering::SeqCst) {
                return;
            }
            match candidate_from_rtc(&candidate) {
                Ok(candidate) => sink.emit(PeerEvent::LocalCandidate(candidate)),
                Err(err) => tracing::warn!(
                    target: "tandem::peer",
                    error = %err,
                    "failed to serialize local candidate"
                ),
            }
        })
    }));

    let track_sink = events.clone();
    let track_active = active.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        if track_active.load(Ordering::SeqCst) {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            track_sink.emit(PeerEvent::RemoteTrack(TrackInfo {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
            }));
        }
        Box::pin(async {})
    }));

    let state_sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        tracing::debug!(target: "tandem::peer", generation, ?state, "peer connection state changed");
        if active.load(Ordering::SeqCst) {
            state_sink.emit(PeerEvent::ConnectionState(map_state(state)));
        }
        Box::pin(async {})
    }));

    Ok(pc)
}

async fn attach_track(
    pc: &RTCPeerConnection,
    sample: Arc<TrackLocalStaticSample>,
) -> Result<(), PeerError> {
    let sample: Arc<dyn TrackLocal + Send + Sync> = sample;
    pc.add_track(sample).await.map_err(to_rejected)?;
    Ok(())
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let active = Arc::new(AtomicBool::new(true));
        let pc = open_connection(&self.ice_servers, &events, active.clone()).await?;
        Ok(Arc::new(WebRtcPeer {
            ice_servers: self.ice_servers.clone(),
            events,
            current: Mutex::new(Link { pc, active }),
            tracks: Mutex::new(Vec::new()),
        }))
    }
}

struct Link {
    pc: Arc<RTCPeerConnection>,
    /// Cleared once the connection is replaced or closed.
    active: Arc<AtomicBool>,
}

struct WebRtcPeer {
    ice_servers: Vec<String>,
    events: PeerEventSink,
    current: Mutex<Link>,
    tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
}

impl WebRtcPeer {
    fn pc(&self) -> Arc<RTCPeerConnection> {
        self.current.lock().pc.clone()
    }

    /// Swaps in a fresh connection carrying the same local tracks.
    async fn rebuild(&self) -> Result<(), PeerError> {
        let active = Arc::new(AtomicBool::new(true));
        let pc = open_connection(&self.ice_servers, &self.events, active.clone()).await?;
        let tracks = self.tracks.lock().clone();
        for sample in tracks {
            if let Err(err) = attach_track(&pc, sample).await {
                active.store(false, Ordering::SeqCst);
                if let Err(close_err) = pc.close().await {
                    tracing::warn!(target: "tandem::peer", error = %close_err, "failed to close replacement connection");
                }
                return Err(err);
            }
        }

        let retired = std::mem::replace(&mut *self.current.lock(), Link { pc, active });
        retired.active.store(false, Ordering::SeqCst);
        if let Err(err) = retired.pc.close().await {
            tracing::warn!(target: "tandem::peer", error = %err, "failed to close retired connection");
        }
        tracing::debug!(
            target: "tandem::peer",
            generation = self.events.generation(),
            "peer connection rebuilt"
        );
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc().create_offer(None).await.map_err(to_rejected)?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc().create_answer(None).await.map_err(to_rejected)?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = to_rtc_description(description)?;
        self.pc()
            .set_local_description(description)
            .await
            .map_err(to_rejected)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = to_rtc_description(description)?;
        self.pc()
            .set_remote_description(description)
            .await
            .map_err(to_rejected)
    }

    // webrtc-rs refuses a local rollback out of have-local-offer, so the
    // yielding side starts over on a fresh connection instead.
    async fn rollback_local_description(&self) -> Result<(), PeerError> {
        self.rebuild().await
    }

    async fn add_candidate(&self, candidate: ConnectivityCandidate) -> Result<(), PeerError> {
        let init: RTCIceCandidateInit =
            serde_json::from_value(candidate.into_value()).map_err(to_rejected)?;
        self.pc().add_ice_candidate(init).await.map_err(to_rejected)
    }

    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let Some(sample) = track.source::<TrackLocalStaticSample>() else {
            return Err(PeerError::UnsupportedTrack(track.info.id.clone()));
        };
        attach_track(&self.pc(), sample.clone()).await?;
        self.tracks.lock().push(sample);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        let pc = {
            let current = self.current.lock();
            current.active.store(false, Ordering::SeqCst);
            current.pc.clone()
        };
        pc.close().await.map_err(to_rejected)
    }
}
