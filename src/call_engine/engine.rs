//! WebRTC Peer Engine
//!
//! Implementiert [`PeerEngine`] mit webrtc-rs. Jede Instanz besitzt genau
//! eine `RTCPeerConnection`; die Callbacks der Verbindung werden in
//! [`PeerEvent`]s übersetzt.

use super::audio::AudioPlayback;
use super::call_type::CallType;
use super::candidate::IceCandidate;
use super::media::{LocalTrack, TrackKind};
use super::peer::{
    remote_track_disposition, PeerConnectionState, PeerEngine, PeerEngineFactory, PeerEvent,
    PeerEventSink, PeerSessionError, TrackDisposition,
};
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

fn engine_error(e: webrtc::Error) -> PeerSessionError {
    PeerSessionError::Engine(e.to_string())
}

impl From<RTCPeerConnectionState> for PeerConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                PeerConnectionState::New
            }
            RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
            RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
            RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        }
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erstellt webrtc-rs Peer Connections mit der konfigurierten STUN/TURN-Liste
#[derive(Debug, Clone)]
pub struct WebRtcEngineFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcEngineFactory {
    pub fn new(ice_servers: Vec<RTCIceServer>) -> Self {
        Self { ice_servers }
    }
}

impl Default for WebRtcEngineFactory {
    fn default() -> Self {
        Self::new(default_ice_servers())
    }
}

#[async_trait]
impl PeerEngineFactory for WebRtcEngineFactory {
    async fn create(
        &self,
        call_type: CallType,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerEngine>, PeerSessionError> {
        // Media Engine mit Default-Codecs (enthält PCMU, Opus, VP8)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(engine_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(engine_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(engine_error)?);
        register_handlers(&pc, call_type, events);

        Ok(Arc::new(WebRtcEngine { pc }))
    }
}

/// Registriert Event Handler für die Peer Connection
fn register_handlers(pc: &Arc<RTCPeerConnection>, call_type: CallType, events: PeerEventSink) {
    let state_events = Arc::clone(&events);
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("{} peer connection state: {:?}", call_type, s);
        state_events(PeerEvent::StateChanged(s.into()));
        Box::pin(async {})
    }));

    let candidate_events = Arc::clone(&events);
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => candidate_events(PeerEvent::LocalCandidate(IceCandidate::from(init))),
                Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let track_events = Arc::clone(&events);
    pc.on_track(Box::new(move |track, receiver, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        let disposition = remote_track_disposition(call_type, kind);
        track_events(PeerEvent::RemoteTrack { kind, disposition });

        Box::pin(async move {
            match disposition {
                TrackDisposition::Play => {
                    tokio::spawn(play_remote_audio(track));
                }
                TrackDisposition::Discard => {
                    tracing::info!(
                        "Discarding remote {:?} track on {} call",
                        kind,
                        call_type
                    );
                    if let Err(e) = receiver.stop().await {
                        tracing::debug!("Failed to stop discarded receiver: {}", e);
                    }
                }
            }
        })
    }));
}

/// Liest RTP vom Remote-Track und spielt PCMU ab, bis der Track endet
async fn play_remote_audio(track: Arc<TrackRemote>) {
    let mime_type = track.codec().capability.mime_type;
    if !mime_type.eq_ignore_ascii_case(MIME_TYPE_PCMU) {
        tracing::warn!("No decoder for remote audio codec {}", mime_type);
        while track.read_rtp().await.is_ok() {}
        return;
    }

    let playback = match AudioPlayback::start().await {
        Ok(playback) => playback,
        Err(e) => {
            tracing::error!("Failed to start audio playback: {}", e);
            while track.read_rtp().await.is_ok() {}
            return;
        }
    };

    while let Ok((packet, _)) = track.read_rtp().await {
        playback.push_pcmu(&packet.payload);
    }
    tracing::info!("Remote audio track ended");
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), PeerSessionError> {
        let local = track.track();
        let sender = self
            .pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(engine_error)?;

        // RTCP lesen, damit die Interceptors arbeiten können
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn set_remote_offer(&self, sdp: &str) -> Result<(), PeerSessionError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| PeerSessionError::Negotiation(e.to_string()))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(engine_error)
    }

    async fn create_answer(&self) -> Result<String, PeerSessionError> {
        let answer = self.pc.create_answer(None).await.map_err(engine_error)?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(engine_error)?;

        Ok(answer.sdp)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerSessionError> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(engine_error)
    }

    async fn close(&self) -> Result<(), PeerSessionError> {
        // Callbacks abmelden
        self.pc
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));

        self.pc.close().await.map_err(engine_error)
    }
}

impl std::fmt::Debug for WebRtcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcEngine")
            .field("connection_state", &self.pc.connection_state())
            .finish()
    }
}
