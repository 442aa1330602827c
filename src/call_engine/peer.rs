//! Peer Session
//!
//! Besitzt genau eine Instanz der Peer-Transport-Engine: Tracks anhängen,
//! Offer/Answer, Candidates rein und raus, Connection-State und Abbau.
//! Die Engine selbst steckt hinter [`PeerEngine`], damit die Call Session
//! ohne echten ICE-Stack getestet werden kann.

use super::call_type::CallType;
use super::candidate::IceCandidate;
use super::media::{LocalTrack, MediaHandle, TrackKind};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerSessionError {
    #[error("WebRTC error: {0}")]
    Engine(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Peer session already closed")]
    Closed,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Connection-State der Peer-Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// `failed` und `disconnected` beenden den Anruf (kein ICE-Restart)
    pub fn ends_call(self) -> bool {
        matches!(
            self,
            PeerConnectionState::Failed | PeerConnectionState::Disconnected
        )
    }
}

/// Was mit einem eingehenden Remote-Track passiert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackDisposition {
    /// An die Audio-Wiedergabe weiterleiten
    Play,
    /// Für den Transport annehmen, aber sofort stoppen
    Discard,
}

/// Wiedergabe-Regel: nur Remote-Audio in Audio-Anrufen wird abgespielt
pub fn remote_track_disposition(call_type: CallType, kind: TrackKind) -> TrackDisposition {
    match kind {
        TrackKind::Audio if call_type.plays_remote_audio() => TrackDisposition::Play,
        _ => TrackDisposition::Discard,
    }
}

/// Events, die von der Engine-Callbacks erzeugt werden
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack {
        kind: TrackKind,
        disposition: TrackDisposition,
    },
    StateChanged(PeerConnectionState),
}

/// Ziel für Engine-Callbacks. Die Call Session speist damit ihre eigene
/// Event-Queue.
pub type PeerEventSink = Arc<dyn Fn(PeerEvent) + Send + Sync>;

// ============================================================================
// ENGINE CONTRACT
// ============================================================================

/// Operationen der Peer-Transport-Engine
#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), PeerSessionError>;

    async fn set_remote_offer(&self, sdp: &str) -> Result<(), PeerSessionError>;

    /// Erzeugt ein Answer und setzt es als Local Description
    async fn create_answer(&self) -> Result<String, PeerSessionError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerSessionError>;

    async fn close(&self) -> Result<(), PeerSessionError>;
}

/// Baut Engine-Instanzen; hält die STUN/TURN-Konfiguration
#[async_trait]
pub trait PeerEngineFactory: Send + Sync {
    async fn create(
        &self,
        call_type: CallType,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerEngine>, PeerSessionError>;
}

// ============================================================================
// PEER SESSION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiationPhase {
    /// Noch kein Remote Offer
    Fresh,
    /// Remote Offer angewendet, Answer fehlt noch
    OfferPending,
    /// Offer/Answer abgeschlossen, Renegotiation erlaubt
    Stable,
}

pub struct PeerSession {
    id: Uuid,
    call_type: CallType,
    engine: Arc<dyn PeerEngine>,
    /// Sperrt Callbacks nach `close`
    listening: Arc<AtomicBool>,
    phase: NegotiationPhase,
    closed: bool,
}

impl PeerSession {
    /// Erstellt eine neue Engine-Instanz und verdrahtet die Callbacks
    pub async fn create(
        factory: &dyn PeerEngineFactory,
        call_type: CallType,
        events: PeerEventSink,
    ) -> Result<Self, PeerSessionError> {
        let listening = Arc::new(AtomicBool::new(true));

        let gate = Arc::clone(&listening);
        let gated: PeerEventSink = Arc::new(move |event| {
            if gate.load(Ordering::SeqCst) {
                events(event);
            }
        });

        let engine = factory.create(call_type, gated).await?;
        let session = Self {
            id: Uuid::new_v4(),
            call_type,
            engine,
            listening,
            phase: NegotiationPhase::Fresh,
            closed: false,
        };

        tracing::info!("Created {} peer session {}", call_type, session.id);
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_remote_description(&self) -> bool {
        self.phase != NegotiationPhase::Fresh
    }

    /// Hängt alle Capture-Tracks an die Verbindung
    pub async fn attach_local_tracks(&self, media: &MediaHandle) -> Result<(), PeerSessionError> {
        self.ensure_open()?;
        for track in media.tracks() {
            self.engine.add_local_track(track).await?;
            tracing::debug!("Attached local {:?} track to {}", track.kind(), self.id);
        }
        Ok(())
    }

    /// Wendet ein Remote Offer an und gibt das lokale Answer zurück
    pub async fn set_remote_offer(&mut self, sdp: &str) -> Result<String, PeerSessionError> {
        self.ensure_open()?;

        if self.phase == NegotiationPhase::OfferPending {
            return Err(PeerSessionError::Negotiation(
                "stale offer: previous offer was never answered".to_string(),
            ));
        }

        let renegotiation = self.phase == NegotiationPhase::Stable;
        self.phase = NegotiationPhase::OfferPending;

        self.engine
            .set_remote_offer(sdp)
            .await
            .map_err(into_negotiation)?;
        let answer = self.engine.create_answer().await.map_err(into_negotiation)?;

        self.phase = NegotiationPhase::Stable;
        tracing::info!(
            "{} offer applied on {}{}",
            self.call_type,
            self.id,
            if renegotiation { " (renegotiation)" } else { "" }
        );
        Ok(answer)
    }

    /// Fügt einen Remote Candidate hinzu.
    ///
    /// Fehler werden geloggt und verschluckt. Ohne Remote Description
    /// wird der Candidate verworfen, nicht gepuffert. Gibt zurück, ob der
    /// Candidate angewendet wurde.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> bool {
        if self.closed {
            tracing::debug!("Dropping candidate for closed peer session {}", self.id);
            return false;
        }
        if !self.has_remote_description() {
            tracing::warn!(
                "Dropping early {} candidate (no remote description yet): {}",
                self.call_type,
                candidate.candidate
            );
            return false;
        }

        match self.engine.add_ice_candidate(candidate).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to add ICE candidate: {}", e);
                false
            }
        }
    }

    /// Schließt die Engine. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.listening.store(false, Ordering::SeqCst);

        if let Err(e) = self.engine.close().await {
            tracing::warn!("Error while closing peer session {}: {}", self.id, e);
        }
        tracing::info!("Closed {} peer session {}", self.call_type, self.id);
    }

    fn ensure_open(&self) -> Result<(), PeerSessionError> {
        if self.closed {
            Err(PeerSessionError::Closed)
        } else {
            Ok(())
        }
    }
}

fn into_negotiation(error: PeerSessionError) -> PeerSessionError {
    match error {
        PeerSessionError::Engine(message) => PeerSessionError::Negotiation(message),
        other => other,
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.listening.store(false, Ordering::SeqCst);

        // Letzter Ausweg: Engine im Hintergrund schließen
        let engine = Arc::clone(&self.engine);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = engine.close().await;
            });
        }
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("call_type", &self.call_type)
            .field("phase", &self.phase)
            .field("closed", &self.closed)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
