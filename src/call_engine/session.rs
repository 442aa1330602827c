//! Call Session State Machine
//!
//! Eine Instanz pro Anruf-Typ. Alle Eingaben (Signaling, Ergebnis der
//! Media-Anfrage, Peer-Callbacks, Timer) landen in genau einer Queue und
//! werden von einem Task nacheinander abgearbeitet:
//!
//! ```text
//! Idle → AwaitingMedia → SessionReady → AwaitingOffer → Negotiating → Connected → Ending → Idle
//! ```
//!
//! Asynchrone Ergebnisse tragen die Nummer des Versuchs, aus dem sie
//! stammen. Ergebnisse eines abgelösten Versuchs werden verworfen.

use super::call_type::CallType;
use super::candidate::{try_normalize, RawCandidate};
use super::media::{MediaAcquisitionError, MediaHandle, MediaManager};
use super::peer::{PeerConnectionState, PeerEngineFactory, PeerEvent, PeerEventSink, PeerSession};
use crate::signaling::{ClientMessage, SignalPayload};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Status-Text im Ruhezustand
pub const WAITING_TEXT: &str = "Waiting for call";

const MEDIA_REVOKED_TEXT: &str = "Call ended: media taken by new call";

// ============================================================================
// STATE & STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    AwaitingMedia,
    SessionReady,
    AwaitingOffer,
    Negotiating,
    Connected,
    Ending,
}

impl CallState {
    /// Ob in diesem Zustand eine Peer Session existieren kann
    fn has_peer(self) -> bool {
        matches!(
            self,
            CallState::SessionReady
                | CallState::AwaitingOffer
                | CallState::Negotiating
                | CallState::Connected
        )
    }
}

/// Read-only Sicht für die UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStatus {
    pub state: CallState,
    pub text: String,
    /// Ein Anruf läuft (zwischen Annahme und Abbau)
    pub active: bool,
}

impl Default for CallStatus {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            text: WAITING_TEXT.to_string(),
            active: false,
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Signaling-Events für genau einen Kanal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    IncomingCall {
        peer_id: String,
    },
    Signal {
        peer_id: String,
        payload: SignalPayload,
    },
    /// `peer_id` fehlt, wenn der Server den Absender nicht mitschickt
    CallEnded {
        peer_id: Option<String>,
    },
}

/// Alles, was in die Queue einer Call Session gelangt
pub(crate) enum SessionInput {
    External(SessionEvent),
    MediaReady {
        attempt: u64,
        result: Result<MediaHandle, MediaAcquisitionError>,
    },
    Peer {
        attempt: u64,
        event: PeerEvent,
    },
    /// Ein anderer Anruf hat den MediaHandle übernommen
    MediaRevoked {
        attempt: u64,
    },
    GraceElapsed {
        attempt: u64,
    },
}

impl fmt::Debug for SessionInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionInput::External(event) => f.debug_tuple("External").field(event).finish(),
            SessionInput::MediaReady { attempt, result } => f
                .debug_struct("MediaReady")
                .field("attempt", attempt)
                .field("ok", &result.is_ok())
                .finish(),
            SessionInput::Peer { attempt, event } => f
                .debug_struct("Peer")
                .field("attempt", attempt)
                .field("event", event)
                .finish(),
            SessionInput::MediaRevoked { attempt } => f
                .debug_struct("MediaRevoked")
                .field("attempt", attempt)
                .finish(),
            SessionInput::GraceElapsed { attempt } => f
                .debug_struct("GraceElapsed")
                .field("attempt", attempt)
                .finish(),
        }
    }
}

// ============================================================================
// CONTEXT & HANDLE
// ============================================================================

/// Gemeinsame Kollaborateure aller Call Sessions
#[derive(Clone)]
pub struct SessionContext {
    pub media: Arc<MediaManager>,
    pub peers: Arc<dyn PeerEngineFactory>,
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    /// Wie lange der End-Status stehen bleibt
    pub end_grace: Duration,
}

/// Handle auf eine laufende Call Session.
///
/// Wenn alle Handles gedroppt sind, schließt die Queue; die Session baut
/// dann ohne Benachrichtigung ab und der Task endet.
#[derive(Clone)]
pub struct SessionHandle {
    call_type: CallType,
    tx: mpsc::UnboundedSender<SessionInput>,
    status: watch::Receiver<CallStatus>,
}

impl SessionHandle {
    /// Startet die Call Session für einen Kanal als eigenen Task
    pub fn spawn(call_type: CallType, ctx: SessionContext) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(CallStatus::default());

        let session = CallSession {
            call_type,
            ctx,
            queue: tx.downgrade(),
            status: status_tx,
            state: CallState::Idle,
            attempt: 0,
            peer_id: None,
            media: None,
            peer: None,
        };
        let task = tokio::spawn(session.run(rx));

        (
            Self {
                call_type,
                tx,
                status,
            },
            task,
        )
    }

    /// Handle ohne Session dahinter, die Queue liegt beim Aufrufer
    #[cfg(test)]
    pub(crate) fn detached(call_type: CallType) -> (Self, mpsc::UnboundedReceiver<SessionInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_, status) = watch::channel(CallStatus::default());
        (
            Self {
                call_type,
                tx,
                status,
            },
            rx,
        )
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    /// Reiht ein Signaling-Event ein. `false`, wenn die Session beendet ist.
    pub fn send(&self, event: SessionEvent) -> bool {
        self.tx.send(SessionInput::External(event)).is_ok()
    }

    pub fn status(&self) -> watch::Receiver<CallStatus> {
        self.status.clone()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("call_type", &self.call_type)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

struct CallSession {
    call_type: CallType,
    ctx: SessionContext,
    /// Schwache Referenz, damit interne Producer die Queue nicht offen halten
    queue: mpsc::WeakUnboundedSender<SessionInput>,
    status: watch::Sender<CallStatus>,
    state: CallState,
    attempt: u64,
    peer_id: Option<String>,
    media: Option<MediaHandle>,
    peer: Option<PeerSession>,
}

impl CallSession {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionInput>) {
        tracing::debug!("{} call session started", self.call_type);

        while let Some(input) = rx.recv().await {
            self.handle(input).await;
        }

        if self.state != CallState::Idle {
            self.teardown(false, "Endpoint shutting down").await;
        }
        tracing::debug!("{} call session stopped", self.call_type);
    }

    async fn handle(&mut self, input: SessionInput) {
        match input {
            SessionInput::External(SessionEvent::IncomingCall { peer_id }) => {
                self.on_incoming_call(peer_id).await
            }
            SessionInput::External(SessionEvent::Signal { peer_id, payload }) => {
                self.on_signal(peer_id, payload).await
            }
            SessionInput::External(SessionEvent::CallEnded { peer_id }) => {
                self.on_remote_call_ended(peer_id).await
            }
            SessionInput::MediaReady { attempt, result } => {
                self.on_media_ready(attempt, result).await
            }
            SessionInput::Peer { attempt, event } => self.on_peer_event(attempt, event).await,
            SessionInput::MediaRevoked { attempt } => self.on_media_revoked(attempt).await,
            SessionInput::GraceElapsed { attempt } => {
                if attempt == self.attempt && self.state == CallState::Idle {
                    self.set_status(CallState::Idle, WAITING_TEXT);
                }
            }
        }
    }

    // ========================================================================
    // SIGNALING INPUT
    // ========================================================================

    async fn on_incoming_call(&mut self, peer_id: String) {
        if self.state != CallState::Idle {
            tracing::warn!(
                "New {} call from {} replaces active call with {:?}",
                self.call_type,
                peer_id,
                self.peer_id
            );
            self.teardown(false, "Call replaced").await;
        }

        self.attempt += 1;
        tracing::info!(
            "Incoming {} call from {} (attempt {})",
            self.call_type,
            peer_id,
            self.attempt
        );
        self.peer_id = Some(peer_id);
        self.set_status(CallState::AwaitingMedia, "Incoming call, preparing media");

        let attempt = self.attempt;
        let call_type = self.call_type;
        let media = Arc::clone(&self.ctx.media);
        let queue = self.queue.clone();

        let revoked = {
            let queue = queue.clone();
            move || {
                if let Some(tx) = queue.upgrade() {
                    let _ = tx.send(SessionInput::MediaRevoked { attempt });
                }
            }
        };

        tokio::spawn(async move {
            let result = media.acquire(call_type, Some(Box::new(revoked))).await;
            let undelivered = match queue.upgrade() {
                Some(tx) => tx.send(SessionInput::MediaReady { attempt, result }).err().map(|e| e.0),
                None => Some(SessionInput::MediaReady { attempt, result }),
            };
            // Session ist weg: Hardware nicht offen lassen
            if let Some(SessionInput::MediaReady {
                result: Ok(handle), ..
            }) = undelivered
            {
                media.release(&handle).await;
            }
        });
    }

    async fn on_signal(&mut self, peer_id: String, payload: SignalPayload) {
        if self.state == CallState::Idle {
            tracing::warn!(
                "Dropping {} {} from {}: no active call",
                self.call_type,
                payload.kind(),
                peer_id
            );
            return;
        }
        if self.peer_id.as_deref() != Some(peer_id.as_str()) {
            tracing::warn!(
                "Ignoring {} {} from {}: call belongs to {:?}",
                self.call_type,
                payload.kind(),
                peer_id,
                self.peer_id
            );
            return;
        }

        match payload {
            SignalPayload::Offer { sdp } => self.on_offer(sdp).await,
            SignalPayload::Candidate { candidate } => self.on_remote_candidate(candidate).await,
            SignalPayload::Answer { .. } => {
                tracing::warn!("Ignoring unexpected answer on {} channel", self.call_type);
            }
            SignalPayload::Ready => {
                tracing::debug!("Remote side ready on {} channel", self.call_type);
            }
        }
    }

    async fn on_offer(&mut self, sdp: String) {
        let renegotiation = match self.state {
            CallState::SessionReady | CallState::AwaitingOffer => false,
            CallState::Negotiating | CallState::Connected => true,
            state => {
                tracing::warn!("Dropping {} offer in state {:?}", self.call_type, state);
                return;
            }
        };

        if self.peer.is_none() {
            tracing::warn!("Dropping {} offer: no peer session", self.call_type);
            return;
        }
        if !renegotiation {
            self.set_status(CallState::Negotiating, "Connecting call");
        }

        let result = match self.peer.as_mut() {
            Some(peer) => peer.set_remote_offer(&sdp).await,
            None => return,
        };
        match result {
            Ok(answer) => self.send_signal(SignalPayload::Answer { sdp: answer }),
            Err(e) => {
                tracing::error!("{} negotiation failed: {}", self.call_type, e);
                self.teardown(true, "Call failed: negotiation error").await;
            }
        }
    }

    async fn on_remote_candidate(&mut self, raw: RawCandidate) {
        let candidate = match try_normalize(raw) {
            Ok(candidate) => candidate,
            Err(e) => {
                tracing::warn!("Dropping malformed {} candidate: {}", self.call_type, e);
                return;
            }
        };

        match self.peer.as_ref() {
            Some(peer) if self.state.has_peer() => {
                tracing::debug!("Remote {} candidate: {}", self.call_type, candidate.candidate);
                peer.add_remote_candidate(candidate).await;
            }
            _ => {
                tracing::warn!(
                    "Dropping {} candidate in state {:?}: no peer session",
                    self.call_type,
                    self.state
                );
            }
        }
    }

    async fn on_remote_call_ended(&mut self, peer_id: Option<String>) {
        if self.state == CallState::Idle {
            tracing::debug!("Ignoring call_ended on idle {} channel", self.call_type);
            return;
        }
        if let Some(sender) = peer_id.as_deref() {
            if self.peer_id.as_deref() != Some(sender) {
                tracing::warn!(
                    "Ignoring call_ended from {} on {} channel",
                    sender,
                    self.call_type
                );
                return;
            }
        }

        tracing::info!("{} call ended by remote", self.call_type);
        self.teardown(false, "Call ended").await;
    }

    // ========================================================================
    // MEDIA & PEER INPUT
    // ========================================================================

    async fn on_media_ready(
        &mut self,
        attempt: u64,
        result: Result<MediaHandle, MediaAcquisitionError>,
    ) {
        if attempt != self.attempt || self.state != CallState::AwaitingMedia {
            tracing::debug!(
                "Discarding stale {} media result from attempt {}",
                self.call_type,
                attempt
            );
            if let Ok(handle) = result {
                self.ctx.media.release(&handle).await;
            }
            return;
        }

        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("{} media acquisition failed: {}", self.call_type, e);
                self.teardown(true, &format!("Call failed: {e}")).await;
                return;
            }
        };
        self.media = Some(handle.clone());
        if !handle.is_live() {
            tracing::warn!("{} media was taken before the call started", self.call_type);
            self.teardown(true, MEDIA_REVOKED_TEXT).await;
            return;
        }

        let created =
            PeerSession::create(self.ctx.peers.as_ref(), self.call_type, self.peer_sink()).await;
        let peer = match created {
            Ok(peer) => self.peer.insert(peer),
            Err(e) => {
                tracing::error!("Failed to create {} peer session: {}", self.call_type, e);
                self.teardown(true, "Call failed: connection setup").await;
                return;
            }
        };

        if let Err(e) = peer.attach_local_tracks(&handle).await {
            tracing::error!("Failed to attach {} tracks: {}", self.call_type, e);
            self.teardown(true, "Call failed: connection setup").await;
            return;
        }

        self.set_status(CallState::SessionReady, "Media ready");
        self.send_signal(SignalPayload::Ready);
        self.set_status(CallState::AwaitingOffer, "Waiting for offer");
    }

    async fn on_media_revoked(&mut self, attempt: u64) {
        if attempt != self.attempt || matches!(self.state, CallState::Idle | CallState::Ending) {
            tracing::debug!("Ignoring media revocation from attempt {}", attempt);
            return;
        }

        tracing::warn!("{} media taken by another call", self.call_type);
        self.teardown(true, MEDIA_REVOKED_TEXT).await;
    }

    async fn on_peer_event(&mut self, attempt: u64, event: PeerEvent) {
        if attempt != self.attempt || self.peer.is_none() {
            tracing::debug!("Ignoring peer event from attempt {}: {:?}", attempt, event);
            return;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                tracing::debug!("Local {} candidate: {}", self.call_type, candidate.candidate);
                self.send_signal(SignalPayload::Candidate {
                    candidate: RawCandidate::Structured(candidate),
                });
            }
            PeerEvent::RemoteTrack { kind, disposition } => {
                tracing::info!(
                    "Remote {:?} track on {} call: {:?}",
                    kind,
                    self.call_type,
                    disposition
                );
            }
            PeerEvent::StateChanged(PeerConnectionState::Connected) => match self.state {
                CallState::Negotiating => {
                    tracing::info!("{} call connected", self.call_type);
                    let text = match self.call_type {
                        CallType::Audio => "Audio call active",
                        CallType::Video => "Video and audio active",
                    };
                    self.set_status(CallState::Connected, text);
                }
                CallState::Connected => {}
                state => {
                    tracing::warn!(
                        "Ignoring {} connected event in state {:?}",
                        self.call_type,
                        state
                    );
                }
            },
            PeerEvent::StateChanged(state) if state.ends_call() => {
                tracing::warn!("{} peer connection {:?}", self.call_type, state);
                self.teardown(true, "Connection lost").await;
            }
            PeerEvent::StateChanged(state) => {
                tracing::debug!("{} peer connection {:?}", self.call_type, state);
            }
        }
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    /// Peer-Callbacks landen als Event in der eigenen Queue
    fn peer_sink(&self) -> PeerEventSink {
        let queue = self.queue.clone();
        let attempt = self.attempt;
        Arc::new(move |event| {
            if let Some(tx) = queue.upgrade() {
                let _ = tx.send(SessionInput::Peer { attempt, event });
            }
        })
    }

    /// Baut alles ab: optional Gegenseite benachrichtigen, Peer schließen,
    /// Media freigeben. Danach ist der Zustand `Idle`.
    async fn teardown(&mut self, notify: bool, text: &str) {
        self.set_status(CallState::Ending, text);

        if notify {
            if let Some(peer_id) = self.peer_id.clone() {
                self.send(ClientMessage::CallEnded {
                    channel: self.call_type,
                    to_peer_id: peer_id,
                });
            }
        }

        if let Some(mut peer) = self.peer.take() {
            peer.close().await;
        }
        if let Some(media) = self.media.take() {
            self.ctx.media.release(&media).await;
        }

        self.peer_id = None;
        self.set_status(CallState::Idle, text);
        self.schedule_grace_reset();
    }

    fn schedule_grace_reset(&self) {
        let queue = self.queue.clone();
        let attempt = self.attempt;
        let delay = self.ctx.end_grace;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = queue.upgrade() {
                let _ = tx.send(SessionInput::GraceElapsed { attempt });
            }
        });
    }

    fn send_signal(&self, signal: SignalPayload) {
        let Some(peer_id) = self.peer_id.clone() else {
            return;
        };
        self.send(ClientMessage::Signal {
            channel: self.call_type,
            to_peer_id: peer_id,
            signal,
        });
    }

    fn send(&self, message: ClientMessage) {
        if self.ctx.outbound.send(message).is_err() {
            tracing::warn!("Signaling outbound queue closed, dropping message");
        }
    }

    fn set_status(&mut self, state: CallState, text: &str) {
        self.state = state;
        let active = !matches!(state, CallState::Idle | CallState::Ending);
        self.status.send_replace(CallStatus {
            state,
            text: text.to_string(),
            active,
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::candidate::IceCandidate;
    use crate::call_engine::fakes::{FakeCaptureDevice, FakePeerEngineFactory};
    use crate::call_engine::media::TrackKind;

    const LINE: &str = "candidate:1 1 udp 2122260223 192.168.1.4 50000 typ host";

    struct Harness {
        handle: SessionHandle,
        task: JoinHandle<()>,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
        outbound_tx: mpsc::UnboundedSender<ClientMessage>,
        device: Arc<FakeCaptureDevice>,
        factory: Arc<FakePeerEngineFactory>,
        media: Arc<MediaManager>,
    }

    fn harness(call_type: CallType) -> Harness {
        harness_with(call_type, FakeCaptureDevice::new())
    }

    fn harness_with(call_type: CallType, device: FakeCaptureDevice) -> Harness {
        let device = Arc::new(device);
        let factory = Arc::new(FakePeerEngineFactory::new());
        let media = Arc::new(MediaManager::new(device.clone()));
        let (outbound_tx, outbound) = mpsc::unbounded_channel();

        let (handle, task) = SessionHandle::spawn(
            call_type,
            SessionContext {
                media: Arc::clone(&media),
                peers: factory.clone(),
                outbound: outbound_tx.clone(),
                end_grace: Duration::from_millis(2000),
            },
        );

        Harness {
            handle,
            task,
            outbound,
            outbound_tx,
            device,
            factory,
            media,
        }
    }

    impl Harness {
        fn incoming(&self, peer_id: &str) {
            assert!(self.handle.send(SessionEvent::IncomingCall {
                peer_id: peer_id.to_string()
            }));
        }

        fn signal(&self, peer_id: &str, payload: SignalPayload) {
            assert!(self.handle.send(SessionEvent::Signal {
                peer_id: peer_id.to_string(),
                payload,
            }));
        }

        fn offer(&self, peer_id: &str, sdp: &str) {
            self.signal(peer_id, SignalPayload::Offer { sdp: sdp.to_string() });
        }

        async fn next_outbound(&mut self) -> ClientMessage {
            tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
                .await
                .expect("timed out waiting for outbound message")
                .expect("outbound queue closed")
        }

        async fn wait_for(&self, predicate: impl FnMut(&CallStatus) -> bool) -> CallStatus {
            let mut rx = self.handle.status();
            let result = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
                .await
                .expect("timed out waiting for status");
            let status = result.expect("status channel closed").clone();
            status
        }

        async fn wait_for_state(&self, state: CallState) -> CallStatus {
            self.wait_for(|s| s.state == state).await
        }

        /// Anruf annehmen, `Ready` und `Answer` abholen
        async fn connect(&mut self, call_type: CallType, peer_id: &str) {
            self.incoming(peer_id);
            assert_eq!(self.next_outbound().await, signal(call_type, peer_id, SignalPayload::Ready));
            self.offer(peer_id, "O1");
            assert_eq!(
                self.next_outbound().await,
                signal(
                    call_type,
                    peer_id,
                    SignalPayload::Answer {
                        sdp: "answer-to-O1".to_string()
                    }
                )
            );
            self.factory
                .last_engine()
                .unwrap()
                .emit(PeerEvent::StateChanged(PeerConnectionState::Connected));
            self.wait_for_state(CallState::Connected).await;
        }
    }

    fn signal(call_type: CallType, peer_id: &str, signal: SignalPayload) -> ClientMessage {
        ClientMessage::Signal {
            channel: call_type,
            to_peer_id: peer_id.to_string(),
            signal,
        }
    }

    fn ended(call_type: CallType, peer_id: &str) -> ClientMessage {
        ClientMessage::CallEnded {
            channel: call_type,
            to_peer_id: peer_id.to_string(),
        }
    }

    fn line_candidate(line: &str) -> SignalPayload {
        SignalPayload::Candidate {
            candidate: RawCandidate::Line(line.to_string()),
        }
    }

    #[tokio::test]
    async fn test_audio_call_scenario() {
        let mut h = harness(CallType::Audio);

        h.incoming("X");
        assert_eq!(h.next_outbound().await, signal(CallType::Audio, "X", SignalPayload::Ready));
        assert!(h.handle.status().borrow().active);

        h.offer("X", "O1");
        assert_eq!(
            h.next_outbound().await,
            signal(
                CallType::Audio,
                "X",
                SignalPayload::Answer {
                    sdp: "answer-to-O1".to_string()
                }
            )
        );

        h.signal(
            "X",
            SignalPayload::Candidate {
                candidate: RawCandidate::Structured(IceCandidate {
                    candidate: LINE.to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                }),
            },
        );
        h.signal("X", line_candidate("candidate:garbage"));
        h.signal("X", line_candidate(&format!("{LINE} ufrag abc")));

        let engine = h.factory.last_engine().unwrap();
        engine.emit(PeerEvent::StateChanged(PeerConnectionState::Connected));

        let status = h.wait_for_state(CallState::Connected).await;
        assert_eq!(status.text, "Audio call active");
        assert!(status.active);

        let candidates = engine.candidates();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[1].username_fragment.as_deref(), Some("abc"));
        assert_eq!(engine.tracks(), vec![TrackKind::Audio]);
    }

    #[tokio::test]
    async fn test_video_call_sends_one_ready_then_one_answer() {
        let mut h = harness(CallType::Video);

        h.connect(CallType::Video, "admin").await;

        let status = h.handle.status().borrow().clone();
        assert_eq!(status.text, "Video and audio active");
        assert!(h.outbound.try_recv().is_err());
        let engine = h.factory.last_engine().unwrap();
        assert_eq!(engine.call_type(), CallType::Video);
        assert_eq!(engine.tracks(), vec![TrackKind::Audio, TrackKind::Video]);
    }

    #[tokio::test]
    async fn test_local_candidates_are_forwarded_individually() {
        let mut h = harness(CallType::Audio);
        h.incoming("X");
        h.next_outbound().await;

        let engine = h.factory.last_engine().unwrap();
        for port in [1000, 1001] {
            engine.emit(PeerEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:1 1 udp 1 10.0.0.1 {port} typ host"),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
        }

        for _ in 0..2 {
            let ClientMessage::Signal {
                to_peer_id, signal, ..
            } = h.next_outbound().await
            else {
                panic!("expected signal");
            };
            assert_eq!(to_peer_id, "X");
            assert!(matches!(signal, SignalPayload::Candidate { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_failure_notifies_once_and_resets() {
        let mut h = harness(CallType::Audio);
        h.connect(CallType::Audio, "X").await;

        let engine = h.factory.last_engine().unwrap();
        engine.emit(PeerEvent::StateChanged(PeerConnectionState::Failed));
        engine.emit(PeerEvent::StateChanged(PeerConnectionState::Disconnected));

        assert_eq!(h.next_outbound().await, ended(CallType::Audio, "X"));
        let status = h.wait_for_state(CallState::Idle).await;
        assert!(!status.active);
        assert!(engine.is_closed());
        assert_eq!(h.device.live_streams(), 0);

        let status = h.wait_for(|s| s.text == WAITING_TEXT).await;
        assert_eq!(status.state, CallState::Idle);
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_media_failure_ends_call_without_ready() {
        let mut h = harness_with(
            CallType::Video,
            FakeCaptureDevice::failing(MediaAcquisitionError::PermissionDenied),
        );

        h.incoming("X");
        assert_eq!(h.next_outbound().await, ended(CallType::Video, "X"));

        let status = h.wait_for_state(CallState::Idle).await;
        assert!(status.text.contains("denied"));
        assert!(h.factory.engines().is_empty());
    }

    #[tokio::test]
    async fn test_remote_hangup_tears_down_without_echo() {
        let mut h = harness(CallType::Audio);
        h.connect(CallType::Audio, "X").await;

        h.handle.send(SessionEvent::CallEnded {
            peer_id: Some("X".to_string()),
        });
        h.wait_for_state(CallState::Idle).await;

        assert_eq!(h.factory.open_engines(), 0);
        assert_eq!(h.device.live_streams(), 0);
        assert!(!h.media.has_live_handle().await);
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_second_invitation_replaces_first() {
        let mut h = harness(CallType::Audio);
        h.incoming("X");
        h.next_outbound().await;
        let first = h.factory.last_engine().unwrap();

        h.incoming("Y");
        assert_eq!(h.next_outbound().await, signal(CallType::Audio, "Y", SignalPayload::Ready));

        assert!(first.is_closed());
        assert_eq!(h.factory.open_engines(), 1);
        assert_eq!(h.device.live_streams(), 1);
        assert_eq!(h.device.max_live_streams(), 1);

        // Signale des alten Anrufers werden ignoriert
        h.offer("X", "stale");
        h.offer("Y", "O1");
        assert_eq!(
            h.next_outbound().await,
            signal(
                CallType::Audio,
                "Y",
                SignalPayload::Answer {
                    sdp: "answer-to-O1".to_string()
                }
            )
        );
        assert_eq!(h.factory.last_engine().unwrap().offers(), vec!["O1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_media_result_is_released() {
        let mut h = harness_with(
            CallType::Video,
            FakeCaptureDevice::new().with_delay(Duration::from_millis(100)),
        );

        h.incoming("X");
        h.incoming("Y");

        assert_eq!(h.next_outbound().await, signal(CallType::Video, "Y", SignalPayload::Ready));
        h.wait_for_state(CallState::AwaitingOffer).await;

        assert_eq!(h.device.opened(), 2);
        assert_eq!(h.device.max_live_streams(), 1);
        assert_eq!(h.device.live_streams(), 1);
        assert_eq!(h.factory.engines().len(), 1);
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_early_candidate_is_dropped() {
        let mut h = harness(CallType::Audio);
        h.incoming("X");
        h.next_outbound().await;

        h.signal("X", line_candidate(LINE));
        h.offer("X", "O1");
        h.next_outbound().await;

        assert!(h.factory.last_engine().unwrap().candidates().is_empty());
    }

    #[tokio::test]
    async fn test_signals_on_idle_session_are_dropped() {
        let mut h = harness(CallType::Video);

        h.signal("X", line_candidate(LINE));
        h.offer("X", "O1");
        h.handle.send(SessionEvent::CallEnded { peer_id: None });
        h.incoming("X");

        assert_eq!(h.next_outbound().await, signal(CallType::Video, "X", SignalPayload::Ready));
        assert!(h.factory.last_engine().unwrap().offers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signals_before_media_ready_are_dropped() {
        let mut h = harness_with(
            CallType::Audio,
            FakeCaptureDevice::new().with_delay(Duration::from_millis(100)),
        );

        h.incoming("X");
        h.wait_for_state(CallState::AwaitingMedia).await;
        h.signal("X", line_candidate(LINE));
        h.offer("X", "early");

        assert_eq!(h.next_outbound().await, signal(CallType::Audio, "X", SignalPayload::Ready));
        h.wait_for_state(CallState::AwaitingOffer).await;

        let engine = h.factory.last_engine().unwrap();
        assert!(engine.offers().is_empty());
        assert!(engine.candidates().is_empty());
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connected_event_before_offer_is_ignored() {
        let mut h = harness(CallType::Audio);
        h.incoming("X");
        h.next_outbound().await;

        h.factory
            .last_engine()
            .unwrap()
            .emit(PeerEvent::StateChanged(PeerConnectionState::Connected));
        h.offer("X", "O1");
        h.next_outbound().await;

        let status = h.handle.status().borrow().clone();
        assert_eq!(status.state, CallState::Negotiating);
        assert_eq!(status.text, "Connecting call");
    }

    #[tokio::test]
    async fn test_renegotiation_keeps_connected_state() {
        let mut h = harness(CallType::Audio);
        h.connect(CallType::Audio, "X").await;

        h.offer("X", "O2");
        assert_eq!(
            h.next_outbound().await,
            signal(
                CallType::Audio,
                "X",
                SignalPayload::Answer {
                    sdp: "answer-to-O2".to_string()
                }
            )
        );
        assert_eq!(h.handle.status().borrow().state, CallState::Connected);
    }

    #[tokio::test]
    async fn test_negotiation_error_ends_call() {
        let mut h = harness(CallType::Audio);
        h.incoming("X");
        h.next_outbound().await;

        h.offer("X", "");
        assert_eq!(h.next_outbound().await, ended(CallType::Audio, "X"));

        let status = h.wait_for_state(CallState::Idle).await;
        assert!(status.text.contains("negotiation"));
        assert_eq!(h.device.live_streams(), 0);
    }

    #[tokio::test]
    async fn test_dropping_handle_shuts_session_down() {
        let mut h = harness(CallType::Audio);
        h.connect(CallType::Audio, "X").await;
        let engine = h.factory.last_engine().unwrap();

        let Harness {
            handle,
            task,
            mut outbound,
            device,
            ..
        } = h;
        drop(handle);
        task.await.unwrap();

        assert!(engine.is_closed());
        assert_eq!(device.live_streams(), 0);
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sessions_share_one_media_slot() {
        let device = Arc::new(FakeCaptureDevice::new());
        let factory = Arc::new(FakePeerEngineFactory::new());
        let media = Arc::new(MediaManager::new(device.clone()));
        let (outbound_tx, mut outbound) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            media,
            peers: factory.clone(),
            outbound: outbound_tx,
            end_grace: Duration::from_millis(10),
        };

        let (audio, _audio_task) = SessionHandle::spawn(CallType::Audio, ctx.clone());
        let (video, _video_task) = SessionHandle::spawn(CallType::Video, ctx);

        audio.send(SessionEvent::IncomingCall {
            peer_id: "A".to_string(),
        });
        assert_eq!(outbound.recv().await.unwrap().channel(), CallType::Audio);
        video.send(SessionEvent::IncomingCall {
            peer_id: "B".to_string(),
        });

        let mut received = vec![outbound.recv().await.unwrap(), outbound.recv().await.unwrap()];
        received.sort_by_key(|m| m.channel() == CallType::Video);
        assert_eq!(
            received,
            vec![
                ended(CallType::Audio, "A"),
                signal(CallType::Video, "B", SignalPayload::Ready)
            ]
        );

        assert_eq!(device.max_live_streams(), 1);
        assert_eq!(factory.engines().len(), 2);
        let mut audio_status = audio.status();
        audio_status
            .wait_for(|s| s.state == CallState::Idle)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connected_call_ends_when_other_channel_takes_media() {
        let mut h = harness(CallType::Audio);
        h.connect(CallType::Audio, "A").await;
        let audio_engine = h.factory.last_engine().unwrap();

        let (video, _video_task) = SessionHandle::spawn(
            CallType::Video,
            SessionContext {
                media: Arc::clone(&h.media),
                peers: h.factory.clone(),
                outbound: h.outbound_tx.clone(),
                end_grace: Duration::from_millis(2000),
            },
        );
        video.send(SessionEvent::IncomingCall {
            peer_id: "B".to_string(),
        });

        let mut received = vec![h.next_outbound().await, h.next_outbound().await];
        received.sort_by_key(|m| m.channel() == CallType::Video);
        assert_eq!(
            received,
            vec![
                ended(CallType::Audio, "A"),
                signal(CallType::Video, "B", SignalPayload::Ready)
            ]
        );

        let status = h.wait_for_state(CallState::Idle).await;
        assert_eq!(status.text, MEDIA_REVOKED_TEXT);
        assert!(!status.active);
        assert!(audio_engine.is_closed());
        assert_eq!(h.device.live_streams(), 1);
        assert_eq!(h.device.max_live_streams(), 1);
    }
}
