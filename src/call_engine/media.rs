//! Media Acquisition
//!
//! Fordert lokale Capture-Tracks für einen Anruf an und gibt sie wieder
//! frei. Es gibt prozessweit genau einen Slot: bevor neue Hardware
//! geöffnet wird, wird der vorherige Handle gestoppt.

use super::call_type::CallType;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAcquisitionError {
    #[error("Permission to use the capture device was denied")]
    PermissionDenied,

    #[error("No capture device found: {0}")]
    DeviceNotFound(String),

    #[error("Capture device is busy: {0}")]
    DeviceBusy(String),

    #[error("Media error: {0}")]
    Other(String),
}

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Audio-Profil für alle Anrufe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

/// Video-Obergrenzen, werden während eines Anrufs nicht neu verhandelt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub max_width: u32,
    pub max_height: u32,
    pub max_frame_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: AudioConstraints,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// Constraints für einen Anruf-Typ
    pub fn for_call(call_type: CallType) -> Self {
        let audio = AudioConstraints {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        };

        let video = match call_type {
            CallType::Audio => None,
            CallType::Video => Some(VideoConstraints {
                max_width: 640,
                max_height: 480,
                max_frame_rate: 15,
            }),
        };

        Self { audio, video }
    }
}

// ============================================================================
// TRACKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Ein lokaler Capture-Track, bereit zum Anhängen an die Peer Connection
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self { kind, track }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.track.id())
            .finish()
    }
}

// ============================================================================
// CAPTURE DEVICE CONTRACT
// ============================================================================

/// Laufende Hardware-Aufnahme. `stop` darf mehrfach aufgerufen werden.
pub trait CaptureStream: Send + Sync {
    fn stop(&self);
}

/// Ergebnis einer erfolgreichen Aufnahme-Anfrage
pub struct CapturedMedia {
    pub tracks: Vec<LocalTrack>,
    pub stream: Box<dyn CaptureStream>,
}

/// Capture-Device API (Mikrofon / Kamera)
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Ob das Gerät die Constraints überhaupt erfüllen kann
    fn supports(&self, _constraints: &MediaConstraints) -> bool {
        true
    }

    async fn open(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<CapturedMedia, MediaAcquisitionError>;
}

// ============================================================================
// MEDIA HANDLE
// ============================================================================

struct MediaHandleInner {
    id: Uuid,
    call_type: CallType,
    tracks: Vec<LocalTrack>,
    stream: Box<dyn CaptureStream>,
    released: AtomicBool,
}

impl MediaHandleInner {
    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.stream.stop();
        tracing::info!("Released {} media handle {}", self.call_type, self.id);
        true
    }
}

impl Drop for MediaHandleInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Exklusiver Besitz einer Capture-Session für einen Anruf
///
/// Klone teilen denselben Zustand; der Slot im [`MediaManager`] hält
/// einen Klon, damit ein neuer Anruf den alten Handle stoppen kann.
#[derive(Clone)]
pub struct MediaHandle {
    inner: Arc<MediaHandleInner>,
}

impl MediaHandle {
    fn new(call_type: CallType, media: CapturedMedia) -> Self {
        Self {
            inner: Arc::new(MediaHandleInner {
                id: Uuid::new_v4(),
                call_type,
                tracks: media.tracks,
                stream: media.stream,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn call_type(&self) -> CallType {
        self.inner.call_type
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.inner.tracks
    }

    pub fn is_live(&self) -> bool {
        !self.inner.released.load(Ordering::SeqCst)
    }

    /// Stoppt alle Tracks. Idempotent; gibt `true` zurück, wenn dieser
    /// Aufruf die Tracks tatsächlich gestoppt hat.
    pub fn release(&self) -> bool {
        self.inner.release()
    }
}

impl fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHandle")
            .field("id", &self.inner.id)
            .field("call_type", &self.inner.call_type)
            .field("tracks", &self.inner.tracks)
            .field("live", &self.is_live())
            .finish()
    }
}

// ============================================================================
// MEDIA MANAGER
// ============================================================================

/// Wird aufgerufen, wenn ein neuer Anruf den Handle übernimmt
pub type RevokeNotice = Box<dyn FnOnce() + Send>;

struct Slot {
    handle: MediaHandle,
    on_revoked: Option<RevokeNotice>,
}

/// Prozessweiter Slot für den einen live MediaHandle
pub struct MediaManager {
    device: Arc<dyn CaptureDevice>,
    current: Mutex<Option<Slot>>,
}

impl MediaManager {
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            device,
            current: Mutex::new(None),
        }
    }

    /// Öffnet Capture für einen Anruf-Typ.
    ///
    /// Der Slot bleibt während des Öffnens gesperrt, gleichzeitige Anfragen
    /// laufen also nacheinander und es existiert nie mehr als eine
    /// Hardware-Session. Kann das Gerät die Constraints nicht erfüllen,
    /// bleibt der bisherige Handle unangetastet. Sonst wird er gestoppt
    /// und sein Besitzer über `on_revoked` informiert.
    pub async fn acquire(
        &self,
        call_type: CallType,
        on_revoked: Option<RevokeNotice>,
    ) -> Result<MediaHandle, MediaAcquisitionError> {
        let constraints = MediaConstraints::for_call(call_type);
        if !self.device.supports(&constraints) {
            tracing::error!("Capture device cannot provide {} media", call_type);
            return Err(MediaAcquisitionError::DeviceNotFound(format!(
                "no capture source for {call_type} call"
            )));
        }

        let mut current = self.current.lock().await;

        if let Some(previous) = current.take() {
            if previous.handle.release() {
                tracing::info!(
                    "Stopped previous {} media before acquiring {}",
                    previous.handle.call_type(),
                    call_type
                );
                if let Some(notify) = previous.on_revoked {
                    notify();
                }
            }
        }

        tracing::info!("Acquiring {} media: {:?}", call_type, constraints);

        let media = self.device.open(&constraints).await.map_err(|e| {
            tracing::error!("Failed to acquire {} media: {}", call_type, e);
            e
        })?;

        let handle = MediaHandle::new(call_type, media);
        *current = Some(Slot {
            handle: handle.clone(),
            on_revoked,
        });
        Ok(handle)
    }

    /// Gibt einen Handle frei und leert den Slot, falls er ihn noch hält
    pub async fn release(&self, handle: &MediaHandle) {
        handle.release();
        let mut current = self.current.lock().await;
        if current.as_ref().map(|slot| slot.handle.id()) == Some(handle.id()) {
            *current = None;
        }
    }

    /// Ob gerade eine Hardware-Session offen ist
    pub async fn has_live_handle(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|slot| slot.handle.is_live())
            .unwrap_or(false)
    }
}

impl fmt::Debug for MediaManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaManager").finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================
