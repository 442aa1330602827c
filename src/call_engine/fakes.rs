//! Test-Doubles für Capture-Hardware und Peer-Engine

use super::call_type::CallType;
use super::candidate::IceCandidate;
use super::media::{
    CaptureDevice, CaptureStream, CapturedMedia, LocalTrack, MediaAcquisitionError,
    MediaConstraints, TrackKind,
};
use super::peer::{PeerEngine, PeerEngineFactory, PeerEvent, PeerEventSink, PeerSessionError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub fn noop_sink() -> PeerEventSink {
    Arc::new(|_| {})
}

fn sample_track(kind: TrackKind) -> LocalTrack {
    let (mime_type, clock_rate, id) = match kind {
        TrackKind::Audio => (MIME_TYPE_PCMU, 8000, "audio"),
        TrackKind::Video => (MIME_TYPE_VP8, 90000, "video"),
    };
    let track = TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            clock_rate,
            ..Default::default()
        },
        id.to_string(),
        "fake".to_string(),
    );
    LocalTrack::new(kind, Arc::new(track))
}

// ============================================================================
// CAPTURE DEVICE
// ============================================================================

#[derive(Default)]
struct DeviceCounters {
    live: AtomicUsize,
    max_live: AtomicUsize,
    opened: AtomicUsize,
    stops: AtomicUsize,
}

struct FakeStream {
    counters: Arc<DeviceCounters>,
    stopped: AtomicBool,
}

impl CaptureStream for FakeStream {
    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub struct FakeCaptureDevice {
    counters: Arc<DeviceCounters>,
    failure: Mutex<Option<MediaAcquisitionError>>,
    delay: Mutex<Option<Duration>>,
    video: AtomicBool,
}

impl FakeCaptureDevice {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(DeviceCounters::default()),
            failure: Mutex::new(None),
            delay: Mutex::new(None),
            video: AtomicBool::new(true),
        }
    }

    pub fn failing(error: MediaAcquisitionError) -> Self {
        let device = Self::new();
        *device.failure.lock() = Some(error);
        device
    }

    /// Verzögert jedes `open`, um Rennen mit Signaling-Events zu testen
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }

    /// Gerät ohne Kamera
    pub fn without_video(self) -> Self {
        self.video.store(false, Ordering::SeqCst);
        self
    }

    pub fn live_streams(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn max_live_streams(&self) -> usize {
        self.counters.max_live.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.counters.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureDevice for FakeCaptureDevice {
    fn supports(&self, constraints: &MediaConstraints) -> bool {
        constraints.video.is_none() || self.video.load(Ordering::SeqCst)
    }

    async fn open(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<CapturedMedia, MediaAcquisitionError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failure.lock().clone();
        if let Some(error) = failure {
            return Err(error);
        }

        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);

        let mut tracks = vec![sample_track(TrackKind::Audio)];
        if constraints.video.is_some() {
            tracks.push(sample_track(TrackKind::Video));
        }

        Ok(CapturedMedia {
            tracks,
            stream: Box::new(FakeStream {
                counters: Arc::clone(&self.counters),
                stopped: AtomicBool::new(false),
            }),
        })
    }
}

// ============================================================================
// PEER ENGINE
// ============================================================================

#[derive(Default)]
struct EngineRecord {
    tracks: Vec<TrackKind>,
    offers: Vec<String>,
    candidates: Vec<IceCandidate>,
}

pub struct FakePeerEngine {
    call_type: CallType,
    events: PeerEventSink,
    record: Mutex<EngineRecord>,
    fail_answers: bool,
    closes: AtomicUsize,
}

impl FakePeerEngine {
    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    /// Simuliert einen Engine-Callback
    pub fn emit(&self, event: PeerEvent) {
        (self.events)(event);
    }

    pub fn tracks(&self) -> Vec<TrackKind> {
        self.record.lock().tracks.clone()
    }

    pub fn offers(&self) -> Vec<String> {
        self.record.lock().offers.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.record.lock().candidates.clone()
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_calls() > 0
    }
}

#[async_trait]
impl PeerEngine for FakePeerEngine {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), PeerSessionError> {
        self.record.lock().tracks.push(track.kind());
        Ok(())
    }

    async fn set_remote_offer(&self, sdp: &str) -> Result<(), PeerSessionError> {
        if sdp.is_empty() {
            return Err(PeerSessionError::Engine("empty SDP".to_string()));
        }
        self.record.lock().offers.push(sdp.to_string());
        Ok(())
    }

    async fn create_answer(&self) -> Result<String, PeerSessionError> {
        if self.fail_answers {
            return Err(PeerSessionError::Engine("answer rejected".to_string()));
        }
        let record = self.record.lock();
        let offer = record.offers.last().cloned().unwrap_or_default();
        Ok(format!("answer-to-{offer}"))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerSessionError> {
        self.record.lock().candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerSessionError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePeerEngineFactory {
    engines: Mutex<Vec<Arc<FakePeerEngine>>>,
    fail_answers: AtomicBool,
}

impl FakePeerEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_answers(&self, fail: bool) {
        self.fail_answers.store(fail, Ordering::SeqCst);
    }

    pub fn engines(&self) -> Vec<Arc<FakePeerEngine>> {
        self.engines.lock().clone()
    }

    pub fn last_engine(&self) -> Option<Arc<FakePeerEngine>> {
        self.engines.lock().last().cloned()
    }

    /// Anzahl der Engines, die noch nicht geschlossen wurden
    pub fn open_engines(&self) -> usize {
        self.engines.lock().iter().filter(|e| !e.is_closed()).count()
    }
}

#[async_trait]
impl PeerEngineFactory for FakePeerEngineFactory {
    async fn create(
        &self,
        call_type: CallType,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerEngine>, PeerSessionError> {
        let engine = Arc::new(FakePeerEngine {
            call_type,
            events,
            record: Mutex::new(EngineRecord::default()),
            fail_answers: self.fail_answers.load(Ordering::SeqCst),
            closes: AtomicUsize::new(0),
        });
        self.engines.lock().push(Arc::clone(&engine));
        Ok(engine)
    }
}
