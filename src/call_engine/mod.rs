//! Call Engine Module - Anruf-Orchestrierung
//!
//! Dieses Modul verwaltet:
//! - Call Sessions pro Anruf-Typ (Audio / Video)
//! - WebRTC Peer Connections
//! - Media Capture (Mikrofon, PCMU)
//! - Normalisierung von ICE Candidates

mod audio;
mod call_type;
mod candidate;
mod engine;
mod media;
mod peer;
mod session;

#[cfg(test)]
mod fakes;

pub use audio::{AudioError, AudioPlayback, CpalCaptureDevice, FRAME_SIZE, SAMPLE_RATE};
pub use call_type::CallType;
pub use candidate::{normalize, try_normalize, CandidateParseError, IceCandidate, RawCandidate};
pub use engine::{default_ice_servers, WebRtcEngineFactory};
pub use media::{
    CaptureDevice, CaptureStream, CapturedMedia, LocalTrack, MediaAcquisitionError,
    MediaConstraints, MediaHandle, MediaManager, RevokeNotice, TrackKind,
};
pub use peer::{
    PeerConnectionState, PeerEngine, PeerEngineFactory, PeerEvent, PeerEventSink, PeerSession,
    PeerSessionError, TrackDisposition,
};
pub use session::{CallState, CallStatus, SessionContext, SessionEvent, SessionHandle, WAITING_TEXT};

#[cfg(test)]
pub(crate) use session::SessionInput;
