//! Anruf-Typen
//!
//! Jeder Anruf-Typ hat einen eigenen Signaling-Kanal und eine eigene
//! Call Session. Audio- und Video-Kanal teilen sich keinen Zustand.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Art des Anrufs, gleichzeitig der Name des Signaling-Kanals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Nur Audio
    Audio,
    /// Audio + Video
    Video,
}

impl CallType {
    /// Alle Kanäle, auf denen sich das Gerät anmeldet
    pub const ALL: [CallType; 2] = [CallType::Audio, CallType::Video];

    /// Name des Kanals im Wire-Format
    pub fn channel(self) -> &'static str {
        match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
        }
    }

    /// Ob eingehendes Remote-Audio abgespielt wird.
    ///
    /// Nur Audio-Anrufe haben eine Wiedergabe-Fläche. Remote-Audio in
    /// einem Video-Anruf wird verworfen.
    pub fn plays_remote_audio(self) -> bool {
        matches!(self, CallType::Audio)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.channel())
    }
}
