//! Message Types für das Signaling-Protokoll
//!
//! JSON, getaggt über das Feld `type`. Jede Nachricht gehört zu genau
//! einem Kanal (`audio` / `video`).

use crate::call_engine::{CallType, RawCandidate};
use serde::{Deserialize, Serialize};

// ============================================================================
// SIGNAL PAYLOAD
// ============================================================================

/// Inhalt einer `signal`-Nachricht, in beide Richtungen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: RawCandidate },
    Ready,
}

impl SignalPayload {
    /// Kurzname für Logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Candidate { .. } => "candidate",
            SignalPayload::Ready => "ready",
        }
    }
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Nachricht mit Zeitstempel, so wie sie auf die Leitung geht
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedMessage<T: Serialize> {
    #[serde(flatten)]
    pub payload: T,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Anmeldung des Geräts auf einem Kanal
    DeviceJoin {
        #[serde(rename = "deviceId")]
        device_id: String,
        channel: CallType,
    },

    Signal {
        channel: CallType,
        #[serde(rename = "toPeerId")]
        to_peer_id: String,
        signal: SignalPayload,
    },

    CallEnded {
        channel: CallType,
        #[serde(rename = "toPeerId")]
        to_peer_id: String,
    },
}

impl ClientMessage {
    pub fn channel(&self) -> CallType {
        match self {
            ClientMessage::DeviceJoin { channel, .. }
            | ClientMessage::Signal { channel, .. }
            | ClientMessage::CallEnded { channel, .. } => *channel,
        }
    }

    /// Serialisiert die Nachricht mit Zeitstempel (Millisekunden)
    pub fn to_wire(&self, timestamp: i64) -> Result<String, serde_json::Error> {
        serde_json::to_string(&TimestampedMessage {
            payload: self,
            timestamp,
        })
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle Server-Nachrichten, die das Gerät versteht
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Eingehender Anruf auf einem Kanal
    IncomingCall {
        channel: CallType,
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
    },

    Signal {
        channel: CallType,
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        signal: SignalPayload,
    },

    /// Anruf von der Gegenseite beendet
    CallEnded {
        channel: CallType,
        #[serde(rename = "fromPeerId", default)]
        from_peer_id: Option<String>,
    },

    Error { code: i32, message: String },

    /// Unbekannte Nachrichtentypen werden ignoriert
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Kanal der Nachricht, falls sie zu einem gehört
    pub fn channel(&self) -> Option<CallType> {
        match self {
            ServerMessage::IncomingCall { channel, .. }
            | ServerMessage::Signal { channel, .. }
            | ServerMessage::CallEnded { channel, .. } => Some(*channel),
            ServerMessage::Error { .. } | ServerMessage::Unknown => None,
        }
    }
}
