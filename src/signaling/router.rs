//! Signaling Router
//!
//! Verteilt eingehende Server-Nachrichten strikt nach Kanal an die Call
//! Session des jeweiligen Anruf-Typs und führt den Verbindungsstatus.

use super::client::TransportEvent;
use super::messages::ServerMessage;
use crate::call_engine::{CallType, SessionEvent, SessionHandle};
use std::collections::HashMap;
use tokio::sync::{mpsc, watch};

// ============================================================================
// TRANSPORT STATUS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStatus {
    pub connected: bool,
    pub text: String,
}

impl Default for TransportStatus {
    fn default() -> Self {
        Self {
            connected: false,
            text: "Connecting to signaling server".to_string(),
        }
    }
}

// ============================================================================
// ROUTER
// ============================================================================

pub struct SignalingRouter {
    sessions: HashMap<CallType, SessionHandle>,
    status: watch::Sender<TransportStatus>,
}

impl SignalingRouter {
    pub fn new(sessions: impl IntoIterator<Item = SessionHandle>) -> Self {
        let sessions = sessions
            .into_iter()
            .map(|handle| (handle.call_type(), handle))
            .collect();
        let (status, _) = watch::channel(TransportStatus::default());

        Self { sessions, status }
    }

    pub fn transport_status(&self) -> watch::Receiver<TransportStatus> {
        self.status.subscribe()
    }

    /// Verarbeitet Transport-Events, bis der Client aufhört
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        tracing::debug!("Signaling router stopped");
    }

    pub fn handle(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.set_status(true, "Connected"),

            // Laufende Anrufe bleiben unberührt
            TransportEvent::Disconnected => self.set_status(false, "Disconnected, reconnecting"),

            TransportEvent::Message(message) => self.dispatch(message),
        }
    }

    fn dispatch(&self, message: ServerMessage) {
        let (channel, event) = match message {
            ServerMessage::IncomingCall {
                channel,
                from_peer_id,
            } => (
                channel,
                SessionEvent::IncomingCall {
                    peer_id: from_peer_id,
                },
            ),
            ServerMessage::Signal {
                channel,
                from_peer_id,
                signal,
            } => (
                channel,
                SessionEvent::Signal {
                    peer_id: from_peer_id,
                    payload: signal,
                },
            ),
            ServerMessage::CallEnded {
                channel,
                from_peer_id,
            } => (
                channel,
                SessionEvent::CallEnded {
                    peer_id: from_peer_id,
                },
            ),
            ServerMessage::Error { code, message } => {
                tracing::error!("Server error {}: {}", code, message);
                return;
            }
            ServerMessage::Unknown => {
                tracing::debug!("Ignoring unknown server message");
                return;
            }
        };

        match self.sessions.get(&channel) {
            Some(session) => {
                if !session.send(event) {
                    tracing::warn!("{} call session is gone, dropping event", channel);
                }
            }
            None => tracing::warn!("No call session registered for {} channel", channel),
        }
    }

    fn set_status(&self, connected: bool, text: &str) {
        self.status.send_replace(TransportStatus {
            connected,
            text: text.to_string(),
        });
    }
}

impl std::fmt::Debug for SignalingRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingRouter")
            .field("channels", &self.sessions.keys().collect::<Vec<_>>())
            .finish()
    }
}
