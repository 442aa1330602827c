//! WebSocket Client für den Signaling-Server
//!
//! Hält die Verbindung offen:
//! - Automatische Reconnection nach fester Pause
//! - WebSocket-Pings als Heartbeat
//! - Gerät wird auf jeder neuen Verbindung zuerst angemeldet
//! - Ausgehende Nachrichten warten in der Queue, solange keine Verbindung besteht

use super::messages::{ClientMessage, ServerMessage};
use crate::call_engine::CallType;
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Connection closed by server")]
    ClosedByServer,
}

// ============================================================================
// TRANSPORT EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Verbunden (auch nach Reconnect)
    Connected,

    /// Verbindung getrennt, Reconnect läuft
    Disconnected,

    /// Nachricht vom Server
    Message(ServerMessage),
}

// ============================================================================
// DEVICE REGISTRATION
// ============================================================================

/// Presence des Geräts: ein `device_join` pro Kanal und Verbindung
#[derive(Debug, Clone)]
pub struct DeviceRegistration {
    device_id: String,
    channels: Vec<CallType>,
    announced: HashSet<CallType>,
}

impl DeviceRegistration {
    pub fn new(device_id: impl Into<String>, channels: impl IntoIterator<Item = CallType>) -> Self {
        Self {
            device_id: device_id.into(),
            channels: channels.into_iter().collect(),
            announced: HashSet::new(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Join-Nachrichten für alle Kanäle, die auf dieser Verbindung noch
    /// nicht angemeldet sind
    pub fn on_connected(&mut self) -> Vec<ClientMessage> {
        let mut joins = Vec::new();
        for &channel in &self.channels {
            if self.announced.insert(channel) {
                joins.push(ClientMessage::DeviceJoin {
                    device_id: self.device_id.clone(),
                    channel,
                });
            }
        }
        joins
    }

    /// Nächste Verbindung meldet wieder an
    pub fn on_disconnected(&mut self) {
        self.announced.clear();
    }
}

// ============================================================================
// OUTBOX
// ============================================================================

/// Ausgehende Queue plus eine Nachricht, deren Versand abgebrochen ist
struct Outbox {
    queue: mpsc::UnboundedReceiver<ClientMessage>,
    retry: Option<ClientMessage>,
}

impl Outbox {
    fn new(queue: mpsc::UnboundedReceiver<ClientMessage>) -> Self {
        Self { queue, retry: None }
    }

    /// Zuerst die abgebrochene Nachricht, dann die Queue
    async fn next(&mut self) -> Option<ClientMessage> {
        match self.retry.take() {
            Some(message) => Some(message),
            None => self.queue.recv().await,
        }
    }

    fn retry(&mut self, message: ClientMessage) {
        self.retry = Some(message);
    }
}

/// Wie es mit einer Verbindung zu Ende ging
enum Outcome {
    /// Queue geschlossen: Endpoint fährt herunter
    Shutdown,
    Lost(SignalingError),
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Signaling-Server Kommunikation
#[derive(Debug, Clone)]
pub struct SignalingClient {
    url: Url,
    reconnect_delay: Duration,
    heartbeat: Duration,
    registration: DeviceRegistration,
}

impl SignalingClient {
    pub fn new(
        url: Url,
        reconnect_delay: Duration,
        heartbeat: Duration,
        registration: DeviceRegistration,
    ) -> Self {
        Self {
            url,
            reconnect_delay,
            heartbeat,
            registration,
        }
    }

    /// Startet die Verbindungsschleife.
    ///
    /// Läuft, bis `outbound` geschlossen ist oder niemand mehr `events`
    /// empfängt.
    pub fn spawn(
        self,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(outbound, events))
    }

    async fn run(
        mut self,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) {
        let mut outbox = Outbox::new(outbound);

        loop {
            tracing::info!("Connecting to signaling server: {}", self.url);

            match connect_async(self.url.as_str()).await {
                Ok((ws_stream, _)) => {
                    tracing::info!("Connected to signaling server");
                    if events.send(TransportEvent::Connected).is_err() {
                        return;
                    }

                    let outcome = self.drive(ws_stream, &mut outbox, &events).await;
                    self.registration.on_disconnected();
                    let _ = events.send(TransportEvent::Disconnected);

                    match outcome {
                        Outcome::Shutdown => {
                            tracing::info!("Signaling client stopped");
                            return;
                        }
                        Outcome::Lost(e) => tracing::warn!("{}", e),
                    }
                }
                Err(e) => {
                    let error = SignalingError::ConnectionFailed(e.to_string());
                    tracing::warn!("{}", error);
                }
            }

            if events.is_closed() {
                return;
            }
            tracing::info!("Reconnecting in {:?}", self.reconnect_delay);
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    /// Bedient eine bestehende Verbindung bis zum Abbruch
    async fn drive(
        &mut self,
        ws_stream: WsStream,
        outbox: &mut Outbox,
        events: &mpsc::UnboundedSender<TransportEvent>,
    ) -> Outcome {
        let (mut write, mut read) = ws_stream.split();

        // Anmeldung geht vor die Queue
        for join in self.registration.on_connected() {
            tracing::info!(
                "Announcing device {} on {} channel",
                self.registration.device_id(),
                join.channel()
            );
            if let Err(e) = send_message(&mut write, &join).await {
                return Outcome::Lost(e);
            }
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(message) => {
                            if events.send(TransportEvent::Message(message)).is_err() {
                                let _ = write.send(Message::Close(None)).await;
                                return Outcome::Shutdown;
                            }
                        }
                        Err(e) => tracing::warn!("Ignoring unparsable server message: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("WebSocket closed by server");
                        return Outcome::Lost(SignalingError::ClosedByServer);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Outcome::Lost(SignalingError::ConnectionLost(e.to_string()));
                    }
                },

                message = outbox.next() => {
                    let Some(message) = message else {
                        let _ = write.send(Message::Close(None)).await;
                        return Outcome::Shutdown;
                    };
                    if let Err(e) = send_message(&mut write, &message).await {
                        outbox.retry(message);
                        return Outcome::Lost(e);
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        return Outcome::Lost(SignalingError::SendFailed(e.to_string()));
                    }
                }
            }
        }
    }
}

/// Schreibt eine Nachricht mit Zeitstempel. Nicht kodierbare Nachrichten
/// werden protokolliert und verworfen.
async fn send_message(write: &mut WsSink, message: &ClientMessage) -> Result<(), SignalingError> {
    let text = match message.to_wire(Utc::now().timestamp_millis()) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed to encode {:?}: {}", message, e);
            return Ok(());
        }
    };
    tracing::debug!("-> {}", text);
    write
        .send(Message::Text(text))
        .await
        .map_err(|e| SignalingError::SendFailed(e.to_string()))
}
