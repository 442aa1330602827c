//! Signaling Module - WebSocket Client und Routing
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Server:
//! - WebSocket-Verbindung aufbauen und halten
//! - Gerät auf allen Kanälen anmelden
//! - Eingehende Nachrichten parsen und an die Call Sessions verteilen
//!

mod client;
mod messages;
mod router;

pub use client::{DeviceRegistration, SignalingClient, SignalingError, TransportEvent};
pub use messages::*;
pub use router::{SignalingRouter, TransportStatus};
