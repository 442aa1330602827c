//! Pulse Endpoint - Geräteseitiger Anruf-Endpunkt
//!
//! Nimmt von außen initiierte Audio- und Video-Anrufe an:
//! - WebSocket-Signaling mit automatischem Reconnect
//! - WebRTC für die Medienverbindung
//! - Eine Call Session pro Kanal (Audio / Video), unabhängig voneinander

pub mod call_engine;
pub mod config;
pub mod identity;
pub mod signaling;

use call_engine::{
    CallStatus, CallType, CpalCaptureDevice, MediaManager, SessionContext, SessionHandle,
    WebRtcEngineFactory,
};
use config::EndpointConfig;
use identity::DeviceIdentity;
use signaling::{DeviceRegistration, SignalingClient, SignalingRouter, TransportStatus};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert Logging; `RUST_LOG` wird um die Defaults ergänzt
pub fn init_tracing() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pulse_endpoint=debug".parse()?)
                .add_directive("webrtc=warn".parse()?),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}

// ============================================================================
// ENDPOINT
// ============================================================================

/// Startet den Endpoint und läuft bis Ctrl-C
pub async fn run(config: EndpointConfig) -> anyhow::Result<()> {
    tracing::info!("Starting Pulse Endpoint...");

    let device_id = match config.device_id.clone() {
        Some(device_id) => device_id,
        None => DeviceIdentity::load_or_create()?.device_id().to_string(),
    };
    tracing::info!("Device id: {}", device_id);

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();

    let ctx = SessionContext {
        media: Arc::new(MediaManager::new(Arc::new(CpalCaptureDevice::new()))),
        peers: Arc::new(WebRtcEngineFactory::new(config.ice_servers.clone())),
        outbound: outbound_tx,
        end_grace: config.end_grace,
    };

    let mut sessions = Vec::new();
    let mut session_tasks = Vec::new();
    for call_type in CallType::ALL {
        let (handle, task) = SessionHandle::spawn(call_type, ctx.clone());
        log_call_status(call_type, handle.status());
        sessions.push(handle);
        session_tasks.push(task);
    }
    drop(ctx);

    let router = SignalingRouter::new(sessions);
    log_transport_status(router.transport_status());

    let client = SignalingClient::new(
        config.signaling_url.clone(),
        config.reconnect_delay,
        config.heartbeat,
        DeviceRegistration::new(device_id, CallType::ALL),
    );
    let client_task = client.spawn(outbound_rx, transport_tx);
    let router_task = tokio::spawn(router.run(transport_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    // Client beenden schließt die Transport-Queue; Router und Sessions
    // laufen danach aus und bauen ihre Anrufe ab
    client_task.abort();
    router_task.await?;
    for task in session_tasks {
        task.await?;
    }

    tracing::info!("Pulse Endpoint stopped");
    Ok(())
}

fn log_call_status(call_type: CallType, mut status: watch::Receiver<CallStatus>) {
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            tracing::info!(
                "[{}] {:?}: {} (active: {})",
                call_type,
                current.state,
                current.text,
                current.active
            );
        }
    });
}

fn log_transport_status(mut status: watch::Receiver<TransportStatus>) {
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            tracing::info!("[signaling] {}", current.text);
        }
    });
}
