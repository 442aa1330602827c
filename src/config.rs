//! Konfiguration aus Umgebungsvariablen
//!
//! | Variable | Default |
//! |---|---|
//! | `SIGNALING_URL` | `https://call-endpoint-signaling.local` |
//! | `DEVICE_ID` | persistierte UUID |
//! | `STUN_URLS` | Google STUN |
//! | `TURN_URL`, `TURN_USERNAME`, `TURN_CREDENTIAL` | kein TURN |
//! | `END_GRACE_MS` | 2000 |
//! | `RECONNECT_DELAY_MS` | 3000 |
//! | `HEARTBEAT_SECS` | 25 |

use crate::call_engine::default_ice_servers;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

pub const DEFAULT_SIGNALING_URL: &str = "https://call-endpoint-signaling.local";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },

    #[error("{var} requires {missing}")]
    Missing {
        var: &'static str,
        missing: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// WebSocket-URL (`ws`/`wss`, endet auf `/ws`)
    pub signaling_url: Url,
    /// Überschreibt die persistierte Device ID
    pub device_id: Option<String>,
    pub ice_servers: Vec<RTCIceServer>,
    pub end_grace: Duration,
    pub reconnect_delay: Duration,
    pub heartbeat: Duration,
}

impl EndpointConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Baut die Konfiguration aus einer beliebigen Quelle
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let signaling_url = websocket_url(
            get("SIGNALING_URL")
                .as_deref()
                .unwrap_or(DEFAULT_SIGNALING_URL),
        )?;

        let mut ice_servers = match get("STUN_URLS") {
            Some(urls) => vec![RTCIceServer {
                urls: urls
                    .split(',')
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(str::to_string)
                    .collect(),
                ..Default::default()
            }],
            None => default_ice_servers(),
        };

        if let Some(turn) = get("TURN_URL") {
            let username = get("TURN_USERNAME").ok_or(ConfigError::Missing {
                var: "TURN_URL",
                missing: "TURN_USERNAME",
            })?;
            let credential = get("TURN_CREDENTIAL").ok_or(ConfigError::Missing {
                var: "TURN_URL",
                missing: "TURN_CREDENTIAL",
            })?;
            ice_servers.push(RTCIceServer {
                urls: vec![turn],
                username,
                credential,
                ..Default::default()
            });
        }

        Ok(Self {
            signaling_url,
            device_id: get("DEVICE_ID"),
            ice_servers,
            end_grace: Duration::from_millis(number(&get, "END_GRACE_MS", 2000)?),
            reconnect_delay: Duration::from_millis(number(&get, "RECONNECT_DELAY_MS", 3000)?),
            heartbeat: Duration::from_secs(number(&get, "HEARTBEAT_SECS", 25)?),
        })
    }
}

fn number(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match get(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(default),
    }
}

/// `http(s)` → `ws(s)`, Pfad `/ws` anhängen
fn websocket_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid = || ConfigError::Invalid {
        var: "SIGNALING_URL",
        value: raw.to_string(),
    };

    let mut url = Url::parse(raw).map_err(|_| invalid())?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(invalid()),
    };
    url.set_scheme(scheme).map_err(|_| invalid())?;

    let path = url.path().trim_end_matches('/').to_string();
    if !path.ends_with("/ws") {
        url.set_path(&format!("{path}/ws"));
    }
    Ok(url)
}
