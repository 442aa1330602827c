//! ICE Candidate Normalisierung
//!
//! Candidates kommen über das Signaling entweder als strukturiertes
//! JSON-Objekt oder als rohe Transport-Zeile:
//!
//! ```text
//! candidate:<foundation> <component> <protocol> <priority> <ip> <port> typ <type> [sdpMid <mid>] [sdpMLineIndex <n>] [ufrag <u>]
//! ```
//!
//! Beide Formen werden hier in einen `IceCandidate` überführt.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Default für `sdpMid`, wenn die Zeile keinen Wert mitbringt
pub const DEFAULT_SDP_MID: &str = "0";

/// Default für `sdpMLineIndex`, wenn die Zeile keinen Wert mitbringt
pub const DEFAULT_SDP_MLINE_INDEX: u16 = 0;

const CANDIDATE_TYPES: [&str; 4] = ["host", "srflx", "prflx", "relay"];

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CandidateParseError {
    #[error("Candidate line must start with 'candidate:'")]
    MissingPrefix,

    #[error("Candidate line is missing field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid value for '{field}': {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("Token '{0}' has no value")]
    DanglingToken(String),
}

// ============================================================================
// CANDIDATE TYPES
// ============================================================================

/// Strukturierte, kanonische Form eines ICE Candidates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// Candidate wie er über das Signaling ankommt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawCandidate {
    Structured(IceCandidate),
    Line(String),
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Normalisiert einen Candidate. `None` heißt: Candidate verwerfen.
pub fn normalize(raw: RawCandidate) -> Option<IceCandidate> {
    try_normalize(raw).ok()
}

/// Wie [`normalize`], liefert aber den Grund für das Verwerfen
pub fn try_normalize(raw: RawCandidate) -> Result<IceCandidate, CandidateParseError> {
    match raw {
        RawCandidate::Structured(candidate) => Ok(candidate),
        RawCandidate::Line(line) => parse_line(&line),
    }
}

/// Parst eine Transport-Zeile nach der positionalen Grammatik
pub fn parse_line(line: &str) -> Result<IceCandidate, CandidateParseError> {
    let line = line.trim();
    let line = line.strip_prefix("a=").unwrap_or(line);
    let body = line
        .strip_prefix("candidate:")
        .ok_or(CandidateParseError::MissingPrefix)?;

    let mut tokens = body.split_whitespace();
    let mut next = |field: &'static str| tokens.next().ok_or(CandidateParseError::MissingField(field));

    let foundation = next("foundation")?;
    let component = numeric::<u16>("component", next("component")?)?;
    let protocol = next("protocol")?;
    if !protocol.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(invalid("protocol", protocol));
    }
    let priority = numeric::<u32>("priority", next("priority")?)?;
    let ip = next("ip")?;
    let port = numeric::<u16>("port", next("port")?)?;
    let typ = next("typ")?;
    if typ != "typ" {
        return Err(invalid("typ", typ));
    }
    let candidate_type = next("type")?;
    if !CANDIDATE_TYPES.contains(&candidate_type) {
        return Err(invalid("type", candidate_type));
    }

    // Trailer: sdpMid / sdpMLineIndex / ufrag herausziehen, Rest behalten
    let mut sdp_mid = None;
    let mut sdp_mline_index = None;
    let mut username_fragment = None;
    let mut extensions: Vec<&str> = Vec::new();

    while let Some(token) = tokens.next() {
        match token {
            "sdpMid" | "sdpMLineIndex" | "ufrag" => {
                let value = tokens
                    .next()
                    .ok_or_else(|| CandidateParseError::DanglingToken(token.to_string()))?;
                match token {
                    "sdpMid" => sdp_mid = Some(value.to_string()),
                    "sdpMLineIndex" => {
                        sdp_mline_index = Some(numeric::<u16>("sdpMLineIndex", value)?)
                    }
                    _ => username_fragment = Some(value.to_string()),
                }
            }
            other => extensions.push(other),
        }
    }

    let mut candidate = format!(
        "candidate:{foundation} {component} {protocol} {priority} {ip} {port} typ {candidate_type}"
    );
    for extension in extensions {
        candidate.push(' ');
        candidate.push_str(extension);
    }

    Ok(IceCandidate {
        candidate,
        sdp_mid: Some(sdp_mid.unwrap_or_else(|| DEFAULT_SDP_MID.to_string())),
        sdp_mline_index: Some(sdp_mline_index.unwrap_or(DEFAULT_SDP_MLINE_INDEX)),
        username_fragment,
    })
}

fn numeric<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, CandidateParseError> {
    value.parse::<T>().map_err(|_| invalid(field, value))
}

fn invalid(field: &'static str, value: &str) -> CandidateParseError {
    CandidateParseError::InvalidField {
        field,
        value: value.to_string(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
