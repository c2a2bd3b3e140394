//! Session description tokens.
//!
//! A token is the JSON form of a [`SessionDescription`] wrapped in standard
//! base64, the same bytes a browser produces with
//! `btoa(JSON.stringify(pc.localDescription))`. Tokens are pasted by hand, so
//! decoding ignores any whitespace a chat client or terminal inserted.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
            SdpKind::Pranswer => "pranswer",
            SdpKind::Rollback => "rollback",
        }
    }
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side's negotiation record: the role marker plus the SDP body that
/// carries transport parameters, gathered candidates and the data-channel
/// section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Fails unless this description carries the `expected` role marker.
    pub fn expect_kind(self, expected: SdpKind) -> Result<Self, DecodeError> {
        if self.kind == expected {
            Ok(self)
        } else {
            Err(DecodeError::UnexpectedKind {
                expected,
                found: self.kind,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("token is empty")]
    Empty,
    #[error("token is not valid base64: {0}")]
    Base64(String),
    #[error("token does not contain utf-8 text")]
    Utf8,
    #[error("token does not contain a session description: {0}")]
    Json(String),
    #[error("expected an {expected} description but the token holds an {found}")]
    UnexpectedKind { expected: SdpKind, found: SdpKind },
}

pub fn encode(description: &SessionDescription) -> String {
    // A struct of a unit enum and a string always serializes.
    let json = serde_json::to_string(description).unwrap_or_default();
    STANDARD.encode(json)
}

pub fn decode(token: &str) -> Result<SessionDescription, DecodeError> {
    let compact: String = token
        .chars()
        .filter(|ch| !ch.is_ascii_whitespace())
        .collect();
    if compact.is_empty() {
        return Err(DecodeError::Empty);
    }
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|err| DecodeError::Base64(err.to_string()))?;
    let json = String::from_utf8(bytes).map_err(|_| DecodeError::Utf8)?;
    serde_json::from_str(&json).map_err(|err| DecodeError::Json(err.to_string()))
}
