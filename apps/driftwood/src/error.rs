use thiserror::Error;

use crate::codec::DecodeError;
use crate::transport::TransportError;

/// Failures surfaced by a [`crate::session::ConnectionSession`].
///
/// `Decode` and `Negotiation` are returned from the offer/answer operations
/// and leave the caller free to retry. `State` signals a call made in the
/// wrong lifecycle phase. `Transfer` and `Parse` are recovered inside the
/// session and only show up in [`crate::session::Delivery::Rejected`] or the
/// logs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("invalid session token: {0}")]
    Decode(#[from] DecodeError),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("invalid session state: {0}")]
    State(String),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("malformed frame: {0}")]
    Parse(String),
}

impl SessionError {
    pub fn negotiation(err: TransportError) -> Self {
        SessionError::Negotiation(err.to_string())
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, SessionError::Decode(_))
    }

    pub fn is_negotiation(&self) -> bool {
        matches!(self, SessionError::Negotiation(_))
    }

    pub fn is_state(&self) -> bool {
        matches!(self, SessionError::State(_))
    }
}
