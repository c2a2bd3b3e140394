//! Connection lifecycle as a pure transition function.
//!
//! Every event the session sees, whether raised by the link or by one of its
//! own operations, goes through [`step`]. The caller applies the returned
//! effects in order and then commits the next state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::protocol::{self, MessageKind, Sender};
use crate::transport::{ConnectivityState, GatheringState, LinkEvent};

pub const PEER_CONNECTED: &str = "Peer connected!";
pub const PEER_DISCONNECTED: &str = "Peer disconnected.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        }
    }

    fn is_live(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// `create_offer` or `accept_offer` built a new local identity.
    NegotiationStarted,
    /// Negotiation was abandoned before a channel existed.
    NegotiationAborted,
    ChannelOpen,
    ChannelClosed,
    Inbound(String),
    Connectivity(ConnectivityState),
    Gathering(GatheringState),
    Failed(String),
    CloseRequested,
}

impl From<LinkEvent> for SessionEvent {
    fn from(event: LinkEvent) -> Self {
        match event {
            LinkEvent::ChannelOpen => SessionEvent::ChannelOpen,
            LinkEvent::ChannelClosed => SessionEvent::ChannelClosed,
            LinkEvent::Message(payload) => SessionEvent::Inbound(payload),
            LinkEvent::Connectivity(state) => SessionEvent::Connectivity(state),
            LinkEvent::Gathering(state) => SessionEvent::Gathering(state),
            LinkEvent::Failed(reason) => SessionEvent::Failed(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Append {
        kind: MessageKind,
        content: String,
        sender: Sender,
    },
    /// Inbound payload dropped without touching state.
    Discard(SessionError),
    /// Close the link and clear the log; the session stays in the next state.
    Teardown,
}

impl Effect {
    fn system(content: &str) -> Self {
        Effect::Append {
            kind: MessageKind::System,
            content: content.to_string(),
            sender: Sender::Me,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: ConnectionState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn quiet(next: ConnectionState) -> Self {
        Self {
            next,
            effects: Vec::new(),
        }
    }

    fn to(next: ConnectionState, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }
}

pub fn step(state: ConnectionState, event: SessionEvent) -> Transition {
    use ConnectionState::*;

    match (state, event) {
        (_, SessionEvent::NegotiationStarted) => Transition::quiet(Connecting),
        (Connecting, SessionEvent::NegotiationAborted) => Transition::quiet(Disconnected),
        (_, SessionEvent::CloseRequested) => Transition::quiet(Disconnected),

        (Connecting, SessionEvent::ChannelOpen) => {
            Transition::to(Connected, vec![Effect::system(PEER_CONNECTED)])
        }
        (Connected, SessionEvent::ChannelClosed) => {
            Transition::to(Disconnected, vec![Effect::system(PEER_DISCONNECTED)])
        }
        // The channel never opened, so there was no peer to lose.
        (Connecting, SessionEvent::ChannelClosed) => Transition::quiet(Disconnected),

        (live, SessionEvent::Failed(_)) if live.is_live() => {
            Transition::to(Failed, vec![Effect::Teardown])
        }
        (live, SessionEvent::Connectivity(ConnectivityState::Failed)) if live.is_live() => {
            Transition::to(Failed, vec![Effect::Teardown])
        }

        (live, SessionEvent::Inbound(payload)) if live.is_live() => {
            let effect = match protocol::decode_frame(&payload) {
                Ok(frame) => {
                    let (kind, content) = frame.into_parts();
                    Effect::Append {
                        kind,
                        content,
                        sender: Sender::Peer,
                    }
                }
                Err(err) => Effect::Discard(err),
            };
            Transition::to(live, vec![effect])
        }

        (state, _) => Transition::quiet(state),
    }
}
