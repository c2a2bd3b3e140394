//! Host transport capability.
//!
//! The session never touches a peer connection directly. It asks a
//! [`PeerConnector`] for a fresh [`PeerLink`] per negotiation and learns about
//! everything that happens on it through [`LinkEvent`]s, which keeps the
//! connection logic testable without a network.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::codec::SessionDescription;

pub mod loopback;
pub mod webrtc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    ChannelOpen,
    ChannelClosed,
    Message(String),
    Connectivity(ConnectivityState),
    Gathering(GatheringState),
    /// Unrecoverable transport or channel error.
    Failed(String),
}

pub type LinkEvents = mpsc::UnboundedSender<LinkEvent>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("timeout")]
    Timeout,
    #[error("send failed: {0}")]
    Send(String),
}

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Builds a fresh transport identity for `role`. Every lifecycle event of
    /// the link and of the data channel it carries is delivered on `events`.
    async fn connect(
        &self,
        role: Role,
        events: LinkEvents,
    ) -> Result<Arc<dyn PeerLink>, TransportError>;
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    fn role(&self) -> Role;

    /// Opens the application data channel. Offerer only; the answerer adopts
    /// whichever channel the remote side opens.
    async fn open_channel(&self, label: &str) -> Result<(), TransportError>;

    /// Creates an offer or answer (per role) and installs it as the local
    /// description, which starts candidate gathering.
    async fn create_local_description(&self) -> Result<(), TransportError>;

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Resolves once candidate gathering has finished.
    async fn gathering_complete(&self);

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn send(&self, payload: &str) -> Result<(), TransportError>;

    fn is_channel_open(&self) -> bool;

    /// Closes the channel, then the underlying connection.
    async fn close(&self);
}
