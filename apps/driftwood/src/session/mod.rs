//! Connection session: negotiation flows, channel lifecycle and the
//! conversation log for one peer-to-peer chat.
//!
//! A session hands out offer/answer tokens, owns the link produced by its
//! [`PeerConnector`] and the [`MessageLog`], and publishes every change on a
//! `watch` (state) and a `broadcast` (state, appends, clears) channel.
//!
//! Each negotiation runs under a generation number. Closing the session or
//! starting a new negotiation retires the current generation, and anything
//! still in flight for a retired generation (link events, gathering waits,
//! in-progress sends) is ignored when it lands.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::attachment::{self, ImageFile};
use crate::codec::{self, SdpKind, SessionDescription};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::protocol::{self, Message, MessageId, MessageLog, Sender, WireFrame};
use crate::transport::{LinkEvent, PeerConnector, PeerLink, Role};

pub mod machine;

pub use machine::{ConnectionState, Effect, SessionEvent, Transition};

const UPDATE_CAPACITY: usize = 256;
const IMAGE_SEND_FAILED: &str = "Failed to send image.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    State(ConnectionState),
    Appended(Message),
    Cleared,
}

/// Outcome of [`ConnectionSession::send`] and [`ConnectionSession::send_image`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Transmitted and logged under this id.
    Sent(MessageId),
    /// Nothing to do: channel not open, blank text, or the session went
    /// away before the message could be logged.
    Skipped,
    /// Not transmitted. Never changes the connection state.
    Rejected(SessionError),
}

impl Delivery {
    pub fn is_sent(&self) -> bool {
        matches!(self, Delivery::Sent(_))
    }
}

struct Inner {
    state: ConnectionState,
    log: MessageLog,
    link: Option<Arc<dyn PeerLink>>,
    role: Option<Role>,
    generation: u64,
}

struct Shared {
    connector: Arc<dyn PeerConnector>,
    config: SessionConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl Shared {
    /// Runs `event` through the state machine if `generation` is still the
    /// live one. Returns `false` once it has been retired.
    fn dispatch(&self, generation: u64, event: SessionEvent) -> bool {
        let retired = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return false;
            }
            self.apply(&mut inner, event)
        };
        if let Some(link) = retired {
            spawn_close(link);
        }
        true
    }

    fn apply(&self, inner: &mut Inner, event: SessionEvent) -> Option<Arc<dyn PeerLink>> {
        trace!(state = %inner.state, ?event, "dispatching session event");
        let Transition { next, effects } = machine::step(inner.state, event);
        let mut retired = None;
        for effect in effects {
            match effect {
                Effect::Append {
                    kind,
                    content,
                    sender,
                } => {
                    let message = inner.log.append(kind, content, sender).clone();
                    let _ = self.updates.send(SessionUpdate::Appended(message));
                }
                Effect::Discard(err) => {
                    warn!(error = %err, "dropping inbound payload");
                }
                Effect::Teardown => {
                    retired = self.retire(inner);
                }
            }
        }
        self.commit(inner, next);
        retired
    }

    /// Ends the current generation: forgets the link and role and clears the
    /// log. The caller closes the returned link outside the lock.
    fn retire(&self, inner: &mut Inner) -> Option<Arc<dyn PeerLink>> {
        inner.generation = inner.generation.wrapping_add(1);
        inner.role = None;
        if !inner.log.is_empty() {
            inner.log.clear();
            let _ = self.updates.send(SessionUpdate::Cleared);
        }
        inner.link.take()
    }

    fn commit(&self, inner: &mut Inner, next: ConnectionState) {
        if inner.state == next {
            return;
        }
        info!(from = %inner.state, to = %next, "connection state changed");
        inner.state = next;
        self.state_tx.send_replace(next);
        let _ = self.updates.send(SessionUpdate::State(next));
    }

    fn note(&self, generation: u64, content: String) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        let message = inner.log.system(content).clone();
        let _ = self.updates.send(SessionUpdate::Appended(message));
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(link) = self.inner.get_mut().link.take() {
            spawn_close(link);
        }
    }
}

fn spawn_close(link: Arc<dyn PeerLink>) {
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { link.close().await });
        }
        Err(_) => debug!("no runtime available; dropping link without closing"),
    }
}

fn spawn_pump(
    shared: Weak<Shared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            if !shared.dispatch(generation, event.into()) {
                break;
            }
        }
        trace!(generation, "link event pump finished");
    });
}

/// Handle to one chat session. Clones share the same session.
#[derive(Clone)]
pub struct ConnectionSession {
    shared: Arc<Shared>,
}

impl ConnectionSession {
    pub fn new(connector: Arc<dyn PeerConnector>, config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    log: MessageLog::new(),
                    link: None,
                    role: None,
                    generation: 0,
                }),
                state_tx,
                updates,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    pub fn role(&self) -> Option<Role> {
        self.shared.inner.lock().role
    }

    /// Snapshot of the conversation log in append order.
    pub fn messages(&self) -> Vec<Message> {
        self.shared.inner.lock().log.entries().to_vec()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.shared.updates.subscribe()
    }

    /// Starts a negotiation as the offering side and returns the offer token
    /// once candidate gathering has finished.
    pub async fn create_offer(&self) -> Result<String, SessionError> {
        let (link, generation) = self.begin(Role::Offerer).await?;
        match self.offer_on(&link, generation).await {
            Ok(token) => Ok(token),
            Err(err) => {
                warn!(error = %err, "offer negotiation failed");
                self.abort(generation).await;
                Err(err)
            }
        }
    }

    /// Consumes an offer token and returns the answer token for the peer.
    /// A malformed token is rejected before any transport is built.
    pub async fn accept_offer(&self, token: &str) -> Result<String, SessionError> {
        let description = codec::decode(token)?.expect_kind(SdpKind::Offer)?;
        let (link, generation) = self.begin(Role::Answerer).await?;
        match self.answer_on(&link, generation, description).await {
            Ok(token) => Ok(token),
            Err(err) => {
                warn!(error = %err, "answer negotiation failed");
                self.abort(generation).await;
                Err(err)
            }
        }
    }

    /// Completes the negotiation started by [`Self::create_offer`].
    pub async fn accept_answer(&self, token: &str) -> Result<(), SessionError> {
        let (link, generation) = {
            let inner = self.shared.inner.lock();
            match (&inner.link, inner.role) {
                (Some(link), Some(Role::Offerer)) => (Arc::clone(link), inner.generation),
                _ => {
                    return Err(SessionError::State(
                        "not initialized: no offer is pending on this session".into(),
                    ));
                }
            }
        };
        let description = codec::decode(token)?.expect_kind(SdpKind::Answer)?;
        if let Err(err) = link.apply_remote_description(description).await {
            warn!(error = %err, "failed to apply answer");
            self.shared
                .dispatch(generation, SessionEvent::Failed(err.to_string()));
            return Err(SessionError::negotiation(err));
        }
        debug!("answer applied; waiting for connectivity");
        Ok(())
    }

    pub async fn send(&self, text: &str) -> Delivery {
        if text.trim().is_empty() {
            return Delivery::Skipped;
        }
        let Some((link, generation)) = self.open_link() else {
            return Delivery::Skipped;
        };
        match self
            .transmit(&link, generation, WireFrame::Text(text.to_string()))
            .await
        {
            Ok(Some(id)) => Delivery::Sent(id),
            Ok(None) => Delivery::Skipped,
            Err(err) => {
                warn!(error = %err, "text message not sent");
                Delivery::Rejected(err)
            }
        }
    }

    pub async fn send_image(&self, file: ImageFile) -> Delivery {
        let Some((link, generation)) = self.open_link() else {
            return Delivery::Skipped;
        };
        let limit = self.shared.config.max_image_bytes;
        if file.len() > limit {
            self.shared.note(
                generation,
                format!(
                    "Image is too large (max {}).",
                    self.shared.config.image_limit_label()
                ),
            );
            return Delivery::Rejected(SessionError::Transfer(format!(
                "image is {} bytes, limit is {limit}",
                file.len()
            )));
        }

        let encoded = tokio::task::spawn_blocking(move || attachment::to_data_url(&file)).await;
        let payload = match encoded {
            Ok(Ok(payload)) => payload,
            Ok(Err(err)) => return self.image_failed(generation, err.to_string()),
            Err(err) => return self.image_failed(generation, err.to_string()),
        };

        match self
            .transmit(&link, generation, WireFrame::Image(payload))
            .await
        {
            Ok(Some(id)) => Delivery::Sent(id),
            Ok(None) => Delivery::Skipped,
            Err(err) => self.image_failed(generation, err.to_string()),
        }
    }

    /// Tears down the channel and transport and empties the log. Safe to call
    /// repeatedly.
    pub async fn close(&self) {
        let link = {
            let mut inner = self.shared.inner.lock();
            let link = self.shared.retire(&mut inner);
            let _ = self.shared.apply(&mut inner, SessionEvent::CloseRequested);
            link
        };
        if let Some(link) = link {
            info!(role = ?link.role(), "closing session");
            link.close().await;
        }
    }

    async fn begin(&self, role: Role) -> Result<(Arc<dyn PeerLink>, u64), SessionError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (generation, previous) = {
            let mut inner = self.shared.inner.lock();
            let previous = self.shared.retire(&mut inner);
            inner.role = Some(role);
            let _ = self
                .shared
                .apply(&mut inner, SessionEvent::NegotiationStarted);
            (inner.generation, previous)
        };
        if let Some(previous) = previous {
            debug!("replacing previous link");
            previous.close().await;
        }

        spawn_pump(Arc::downgrade(&self.shared), generation, events_rx);
        let link = match self.shared.connector.connect(role, events_tx).await {
            Ok(link) => link,
            Err(err) => {
                self.abort(generation).await;
                return Err(SessionError::negotiation(err));
            }
        };

        let stale = {
            let mut inner = self.shared.inner.lock();
            if inner.generation == generation {
                inner.link = Some(Arc::clone(&link));
                false
            } else {
                true
            }
        };
        if stale {
            link.close().await;
            return Err(closed_during_negotiation());
        }
        debug!(?role, generation, "negotiation started");
        Ok((link, generation))
    }

    async fn offer_on(
        &self,
        link: &Arc<dyn PeerLink>,
        generation: u64,
    ) -> Result<String, SessionError> {
        link.open_channel(&self.shared.config.channel_label)
            .await
            .map_err(SessionError::negotiation)?;
        link.create_local_description()
            .await
            .map_err(SessionError::negotiation)?;
        let description = self.finish_gathering(link, generation).await?;
        Ok(codec::encode(&description))
    }

    async fn answer_on(
        &self,
        link: &Arc<dyn PeerLink>,
        generation: u64,
        offer: SessionDescription,
    ) -> Result<String, SessionError> {
        link.apply_remote_description(offer)
            .await
            .map_err(SessionError::negotiation)?;
        link.create_local_description()
            .await
            .map_err(SessionError::negotiation)?;
        let description = self.finish_gathering(link, generation).await?;
        Ok(codec::encode(&description))
    }

    async fn finish_gathering(
        &self,
        link: &Arc<dyn PeerLink>,
        generation: u64,
    ) -> Result<SessionDescription, SessionError> {
        debug!(role = ?link.role(), "waiting for candidate gathering");
        match self.shared.config.gather_timeout {
            Some(limit) => timeout(limit, link.gathering_complete())
                .await
                .map_err(|_| {
                    SessionError::Negotiation(format!(
                        "candidate gathering did not finish within {limit:?}"
                    ))
                })?,
            None => link.gathering_complete().await,
        }
        if self.shared.inner.lock().generation != generation {
            return Err(closed_during_negotiation());
        }
        link.local_description().await.ok_or_else(|| {
            SessionError::Negotiation("local description missing after candidate gathering".into())
        })
    }

    /// Rolls a failed negotiation back to `disconnected`. No-op when the
    /// generation was already retired.
    async fn abort(&self, generation: u64) {
        let link = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                return;
            }
            let link = self.shared.retire(&mut inner);
            let _ = self
                .shared
                .apply(&mut inner, SessionEvent::NegotiationAborted);
            link
        };
        if let Some(link) = link {
            link.close().await;
        }
    }

    fn open_link(&self) -> Option<(Arc<dyn PeerLink>, u64)> {
        let inner = self.shared.inner.lock();
        let link = inner.link.as_ref()?;
        link.is_channel_open()
            .then(|| (Arc::clone(link), inner.generation))
    }

    /// Sends first and logs second, so a failed send never leaves a local
    /// message behind. `Ok(None)` means the frame went out but the session
    /// was closed before it could be logged.
    async fn transmit(
        &self,
        link: &Arc<dyn PeerLink>,
        generation: u64,
        frame: WireFrame,
    ) -> Result<Option<MessageId>, SessionError> {
        let payload = protocol::encode_frame(&frame)?;
        link.send(&payload)
            .await
            .map_err(|err| SessionError::Transfer(err.to_string()))?;
        trace!(kind = ?frame.kind(), payload_len = payload.len(), "frame sent");

        let (kind, content) = frame.into_parts();
        let mut inner = self.shared.inner.lock();
        if inner.generation != generation {
            return Ok(None);
        }
        let message = inner.log.append(kind, content, Sender::Me).clone();
        let id = message.id;
        let _ = self.shared.updates.send(SessionUpdate::Appended(message));
        Ok(Some(id))
    }

    fn image_failed(&self, generation: u64, reason: String) -> Delivery {
        warn!(error = %reason, "image not sent");
        self.shared.note(generation, IMAGE_SEND_FAILED.to_string());
        Delivery::Rejected(SessionError::Transfer(reason))
    }
}

fn closed_during_negotiation() -> SessionError {
    SessionError::State("session was closed during negotiation".into())
}
