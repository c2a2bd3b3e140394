//! In-process transport. Links created by one [`LoopbackNetwork`] find each
//! other through the `o=` line of a placeholder session description, so two
//! sessions can run the full token exchange without sockets. The network
//! also exposes knobs to stall gathering and inject failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::{
    ConnectivityState, GatheringState, LinkEvent, LinkEvents, PeerConnector, PeerLink, Role,
    TransportError,
};
use crate::codec::{SdpKind, SessionDescription};

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Network>,
}

struct Network {
    links: Mutex<HashMap<u64, Weak<LoopbackLink>>>,
    next_id: AtomicU64,
    gathering_held: watch::Sender<bool>,
    fail_connect: AtomicBool,
    fail_remote: AtomicBool,
    fail_sends: AtomicBool,
}

impl Default for Network {
    fn default() -> Self {
        let (gathering_held, _) = watch::channel(false);
        Self {
            links: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            gathering_held,
            fail_connect: AtomicBool::new(false),
            fail_remote: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        }
    }
}

impl Network {
    fn find(&self, id: u64) -> Option<Arc<LoopbackLink>> {
        self.links.lock().get(&id).and_then(Weak::upgrade)
    }

    fn find_open(&self, role: Role) -> Option<Arc<LoopbackLink>> {
        let links = self.links.lock();
        links
            .values()
            .filter_map(Weak::upgrade)
            .filter(|link| link.role == role && link.is_channel_open())
            .max_by_key(|link| link.id)
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stalls every `gathering_complete` call until [`Self::release_gathering`].
    pub fn hold_gathering(&self) {
        self.inner.gathering_held.send_replace(true);
    }

    pub fn release_gathering(&self) {
        self.inner.gathering_held.send_replace(false);
    }

    pub fn fail_connects(&self, fail: bool) {
        self.inner.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_remote_descriptions(&self, fail: bool) {
        self.inner.fail_remote.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Number of links that have not been closed yet.
    pub fn live_links(&self) -> usize {
        self.inner
            .links
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|link| !link.state.lock().closed)
            .count()
    }

    /// Delivers a raw payload to the newest open link with `role`, as if the
    /// remote peer had sent it.
    pub fn inject(&self, role: Role, payload: &str) -> bool {
        match self.inner.find_open(role) {
            Some(link) => {
                link.emit(LinkEvent::Message(payload.to_string()));
                true
            }
            None => false,
        }
    }

    /// Reports a connectivity failure on the newest open link with `role`.
    pub fn break_link(&self, role: Role) -> bool {
        match self.inner.find_open(role) {
            Some(link) => {
                link.emit(LinkEvent::Connectivity(ConnectivityState::Failed));
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl PeerConnector for LoopbackNetwork {
    async fn connect(
        &self,
        role: Role,
        events: LinkEvents,
    ) -> Result<Arc<dyn PeerLink>, TransportError> {
        if self.inner.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Setup("loopback connect refused".into()));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let link = Arc::new(LoopbackLink {
            id,
            role,
            network: Arc::clone(&self.inner),
            events,
            state: Mutex::new(LinkState::default()),
        });
        self.inner.links.lock().insert(id, Arc::downgrade(&link));
        debug!(id, ?role, "loopback link created");
        let _ = link
            .events
            .send(LinkEvent::Connectivity(ConnectivityState::New));
        Ok(link)
    }
}

#[derive(Default)]
struct LinkState {
    label: Option<String>,
    local: Option<SessionDescription>,
    remote: Option<u64>,
    gathered: bool,
    channel_open: bool,
    closed: bool,
}

pub struct LoopbackLink {
    id: u64,
    role: Role,
    network: Arc<Network>,
    events: LinkEvents,
    state: Mutex<LinkState>,
}

impl LoopbackLink {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn describe(&self, kind: SdpKind, label: Option<&str>) -> SessionDescription {
        let mut sdp = format!(
            "v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.id
        );
        if let Some(label) = label {
            sdp.push_str(&format!("a=loopback-channel:{label}\r\n"));
        }
        SessionDescription { kind, sdp }
    }

    fn open(&self) {
        {
            let mut state = self.state.lock();
            if state.closed || state.channel_open {
                return;
            }
            state.channel_open = true;
        }
        self.emit(LinkEvent::Connectivity(ConnectivityState::Connecting));
        self.emit(LinkEvent::Connectivity(ConnectivityState::Connected));
        self.emit(LinkEvent::ChannelOpen);
    }

    fn remote_closed(&self) {
        let was_open = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.channel_open, false)
        };
        if was_open {
            self.emit(LinkEvent::ChannelClosed);
            self.emit(LinkEvent::Connectivity(ConnectivityState::Disconnected));
        }
    }
}

fn link_id(sdp: &str) -> Option<u64> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("o=- "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|id| id.parse().ok())
}

#[async_trait]
impl PeerLink for LoopbackLink {
    fn role(&self) -> Role {
        self.role
    }

    async fn open_channel(&self, label: &str) -> Result<(), TransportError> {
        if self.role != Role::Offerer {
            return Err(TransportError::Setup(
                "answerer adopts the remote channel".into(),
            ));
        }
        self.state.lock().label = Some(label.to_string());
        Ok(())
    }

    async fn create_local_description(&self) -> Result<(), TransportError> {
        let description = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::ChannelClosed);
            }
            let description = match self.role {
                Role::Offerer => self.describe(SdpKind::Offer, state.label.as_deref()),
                Role::Answerer => {
                    if state.remote.is_none() {
                        return Err(TransportError::Setup(
                            "answer requested before the offer was applied".into(),
                        ));
                    }
                    self.describe(SdpKind::Answer, None)
                }
            };
            state.local = Some(description.clone());
            description
        };
        trace!(id = self.id, kind = %description.kind, "local description set");
        self.emit(LinkEvent::Gathering(GatheringState::Gathering));
        Ok(())
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        if self.network.fail_remote.load(Ordering::SeqCst) {
            return Err(TransportError::Setup("remote description rejected".into()));
        }
        let expected = match self.role {
            Role::Offerer => SdpKind::Answer,
            Role::Answerer => SdpKind::Offer,
        };
        if description.kind != expected {
            return Err(TransportError::Setup(format!(
                "expected {expected}, got {}",
                description.kind
            )));
        }
        let remote_id = link_id(&description.sdp)
            .ok_or_else(|| TransportError::Setup("unrecognised session description".into()))?;
        let peer = self
            .network
            .find(remote_id)
            .ok_or_else(|| TransportError::Setup(format!("no loopback peer {remote_id}")))?;

        match self.role {
            Role::Answerer => {
                self.state.lock().remote = Some(remote_id);
            }
            Role::Offerer => {
                if peer.state.lock().remote != Some(self.id) {
                    return Err(TransportError::Setup(
                        "answer does not belong to this offer".into(),
                    ));
                }
                let has_channel = {
                    let mut state = self.state.lock();
                    state.remote = Some(remote_id);
                    state.label.is_some()
                };
                if has_channel {
                    self.open();
                    peer.open();
                } else {
                    self.emit(LinkEvent::Connectivity(ConnectivityState::Connected));
                    peer.emit(LinkEvent::Connectivity(ConnectivityState::Connected));
                }
            }
        }
        Ok(())
    }

    async fn gathering_complete(&self) {
        let mut held = self.network.gathering_held.subscribe();
        let _ = held.wait_for(|held| !*held).await;
        let first = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.gathered, true)
        };
        if first {
            self.emit(LinkEvent::Gathering(GatheringState::Complete));
        }
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    async fn send(&self, payload: &str) -> Result<(), TransportError> {
        if self.network.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send("loopback send refused".into()));
        }
        let remote = {
            let state = self.state.lock();
            if !state.channel_open {
                return Err(TransportError::ChannelClosed);
            }
            state.remote
        };
        let peer = remote
            .and_then(|id| self.network.find(id))
            .ok_or(TransportError::ChannelClosed)?;
        if !peer.is_channel_open() {
            return Err(TransportError::ChannelClosed);
        }
        peer.emit(LinkEvent::Message(payload.to_string()));
        Ok(())
    }

    fn is_channel_open(&self) -> bool {
        self.state.lock().channel_open
    }

    async fn close(&self) {
        let (was_open, remote) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (std::mem::replace(&mut state.channel_open, false), state.remote)
        };
        self.network.links.lock().remove(&self.id);
        if was_open {
            self.emit(LinkEvent::ChannelClosed);
            if let Some(peer) = remote.and_then(|id| self.network.find(id)) {
                peer.remote_closed();
            }
        }
        self.emit(LinkEvent::Connectivity(ConnectivityState::Closed));
        debug!(id = self.id, role = ?self.role, "loopback link closed");
    }
}
