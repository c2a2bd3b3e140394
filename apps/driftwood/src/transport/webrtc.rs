use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    ConnectivityState, GatheringState, LinkEvent, LinkEvents, PeerConnector, PeerLink, Role,
    TransportError, to_setup_error,
};
use crate::codec::{SdpKind, SessionDescription};
use crate::config::{IceServer, SessionConfig};

type SettingFactory = Arc<dyn Fn(Role) -> SettingEngine + Send + Sync>;

fn default_setting(_role: Role) -> SettingEngine {
    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(Duration::from_secs(5)),
        Some(Duration::from_secs(25)),
        Some(Duration::from_secs(2)),
    );
    setting
}

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone(),
        credential: server.credential.clone(),
        ..Default::default()
    }
}

/// Builds peer connections with webrtc-rs.
#[derive(Clone)]
pub struct WebRtcConnector {
    ice_servers: Vec<RTCIceServer>,
    setting: SettingFactory,
}

impl WebRtcConnector {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.iter().map(rtc_ice_server).collect(),
            setting: Arc::new(default_setting),
        }
    }

    /// Replaces the per-connection `SettingEngine`, e.g. to attach a virtual
    /// network or tighten ICE timeouts.
    pub fn with_setting_engine<F>(mut self, factory: F) -> Self
    where
        F: Fn(Role) -> SettingEngine + Send + Sync + 'static,
    {
        self.setting = Arc::new(factory);
        self
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        role: Role,
        events: LinkEvents,
    ) -> Result<Arc<dyn PeerLink>, TransportError> {
        let api = build_api((self.setting)(role))?;
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        tracing::trace!(
            target = "driftwood::transport::webrtc",
            ?role,
            await = "api.new_peer_connection",
            state = "start"
        );
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );
        tracing::trace!(
            target = "driftwood::transport::webrtc",
            ?role,
            await = "api.new_peer_connection",
            state = "end"
        );

        let link = Arc::new(WebRtcLink {
            role,
            pc: Arc::clone(&pc),
            channel: Arc::new(Mutex::new(None)),
            events: events.clone(),
        });

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", ?role, ?state, "peer connection state changed");
                if let Some(mapped) = connectivity(state) {
                    let _ = events.send(LinkEvent::Connectivity(mapped));
                }
            })
        }));

        let gather_events = events.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            let events = gather_events.clone();
            Box::pin(async move {
                tracing::trace!(target = "webrtc", ?role, ?state, "ice gathering state changed");
                let mapped = match state {
                    RTCIceGathererState::New => Some(GatheringState::New),
                    RTCIceGathererState::Gathering => Some(GatheringState::Gathering),
                    RTCIceGathererState::Complete => Some(GatheringState::Complete),
                    _ => None,
                };
                if let Some(mapped) = mapped {
                    let _ = events.send(LinkEvent::Gathering(mapped));
                }
            })
        }));

        if role == Role::Answerer {
            let holder = Arc::clone(&link.channel);
            let channel_events = events;
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let holder = Arc::clone(&holder);
                let events = channel_events.clone();
                Box::pin(async move {
                    {
                        let mut slot = holder.lock();
                        if slot.is_some() {
                            tracing::warn!(
                                target = "webrtc",
                                label = dc.label(),
                                "ignoring additional data channel"
                            );
                            return;
                        }
                        *slot = Some(Arc::clone(&dc));
                    }
                    tracing::debug!(target = "webrtc", label = dc.label(), "data channel received");
                    watch_channel(&dc, events);
                })
            }));
        }

        Ok(link)
    }
}

fn connectivity(state: RTCPeerConnectionState) -> Option<ConnectivityState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectivityState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectivityState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectivityState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectivityState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectivityState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Forwards the lifecycle of `dc` as link events.
fn watch_channel(dc: &Arc<RTCDataChannel>, events: LinkEvents) {
    let announced = Arc::new(AtomicBool::new(false));

    let open_events = events.clone();
    let open_flag = Arc::clone(&announced);
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        let flag = Arc::clone(&open_flag);
        Box::pin(async move {
            if !flag.swap(true, Ordering::SeqCst) {
                tracing::debug!(target = "webrtc", "data channel opened");
                let _ = events.send(LinkEvent::ChannelOpen);
            }
        })
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    tracing::trace!(target = "webrtc", frame_len = text.len(), "received frame");
                    let _ = events.send(LinkEvent::Message(text));
                }
                Err(err) => {
                    tracing::warn!(target = "webrtc", error = %err, "dropping non-utf8 frame");
                }
            }
        })
    }));

    let error_events = events.clone();
    dc.on_error(Box::new(move |err| {
        let events = error_events.clone();
        Box::pin(async move {
            tracing::warn!(target = "webrtc", error = %err, "data channel error");
            let _ = events.send(LinkEvent::Failed(err.to_string()));
        })
    }));

    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            tracing::trace!(target = "webrtc", "data channel closed");
            let _ = events.send(LinkEvent::ChannelClosed);
        })
    }));

    // A channel adopted from the remote side may already be open.
    if dc.ready_state() == RTCDataChannelState::Open && !announced.swap(true, Ordering::SeqCst) {
        let _ = events.send(LinkEvent::ChannelOpen);
    }
}

pub struct WebRtcLink {
    role: Role,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    events: LinkEvents,
}

impl WebRtcLink {
    fn channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.channel.lock().clone()
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    fn role(&self) -> Role {
        self.role
    }

    async fn open_channel(&self, label: &str) -> Result<(), TransportError> {
        if self.role != Role::Offerer {
            return Err(TransportError::Setup(
                "answerer adopts the remote channel".into(),
            ));
        }
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_setup_error)?;
        watch_channel(&dc, self.events.clone());
        *self.channel.lock() = Some(dc);
        Ok(())
    }

    async fn create_local_description(&self) -> Result<(), TransportError> {
        let description = match self.role {
            Role::Offerer => self.pc.create_offer(None).await,
            Role::Answerer => self.pc.create_answer(None).await,
        }
        .map_err(to_setup_error)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_setup_error)?;
        tracing::trace!(
            target = "driftwood::transport::webrtc",
            role = ?self.role,
            "local description set"
        );
        Ok(())
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = to_rtc(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_setup_error)
    }

    async fn gathering_complete(&self) {
        tracing::trace!(
            target = "driftwood::transport::webrtc",
            role = ?self.role,
            await = "pc.gathering_complete_promise",
            state = "start"
        );
        let mut gather = self.pc.gathering_complete_promise().await;
        let _ = gather.recv().await;
        tracing::trace!(
            target = "driftwood::transport::webrtc",
            role = ?self.role,
            await = "pc.gathering_complete_promise",
            state = "end"
        );
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let description = self.pc.local_description().await?;
        match from_rtc(&description) {
            Ok(description) => Some(description),
            Err(err) => {
                tracing::warn!(target = "webrtc", error = %err, "unusable local description");
                None
            }
        }
    }

    async fn send(&self, payload: &str) -> Result<(), TransportError> {
        let dc = self.channel().ok_or(TransportError::ChannelClosed)?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::ChannelClosed);
        }
        tracing::trace!(
            target = "webrtc",
            payload_len = payload.len(),
            "sending frame"
        );
        dc.send_text(payload.to_string())
            .await
            .map(|_| ())
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    fn is_channel_open(&self) -> bool {
        self.channel
            .lock()
            .as_ref()
            .is_some_and(|dc| dc.ready_state() == RTCDataChannelState::Open)
    }

    async fn close(&self) {
        let dc = self.channel.lock().take();
        if let Some(dc) = dc {
            if let Err(err) = dc.close().await {
                tracing::debug!(target = "webrtc", error = %err, "data channel close failed");
            }
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "webrtc", error = %err, "peer connection close failed");
        }
        tracing::debug!(
            target = "driftwood::transport::webrtc",
            role = ?self.role,
            "peer connection closed"
        );
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let SessionDescription { kind, sdp } = description;
    match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp).map_err(to_setup_error),
        SdpKind::Answer => RTCSessionDescription::answer(sdp).map_err(to_setup_error),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(sdp).map_err(to_setup_error),
        SdpKind::Rollback => Err(TransportError::Setup(format!(
            "unsupported sdp type {kind}"
        ))),
    }
}

fn from_rtc(description: &RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(TransportError::Setup("unspecified sdp type".into()));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    })
}
